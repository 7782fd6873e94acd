//! Agent side of the transport.
//!
//! The client cycles through `Disconnected → Connecting → Connected` forever.
//! Any dial or read error drops back to `Disconnected` and a new attempt is
//! made after a fixed delay.  Nothing is persisted between connections: the
//! coordinator replays its registry on every fresh connection.

use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::WS_PATH;
use crate::agent::QueueHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct NodeClient {
    url: String,
    queue: QueueHandle,
    reconnect_delay: Duration,
    heartbeat_interval: Duration,
    state: watch::Sender<ConnectionState>,
}

impl NodeClient {
    /// `server` is the coordinator's `host:port`.
    pub fn new(server: &str, hostname: &str, queue: QueueHandle) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: format!(
                "ws://{}{}?hostname={}",
                server,
                WS_PATH,
                urlencoding::encode(hostname)
            ),
            queue,
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            state,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connects and pumps events into the agent queue, reconnecting forever.
    pub async fn run(self) {
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            info!("Connecting to coordinator at {}", self.url);
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    self.state.send_replace(ConnectionState::Connected);
                    info!("Connected to coordinator");
                    self.pump(ws).await;
                }
                Err(e) => {
                    error!(
                        "Failed to connect to coordinator: {}. Retrying in {:?}...",
                        e, self.reconnect_delay
                    );
                }
            }
            self.state.send_replace(ConnectionState::Disconnected);
            sleep(self.reconnect_delay).await;
        }
    }

    async fn pump(&self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut sink, mut stream) = ws.split();

        let interval = self.heartbeat_interval;
        let _heartbeat = AbortOnDrop(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let beat = Utc::now().to_rfc3339();
                if let Err(e) = sink.send(Message::text(beat)).await {
                    warn!("Failed to send heartbeat: {}", e);
                    break;
                }
            }
        }));

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    self.queue.push_frame(text.as_str()).await;
                }
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        self.queue.push_frame(text).await;
                    }
                    Err(e) => warn!("Discarding non UTF-8 binary frame: {}", e),
                },
                Ok(Message::Close(frame)) => {
                    info!("Coordinator closed the connection: {:?}", frame);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to read from coordinator: {}", e);
                    break;
                }
            }
        }

        warn!("Disconnected from coordinator");
    }
}

/// Stops the heartbeat pump with the read pump, even if the client task
/// itself is aborted.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
