//! Coordinator side of the transport: accepts agent connections and runs
//! one read pump and one write pump per session.  The connection lives only
//! as long as both pumps do.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use super::hostname_from_query;
use crate::coordinator::Coordinator;

/// Binds the coordinator listener.  A failure here is fatal for startup.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind coordinator listener on {}", addr))?;
    info!("Coordinator listening on {}", addr);
    Ok(listener)
}

/// Accepts agent connections on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    outbound_capacity: usize,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            handle_connection(stream, peer, coordinator, outbound_capacity).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
    outbound_capacity: usize,
) {
    let mut hostname = None;
    let callback =
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            hostname = hostname_from_query(request.uri().query());
            Ok(response)
        };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let hostname = hostname.unwrap_or_else(|| peer.to_string());
    let (mut sink, mut stream) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(outbound_capacity.max(1));
    let session = coordinator.session(hostname.clone(), outbound_tx);
    let id = session.id();
    coordinator.on_node_connect(session).await;

    let mut writer = {
        let coordinator = Arc::clone(&coordinator);
        let hostname = hostname.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::text(frame)).await {
                    warn!("Failed to write to {}: {}", hostname, e);
                    coordinator.unregister(id).await;
                    break;
                }
            }
            let _ = sink.close().await;
        })
    };

    let reader = async {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Close(frame)) => {
                    info!("Node {} closed the connection: {:?}", hostname, frame);
                    break;
                }
                Ok(message) => {
                    debug!(
                        "Heartbeat from {}: {}",
                        hostname,
                        message.to_text().unwrap_or("<binary>")
                    );
                }
                Err(e) => {
                    warn!("Failed to read from {}: {}", hostname, e);
                    break;
                }
            }
        }
    };

    // Whichever pump stops first ends the session; dropping the read half
    // with the write half closes the socket so the node reconnects.
    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {
            info!("Write pump for {} stopped, closing connection", hostname);
        }
    }

    coordinator.unregister(id).await;
    writer.abort();
}
