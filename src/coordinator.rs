//! Coordinator subsystem.
//!
//! The coordinator owns the set of connected agent sessions and fans every
//! allow-list change out to them.  Each session gets its own delivery task
//! that:
//!
//! * first replays the full registry as `add` events, then
//! * forwards broadcast frames in the order they were broadcast.
//!
//! Frames are pushed onto the session's bounded outbound queue without
//! blocking.  A full queue is retried a fixed number of times at a fixed
//! interval, after which the frame is dropped for that session only.  Each
//! frame also carries a deadline set when it was broadcast, so frames stuck
//! behind a slow one expire on their own schedule.  A
//! dropped frame is not resent until the agent reconnects and receives a
//! fresh replay; deletions missed while disconnected are never replayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::address::Target;
use crate::error::{RegistryError, SubmitError};
use crate::registry::Registry;
use crate::types::{Action, Entry, Event};

pub type SessionId = u64;

/// How hard delivery tries before dropping a frame for one session.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl DeliveryPolicy {
    /// How long a frame may wait for delivery, counted from its broadcast.
    pub fn window(&self) -> Duration {
        self.interval * self.attempts
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.window()
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_millis(500),
        }
    }
}

/// One connected agent as seen by the coordinator.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    hostname: String,
    outbound: mpsc::Sender<String>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Registry-side handle kept in the session set.
struct Lane {
    hostname: String,
    frames: mpsc::UnboundedSender<Outgoing>,
}

/// A frame waiting for its session's outbound queue.
struct Outgoing {
    frame: String,
    deadline: Instant,
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Sent,
    Dropped,
    Closed,
}

pub struct Coordinator {
    registry: Arc<dyn Registry>,
    sessions: Mutex<HashMap<SessionId, Lane>>,
    policy: DeliveryPolicy,
    next_id: AtomicU64,
}

impl Coordinator {
    pub fn new(registry: Arc<dyn Registry>, policy: DeliveryPolicy) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Creates a session for `hostname` whose frames go to `outbound`.  The
    /// session is not live until it is registered.
    pub fn session(
        &self,
        hostname: impl Into<String>,
        outbound: mpsc::Sender<String>,
    ) -> Session {
        Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            hostname: hostname.into(),
            outbound,
        }
    }

    /// Adds `session` to the live set and starts its delivery task, which
    /// replays the registry before forwarding any broadcast.
    pub async fn register(&self, session: Session) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let connected = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                session.id,
                Lane {
                    hostname: session.hostname.clone(),
                    frames: frames_tx,
                },
            );
            sessions.len()
        };
        info!(
            "Node {} registered as session {}, {} connected",
            session.hostname, session.id, connected
        );

        let registry = Arc::clone(&self.registry);
        let policy = self.policy;
        tokio::spawn(async move {
            run_delivery(session, frames_rx, registry, policy).await;
        });
    }

    /// Entry point for the transport when a node connects.
    pub async fn on_node_connect(&self, session: Session) {
        self.register(session).await;
    }

    /// Removes a session from the live set.  Returns false when it was
    /// already gone.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.remove(&id) {
            Some(lane) => {
                info!(
                    "Node {} unregistered (session {}), {} connected",
                    lane.hostname,
                    id,
                    sessions.len()
                );
                true
            }
            None => false,
        }
    }

    /// Hands `event` to every live session.  Never waits on a session;
    /// returns how many sessions accepted the frame for delivery.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize event for {}: {}", event.address(), e);
                return 0;
            }
        };

        let deadline = self.policy.deadline();
        let sessions = self.sessions.lock().await;
        let mut queued = 0;
        for (id, lane) in sessions.iter() {
            let outgoing = Outgoing {
                frame: frame.clone(),
                deadline,
            };
            if lane.frames.send(outgoing).is_ok() {
                queued += 1;
            } else {
                debug!("Delivery task for session {} already stopped", id);
            }
        }
        debug!("Broadcast {} to {} sessions", frame, queued);
        queued
    }

    /// Writes `target` to the registry and broadcasts the change.
    ///
    /// Adds are broadcast even when the address is already registered so
    /// that lagging agents catch up.  A delete is rejected as a whole if any
    /// of its addresses is immutable.  Returns the number of addresses
    /// touched.
    pub async fn submit(
        &self,
        action: Action,
        target: &Target,
        immutable: bool,
    ) -> Result<usize, SubmitError> {
        let addresses = target.addresses();
        match action {
            Action::Add => {
                let origin = target.origin();
                for address in &addresses {
                    let entry = Entry::new(address.clone(), origin.clone(), immutable);
                    if self.registry.add(entry).await? {
                        info!("Registered {} from {}", address, target);
                    }
                    self.broadcast(&Event::add(address.clone())).await;
                }
            }
            Action::Delete => {
                for address in &addresses {
                    if self.registry.query_immutable(address).await? {
                        return Err(SubmitError::Immutable(address.clone()));
                    }
                }
                for address in &addresses {
                    self.registry.delete(address).await?;
                    info!("Removed {} from {}", address, target);
                    self.broadcast(&Event::delete(address.clone())).await;
                }
            }
            Action::Unknown => return Err(SubmitError::UnsupportedAction),
        }
        Ok(addresses.len())
    }

    /// Snapshot of the registry.
    pub async fn current_state(&self) -> Result<Vec<Entry>, RegistryError> {
        self.registry.query_all().await
    }

    pub async fn sessions(&self) -> Vec<(SessionId, String)> {
        let sessions = self.sessions.lock().await;
        let mut list: Vec<_> = sessions
            .iter()
            .map(|(id, lane)| (*id, lane.hostname.clone()))
            .collect();
        list.sort();
        list
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

async fn run_delivery(
    session: Session,
    mut frames: mpsc::UnboundedReceiver<Outgoing>,
    registry: Arc<dyn Registry>,
    policy: DeliveryPolicy,
) {
    if replay(&session, registry.as_ref(), policy).await == Delivery::Closed {
        debug!("Session {} closed during replay", session.id);
        return;
    }
    while let Some(outgoing) = frames.recv().await {
        if send_with_retry(&session, outgoing, policy).await == Delivery::Closed {
            break;
        }
    }
    debug!("Delivery to {} (session {}) finished", session.hostname, session.id);
}

async fn replay(session: &Session, registry: &dyn Registry, policy: DeliveryPolicy) -> Delivery {
    let entries = match registry.query_all().await {
        Ok(entries) => entries,
        Err(e) => {
            error!(
                "Failed to query registry for replay to {}: {}",
                session.hostname, e
            );
            return Delivery::Dropped;
        }
    };
    info!("Replaying {} entries to {}", entries.len(), session.hostname);
    for entry in entries {
        let frame = match Event::add(entry.address).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize replay event: {}", e);
                continue;
            }
        };
        let outgoing = Outgoing {
            frame,
            deadline: policy.deadline(),
        };
        if send_with_retry(session, outgoing, policy).await == Delivery::Closed {
            return Delivery::Closed;
        }
    }
    Delivery::Sent
}

/// Tries `outgoing` until it is queued, the attempts run out, or its
/// deadline passes.  An already expired frame is dropped without a try.
async fn send_with_retry(
    session: &Session,
    outgoing: Outgoing,
    policy: DeliveryPolicy,
) -> Delivery {
    let Outgoing {
        mut frame,
        deadline,
    } = outgoing;
    let mut attempt = 0;
    while attempt < policy.attempts && Instant::now() < deadline {
        attempt += 1;
        match session.outbound.try_send(frame) {
            Ok(()) => {
                if attempt > 1 {
                    info!("Delivered to {} on attempt {}", session.hostname, attempt);
                }
                return Delivery::Sent;
            }
            Err(TrySendError::Full(back)) => {
                if attempt == 1 {
                    warn!("Outbound queue for {} is full, retrying", session.hostname);
                }
                frame = back;
                if attempt < policy.attempts {
                    sleep(policy.interval).await;
                }
            }
            Err(TrySendError::Closed(_)) => return Delivery::Closed,
        }
    }
    error!(
        "Dropping message for {} after {} attempts: {}",
        session.hostname, attempt, frame
    );
    Delivery::Dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Origin;
    use crate::registry::MemoryRegistry;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn coordinator_with(registry: MemoryRegistry, policy: DeliveryPolicy) -> Coordinator {
        Coordinator::new(Arc::new(registry), policy)
    }

    async fn next_event(rx: &mut mpsc::Receiver<String>) -> Event {
        let frame = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        Event::from_frame(&frame).unwrap()
    }

    #[tokio::test]
    async fn replay_reaches_new_session_before_later_broadcasts() {
        let registry = MemoryRegistry::new();
        registry
            .add(Entry::new("1.2.3.4", Origin::Address, false))
            .await
            .unwrap();
        registry
            .add(Entry::new("10.0.0.5", Origin::Address, false))
            .await
            .unwrap();
        let coordinator = coordinator_with(registry, DeliveryPolicy::default());

        let (tx, mut rx) = mpsc::channel(16);
        coordinator.register(coordinator.session("node-a", tx)).await;
        coordinator.broadcast(&Event::add("5.6.7.8")).await;

        let first = next_event(&mut rx).await;
        let second = next_event(&mut rx).await;
        let replayed: HashSet<_> = [first.clone(), second.clone()]
            .iter()
            .map(|e| (e.action(), e.address().to_string(), e.is_local_net()))
            .collect();
        assert_eq!(
            replayed,
            HashSet::from([
                (Action::Add, "1.2.3.4".to_string(), false),
                (Action::Add, "10.0.0.5".to_string(), true),
            ])
        );
        assert_eq!(next_event(&mut rx).await, Event::add("5.6.7.8"));
    }

    #[tokio::test]
    async fn full_session_does_not_hold_up_healthy_one() {
        let coordinator = coordinator_with(MemoryRegistry::new(), DeliveryPolicy::default());

        let (healthy_tx, mut healthy_rx) = mpsc::channel(16);
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        stuck_tx.try_send("filler".to_string()).unwrap();

        coordinator
            .register(coordinator.session("healthy", healthy_tx))
            .await;
        coordinator
            .register(coordinator.session("stuck", stuck_tx))
            .await;

        assert_eq!(coordinator.broadcast(&Event::add("8.8.8.8")).await, 2);

        let frame = timeout(Duration::from_millis(300), healthy_rx.recv())
            .await
            .expect("healthy session waited on the stuck one")
            .unwrap();
        assert_eq!(Event::from_frame(&frame).unwrap(), Event::add("8.8.8.8"));
    }

    #[tokio::test]
    async fn frame_is_dropped_after_bounded_attempts() {
        let policy = DeliveryPolicy {
            attempts: 3,
            interval: Duration::from_millis(10),
        };
        let coordinator = coordinator_with(MemoryRegistry::new(), policy);

        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send("filler".to_string()).unwrap();
        coordinator.register(coordinator.session("slow", tx)).await;
        coordinator.broadcast(&Event::add("8.8.8.8")).await;

        // Three attempts with 10ms gaps are done well within this window.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("filler"));

        coordinator.broadcast(&Event::add("9.9.9.9")).await;
        assert_eq!(next_event(&mut rx).await, Event::add("9.9.9.9"));
    }

    #[tokio::test]
    async fn frames_queued_behind_a_stuck_one_expire_on_their_own_deadline() {
        let policy = DeliveryPolicy {
            attempts: 3,
            interval: Duration::from_millis(20),
        };
        let coordinator = coordinator_with(MemoryRegistry::new(), policy);

        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send("filler".to_string()).unwrap();
        coordinator.register(coordinator.session("stuck", tx)).await;
        for i in 1..=20u8 {
            coordinator
                .broadcast(&Event::add(Ipv4Addr::new(8, 8, 8, i).to_string()))
                .await;
        }

        // every frame's window closed long before this
        sleep(policy.window() * 5).await;
        assert_eq!(rx.recv().await.as_deref(), Some("filler"));
        let late = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(late.is_err(), "expired frame was delivered: {:?}", late);

        coordinator.broadcast(&Event::add("9.9.9.9")).await;
        assert_eq!(next_event(&mut rx).await, Event::add("9.9.9.9"));
    }

    #[tokio::test]
    async fn broadcasts_keep_their_order_per_session() {
        let coordinator = coordinator_with(MemoryRegistry::new(), DeliveryPolicy::default());
        let (tx, mut rx) = mpsc::channel(64);
        coordinator.register(coordinator.session("node", tx)).await;

        for i in 1..=20u8 {
            coordinator
                .broadcast(&Event::add(Ipv4Addr::new(8, 8, 8, i).to_string()))
                .await;
        }
        for i in 1..=20u8 {
            assert_eq!(
                next_event(&mut rx).await.address(),
                Ipv4Addr::new(8, 8, 8, i).to_string()
            );
        }
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_releases_queue() {
        let coordinator = coordinator_with(MemoryRegistry::new(), DeliveryPolicy::default());
        let (tx, mut rx) = mpsc::channel(4);
        let session = coordinator.session("node", tx);
        let id = session.id();
        coordinator.register(session).await;
        assert_eq!(coordinator.session_count().await, 1);

        assert!(coordinator.unregister(id).await);
        assert!(!coordinator.unregister(id).await);
        assert_eq!(coordinator.session_count().await, 0);
        assert_eq!(coordinator.broadcast(&Event::add("8.8.8.8")).await, 0);

        let closed = timeout(WAIT, rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn submit_writes_registry_then_broadcasts() {
        let coordinator = coordinator_with(MemoryRegistry::new(), DeliveryPolicy::default());
        let (tx, mut rx) = mpsc::channel(16);
        coordinator.register(coordinator.session("node", tx)).await;

        let target = Target::DomainDerived {
            domain: "example.com".into(),
            addresses: vec![Ipv4Addr::new(93, 184, 216, 34)],
        };
        assert_eq!(coordinator.submit(Action::Add, &target, false).await.unwrap(), 1);
        assert_eq!(next_event(&mut rx).await, Event::add("93.184.216.34"));

        let state = coordinator.current_state().await.unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].origin.domain(), Some("example.com"));

        coordinator.submit(Action::Delete, &target, false).await.unwrap();
        // replay may already have carried the add, so a second copy can
        // arrive ahead of the delete
        loop {
            let event = next_event(&mut rx).await;
            if event == Event::delete("93.184.216.34") {
                break;
            }
            assert_eq!(event, Event::add("93.184.216.34"));
        }
        assert!(coordinator.current_state().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_of_immutable_entry_is_rejected_without_broadcast() {
        let coordinator = coordinator_with(MemoryRegistry::new(), DeliveryPolicy::default());
        let target = Target::Address(Ipv4Addr::new(10, 0, 0, 5));
        coordinator.submit(Action::Add, &target, false).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        coordinator.register(coordinator.session("node", tx)).await;
        // replay of the existing entry
        assert_eq!(next_event(&mut rx).await, Event::add("10.0.0.5"));

        let err = coordinator
            .submit(Action::Delete, &target, false)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Immutable(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(coordinator.current_state().await.unwrap().len(), 1);
    }
}
