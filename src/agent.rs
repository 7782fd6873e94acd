//! Node agent: drives the local packet filter toward the stream of events
//! received from the coordinator.
//!
//! Events land in a bounded queue shared by a fixed pool of workers.  A
//! worker applies one event at a time; if any step fails the whole event is
//! put back at the tail of the queue and the worker moves on.  There is no
//! retry limit, so every filter primitive must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{DecodeError, StartupError};
use crate::filter::Filter;
use crate::policy;
use crate::types::Event;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Maximum number of events applied concurrently.
    pub workers: usize,
    pub queue_capacity: usize,
    /// Pause before a failed event re-enters the queue.
    pub requeue_delay: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 10_000,
            requeue_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct Job {
    event: Event,
    attempt: u32,
}

/// Producer side of the agent queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Job>,
}

impl QueueHandle {
    /// Enqueues `event`, waiting for room.  Returns false once the agent is
    /// gone.
    pub async fn push(&self, event: Event) -> bool {
        self.tx.send(Job { event, attempt: 1 }).await.is_ok()
    }

    /// Decodes a frame from the coordinator and enqueues it.  Malformed
    /// frames and empty addresses are logged and dropped.
    pub async fn push_frame(&self, frame: &str) -> bool {
        match Event::from_frame(frame) {
            Ok(event) => {
                info!("Received {} for {}", event.action(), event.address());
                if !self.push(event).await {
                    error!("Agent queue is closed, dropping {}", frame);
                    return false;
                }
                true
            }
            Err(DecodeError::EmptyAddress) => {
                info!("Ignoring message with empty address: {}", frame);
                false
            }
            Err(e) => {
                warn!("Failed to decode message {}: {}", frame, e);
                false
            }
        }
    }

    /// Events currently waiting for a worker.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub struct Agent {
    filter: Arc<dyn Filter>,
    queue: QueueHandle,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(filter: Arc<dyn Filter>, options: AgentOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        Self {
            filter,
            queue: QueueHandle { tx },
            jobs: Arc::new(Mutex::new(rx)),
            options,
        }
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue.clone()
    }

    /// Verifies forwarding and installs the baseline rules.  The catch-all
    /// deny is appended last because the first matching rule wins.
    pub async fn prepare(&self) -> Result<(), StartupError> {
        match self.filter.forwarding_enabled().await {
            Ok(true) => {}
            Ok(false) => return Err(StartupError::ForwardingDisabled),
            Err(e) => return Err(StartupError::ForwardingCheck(e)),
        }
        self.filter
            .install_reserved_range_allowlist()
            .await
            .map_err(StartupError::ReservedRanges)?;
        self.filter
            .ensure_forward_accept_policy()
            .await
            .map_err(StartupError::ForwardPolicy)?;
        self.filter
            .install_catch_all_deny()
            .await
            .map_err(StartupError::CatchAllDeny)?;
        info!("Baseline filter rules installed");
        Ok(())
    }

    /// Starts the worker pool.  Workers run until the queue closes, which
    /// in practice is process exit.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        info!("Starting {} workers", self.options.workers);
        (0..self.options.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    filter: Arc::clone(&self.filter),
                    jobs: Arc::clone(&self.jobs),
                    queue: self.queue.clone(),
                    requeue_delay: self.options.requeue_delay,
                };
                tokio::spawn(worker.run())
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    filter: Arc<dyn Filter>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    queue: QueueHandle,
    requeue_delay: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = self.jobs.lock().await.recv().await;
            let Some(job) = next else {
                debug!("Worker {} stopping, queue closed", self.id);
                return;
            };
            self.apply(job).await;
        }
    }

    async fn apply(&self, job: Job) {
        let event = &job.event;
        let Some(steps) = policy::plan(event) else {
            warn!(
                "Unknown action {} for {}, not processing",
                event.action(),
                event.address()
            );
            return;
        };

        for step in steps {
            if let Err(e) = step.run(self.filter.as_ref(), event.address()).await {
                error!(
                    "{:?} failed for {} (attempt {}): {}, requeueing",
                    step,
                    event.address(),
                    job.attempt,
                    e
                );
                self.requeue(job);
                return;
            }
        }
        info!(
            "Applied {} {} (local: {})",
            event.action(),
            event.address(),
            event.is_local_net()
        );
    }

    /// Puts a failed job back at the tail of the queue without tying up the
    /// worker.
    fn requeue(&self, job: Job) {
        let queue = self.queue.clone();
        let delay = self.requeue_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let retry = Job {
                attempt: job.attempt + 1,
                event: job.event,
            };
            if queue.tx.send(retry).await.is_err() {
                error!("Agent queue is closed, giving up on requeue");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MemoryFilter, Primitive, Rule};
    use crate::types::Action;
    use tokio::time::{timeout, Instant};

    fn agent_with(filter: Arc<MemoryFilter>, workers: usize) -> Agent {
        Agent::new(
            filter,
            AgentOptions {
                workers,
                queue_capacity: 10_000,
                requeue_delay: Duration::from_millis(5),
            },
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    fn remote_rules(address: &str) -> [Rule; 4] {
        [
            Rule::Accept(address.into()),
            Rule::Masquerade(address.into()),
            Rule::ForwardFrom(address.into()),
            Rule::ForwardTo(address.into()),
        ]
    }

    #[tokio::test]
    async fn prepare_appends_deny_after_accepts() {
        let filter = Arc::new(MemoryFilter::new());
        let agent = agent_with(Arc::clone(&filter), 1);
        agent.prepare().await.unwrap();

        let rules = filter.rules();
        assert_eq!(rules.last(), Some(&Rule::Deny));
        assert!(rules.contains(&Rule::Accept("172.16.0.0/12".into())));
        assert!(filter.forward_policy_accepts());
    }

    #[tokio::test]
    async fn prepare_fails_without_forwarding() {
        let filter = Arc::new(MemoryFilter::new().with_forwarding(false));
        let agent = agent_with(Arc::clone(&filter), 1);
        let err = agent.prepare().await.unwrap_err();
        assert!(matches!(err, StartupError::ForwardingDisabled));
        assert!(filter.rules().is_empty());
    }

    #[tokio::test]
    async fn prepare_reports_failed_baseline() {
        let filter = Arc::new(MemoryFilter::new());
        filter.fail(Primitive::CatchAllDeny, "", 1);
        let agent = agent_with(Arc::clone(&filter), 1);
        let err = agent.prepare().await.unwrap_err();
        assert!(matches!(err, StartupError::CatchAllDeny(_)));
    }

    #[tokio::test]
    async fn duplicate_add_leaves_single_rule_set() {
        let filter = Arc::new(MemoryFilter::new());
        let agent = agent_with(Arc::clone(&filter), 1);
        agent.spawn_workers();
        let queue = agent.queue();

        queue.push(Event::add("8.8.8.8")).await;
        queue.push(Event::add("8.8.8.8")).await;
        wait_until(|| filter.calls() == 6).await;

        let rules = filter.rules();
        assert_eq!(rules.len(), 4);
        for rule in remote_rules("8.8.8.8") {
            assert_eq!(rules.iter().filter(|r| **r == rule).count(), 1);
        }
    }

    #[tokio::test]
    async fn local_add_installs_accept_only() {
        let filter = Arc::new(MemoryFilter::new());
        let agent = agent_with(Arc::clone(&filter), 2);
        agent.spawn_workers();

        agent.queue().push(Event::add("10.0.0.5")).await;
        wait_until(|| filter.has_rule(&Rule::Accept("10.0.0.5".into()))).await;
        assert_eq!(filter.rules(), vec![Rule::Accept("10.0.0.5".into())]);
    }

    #[tokio::test]
    async fn failing_step_requeues_until_converged() {
        let filter = Arc::new(MemoryFilter::new());
        filter.fail(Primitive::InstallAccept, "8.8.8.8", 2);
        let agent = agent_with(Arc::clone(&filter), 3);
        agent.spawn_workers();

        agent.queue().push(Event::add("8.8.8.8")).await;
        wait_until(|| remote_rules("8.8.8.8").iter().all(|r| filter.has_rule(r))).await;
        // two failed accepts, then accept + masquerade + forward
        assert_eq!(filter.calls(), 5);
    }

    #[tokio::test]
    async fn partial_failure_is_completed_on_retry() {
        let filter = Arc::new(MemoryFilter::new());
        filter.fail(Primitive::InstallForward, "1.1.1.1", 1);
        let agent = agent_with(Arc::clone(&filter), 1);
        agent.spawn_workers();

        agent.queue().push(Event::add("1.1.1.1")).await;
        wait_until(|| filter.has_rule(&Rule::ForwardTo("1.1.1.1".into()))).await;
        assert_eq!(filter.rules().len(), 4);
    }

    #[tokio::test]
    async fn delete_removes_what_add_installed() {
        let filter = Arc::new(MemoryFilter::new());
        let agent = agent_with(Arc::clone(&filter), 1);
        agent.spawn_workers();
        let queue = agent.queue();

        queue.push(Event::add("9.9.9.9")).await;
        wait_until(|| filter.rules().len() == 4).await;
        queue.push(Event::delete("9.9.9.9")).await;
        wait_until(|| filter.rules().is_empty()).await;
    }

    #[tokio::test]
    async fn worker_pool_caps_concurrent_primitives() {
        let filter = Arc::new(MemoryFilter::new().with_latency(Duration::from_millis(2)));
        let agent = agent_with(Arc::clone(&filter), 10);
        agent.spawn_workers();
        let queue = agent.queue();

        for i in 0..100u32 {
            let address = format!("8.8.{}.{}", i / 256, i % 256 + 1);
            queue.push(Event::add(address)).await;
        }
        wait_until(|| filter.calls() == 300).await;

        assert!(filter.peak_in_flight() <= 10);
        assert!(filter.peak_in_flight() > 1);
        assert_eq!(filter.rules().len(), 400);
    }

    #[tokio::test]
    async fn unknown_action_is_dropped() {
        let filter = Arc::new(MemoryFilter::new());
        let agent = agent_with(Arc::clone(&filter), 1);
        agent.spawn_workers();
        let queue = agent.queue();

        queue.push(Event::new(Action::Unknown, "1.2.3.4")).await;
        queue.push(Event::add("10.1.1.1")).await;
        wait_until(|| filter.calls() == 1).await;
        sleep(Duration::from_millis(20)).await;
        assert_eq!(filter.calls(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn empty_address_frame_never_enters_queue() {
        let filter = Arc::new(MemoryFilter::new());
        let agent = agent_with(Arc::clone(&filter), 1);
        let queue = agent.queue();

        let accepted = queue
            .push_frame(r#"{"action":"add","ip":"","isLocalNet":false}"#)
            .await;
        assert!(!accepted);
        assert!(!queue.push_frame("not json").await);
        assert_eq!(queue.pending(), 0);

        assert!(
            queue
                .push_frame(r#"{"action":"add","ip":"8.8.8.8","isLocalNet":true}"#)
                .await
        );
        assert_eq!(queue.pending(), 1);

        agent.spawn_workers();
        let result = timeout(
            Duration::from_secs(5),
            wait_until(|| filter.rules().len() == 4),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(filter.calls(), 3);
    }
}
