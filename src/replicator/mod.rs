//! Replicator worker pool
//!
//! A [`Replicator`] leases replication jobs from the current [`WorkQueue`](crate::queue::WorkQueue),
//! copies the content from one randomly chosen source node to the
//! destination node, and acknowledges the lease. Up to `concurrency` worker
//! loops run at once.
//!
//! ```text
//! Stopped ──start()──► AwaitingQueueReady ──queue ready──► Running
//!    ▲        │                                           │    ▲
//!    │        └──────────── queue already ready ──────────┘    │ start()
//!    │                                                   stop()│
//!    └──────────── last worker exits ◄──────────── Draining ◄──┘
//! ```
//!
//! The node map and the queue can be swapped while workers run; each worker
//! picks up the new reference on its next iteration.

mod worker;

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use url::Url;

use crate::config::ReplicatorConfig;
use crate::models::{NodeId, NodeMap, NodeMapError, ReplicationJob};
use crate::queue::{QueueError, SharedQueue};
use crate::transfer::{SharedTransfer, TransferError};

// ============================================================================
// Errors & Events
// ============================================================================

/// Errors raised while submitting or processing jobs
#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error(transparent)]
    Node(#[from] NodeMapError),

    #[error("Job has no source nodes")]
    EmptySources,

    #[error("Malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,
}

impl ReplicatorError {
    /// True when a referenced node id is missing from the map
    pub fn is_unknown_node(&self) -> bool {
        matches!(self, Self::Node(NodeMapError::UnknownNode(_)))
    }
}

/// Lifecycle notifications and asynchronous errors
#[derive(Debug, Clone)]
pub enum ReplicatorEvent {
    /// The current queue became ready
    Ready,
    /// Workers were spawned
    Started,
    /// The last worker exited
    Stopped,
    Error(Arc<ReplicatorError>),
}

/// Lifecycle state of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    AwaitingQueueReady,
    Running,
    Draining,
}

#[derive(Debug)]
struct Lifecycle {
    running: bool,
    state: LifecycleState,
    active: usize,
    ready: bool,
    queue_generation: u64,
}

// ============================================================================
// Replicator
// ============================================================================

struct Inner {
    map: watch::Sender<Arc<NodeMap>>,
    queue: watch::Sender<SharedQueue>,
    transfer: SharedTransfer,
    config: ReplicatorConfig,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<ReplicatorEvent>,
}

/// Concurrency-bounded replication engine
///
/// Cloning yields another handle to the same pool. Must be created inside a
/// tokio runtime.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("concurrency", &self.inner.config.concurrency)
            .field("lifecycle", &*self.inner.lifecycle())
            .finish()
    }
}

impl Replicator {
    /// Build a stopped replicator
    pub fn new(
        queue: SharedQueue,
        map: NodeMap,
        transfer: SharedTransfer,
        config: ReplicatorConfig,
    ) -> Result<Self, ReplicatorError> {
        if config.concurrency == 0 {
            return Err(ReplicatorError::InvalidConcurrency);
        }

        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (map, _) = watch::channel(Arc::new(map));
        let ready = queue.is_ready();
        let (queue_tx, _) = watch::channel(Arc::clone(&queue));

        let replicator = Self {
            inner: Arc::new(Inner {
                map,
                queue: queue_tx,
                transfer,
                config,
                lifecycle: Mutex::new(Lifecycle {
                    running: false,
                    state: LifecycleState::Stopped,
                    active: 0,
                    ready,
                    queue_generation: 0,
                }),
                events,
            }),
        };

        if !ready {
            replicator.inner.watch_readiness(queue, 0);
        }

        Ok(replicator)
    }

    /// Start the worker pool once the queue is ready
    pub fn start(&self) {
        let spawn = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.running = true;

            let state = lifecycle.state;
            match state {
                LifecycleState::Stopped if !lifecycle.ready => {
                    lifecycle.state = LifecycleState::AwaitingQueueReady;
                    tracing::info!("Waiting for queue to become ready");
                    0
                }
                LifecycleState::Stopped | LifecycleState::Draining => {
                    self.inner.enter_running(&mut lifecycle)
                }
                LifecycleState::AwaitingQueueReady | LifecycleState::Running => 0,
            }
        };

        self.inner.spawn_workers(spawn);
    }

    /// Stop the worker pool; each worker finishes its current job first
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle();
        lifecycle.running = false;

        if lifecycle.active == 0 {
            lifecycle.state = LifecycleState::Stopped;
            drop(lifecycle);

            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.emit(ReplicatorEvent::Stopped);
            });
        } else if lifecycle.state == LifecycleState::Running {
            lifecycle.state = LifecycleState::Draining;
            tracing::info!(active = lifecycle.active, "Draining workers");
        }
    }

    /// Replace the node map; takes effect on the next lookup
    pub fn set_map(&self, map: NodeMap) {
        tracing::debug!(nodes = map.len(), "Node map replaced");
        self.inner.map.send_replace(Arc::new(map));
    }

    /// Replace the queue; readiness is re-derived from the new queue
    ///
    /// The previous queue is not closed here; its owner retires it.
    pub fn set_queue(&self, queue: SharedQueue) {
        let ready = queue.is_ready();

        let (generation, spawn) = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.queue_generation += 1;
            lifecycle.ready = ready;
            self.inner.queue.send_replace(Arc::clone(&queue));

            let spawn = if ready
                && lifecycle.running
                && lifecycle.state == LifecycleState::AwaitingQueueReady
            {
                self.inner.enter_running(&mut lifecycle)
            } else {
                0
            };
            (lifecycle.queue_generation, spawn)
        };

        self.inner.spawn_workers(spawn);

        if !ready {
            self.inner.watch_readiness(queue, generation);
        }
    }

    /// Validate and enqueue a replication job
    ///
    /// Every id must be present in the current node map; the first unknown
    /// id is reported and nothing is enqueued. The push is attempted once.
    pub async fn push(
        &self,
        from: Vec<NodeId>,
        to: NodeId,
        path: impl Into<String>,
    ) -> Result<(), ReplicatorError> {
        if from.is_empty() {
            return Err(ReplicatorError::EmptySources);
        }

        let map = self.map();
        if let Some(unknown) = map.first_unknown(from.iter().chain(std::iter::once(&to))) {
            return Err(NodeMapError::UnknownNode(unknown.clone()).into());
        }

        let job = ReplicationJob::new(from, to, path);
        let payload = job.to_payload()?;
        self.queue().push(payload).await?;

        tracing::debug!(to = %job.to, path = %job.path, "Job enqueued");
        Ok(())
    }

    /// `http://host:port{path}` for `id` in the current map
    pub fn resolve_url(&self, id: &NodeId, path: &str) -> Result<Url, ReplicatorError> {
        Ok(self.map().resolve_url(id, path)?)
    }

    /// Snapshot of the current node map
    pub fn map(&self) -> Arc<NodeMap> {
        self.inner.map.borrow().clone()
    }

    /// Current queue
    pub fn queue(&self) -> SharedQueue {
        self.inner.queue.borrow().clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.lifecycle().running
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lifecycle().ready
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle().state
    }

    pub fn active_workers(&self) -> usize {
        self.inner.lifecycle().active
    }

    pub fn concurrency(&self) -> usize {
        self.inner.config.concurrency
    }

    /// Subscribe to lifecycle events and errors; past events are not replayed
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicatorEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ReplicatorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: ReplicatorError) {
        tracing::warn!(error = %error, "Replicator error");
        self.emit(ReplicatorEvent::Error(Arc::new(error)));
    }

    /// Move to Running and return how many workers to add
    fn enter_running(&self, lifecycle: &mut Lifecycle) -> usize {
        lifecycle.state = LifecycleState::Running;
        let missing = self.config.concurrency.saturating_sub(lifecycle.active);
        lifecycle.active += missing;

        tracing::info!(workers = lifecycle.active, "Replicator started");
        self.emit(ReplicatorEvent::Started);
        missing
    }

    fn spawn_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            tokio::spawn(worker::run(Arc::clone(self)));
        }
    }

    /// Mark the queue of `generation` ready once it reports readiness
    fn watch_readiness(self: &Arc<Self>, queue: SharedQueue, generation: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            queue.wait_ready().await;
            inner.on_queue_ready(generation);
        });
    }

    fn on_queue_ready(self: &Arc<Self>, generation: u64) {
        let spawn = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.queue_generation != generation || lifecycle.ready {
                return;
            }

            lifecycle.ready = true;
            tracing::info!("Queue is ready");
            self.emit(ReplicatorEvent::Ready);

            if lifecycle.running && lifecycle.state == LifecycleState::AwaitingQueueReady {
                self.enter_running(&mut lifecycle)
            } else {
                0
            }
        };

        self.spawn_workers(spawn);
    }

    /// Called by a worker before each dequeue; false means exit now
    fn keep_running(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.running {
            return true;
        }

        lifecycle.active = lifecycle.active.saturating_sub(1);
        if lifecycle.active == 0 {
            lifecycle.state = LifecycleState::Stopped;
            tracing::info!("Replicator stopped");
            self.emit(ReplicatorEvent::Stopped);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Endpoint;
    use crate::queue::{MemoryQueue, WorkQueue};
    use crate::transfer::Transfer;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopTransfer;

    #[async_trait]
    impl Transfer for NoopTransfer {
        async fn transfer(&self, _: &Url, _: &Url) -> Result<(), TransferError> {
            Ok(())
        }
    }

    fn node_map() -> NodeMap {
        [
            (NodeId::from(1), Endpoint::new("node-1", 8080)),
            (NodeId::from(2), Endpoint::new("node-2", 8080)),
        ]
        .into_iter()
        .collect()
    }

    fn config(concurrency: usize) -> ReplicatorConfig {
        ReplicatorConfig {
            backoff_ms: 10,
            ..ReplicatorConfig::with_concurrency(concurrency)
        }
    }

    fn replicator(queue: MemoryQueue, concurrency: usize) -> Replicator {
        Replicator::new(Arc::new(queue), node_map(), Arc::new(NoopTransfer), config(concurrency))
            .unwrap()
    }

    async fn next_lifecycle_event(rx: &mut broadcast::Receiver<ReplicatorEvent>) -> ReplicatorEvent {
        loop {
            match rx.recv().await.unwrap() {
                ReplicatorEvent::Error(_) => continue,
                event => return event,
            }
        }
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let result = Replicator::new(
            Arc::new(MemoryQueue::new()),
            node_map(),
            Arc::new(NoopTransfer),
            config(0),
        );
        assert!(matches!(result, Err(ReplicatorError::InvalidConcurrency)));
    }

    #[tokio::test]
    async fn test_resolve_url() {
        let replicator = replicator(MemoryQueue::new(), 1);
        let url = replicator.resolve_url(&NodeId::from(2), "/lol").unwrap();
        assert_eq!(url.as_str(), "http://node-2:8080/lol");
        assert!(replicator
            .resolve_url(&NodeId::from(3), "/lol")
            .unwrap_err()
            .is_unknown_node());
    }

    #[tokio::test]
    async fn test_push_rejects_empty_sources() {
        let queue = MemoryQueue::new();
        let replicator = replicator(queue.clone(), 1);
        let result = replicator.push(vec![], NodeId::from(1), "/x").await;
        assert!(matches!(result, Err(ReplicatorError::EmptySources)));
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_waits_for_queue() {
        let queue = MemoryQueue::not_ready();
        let replicator = replicator(queue.clone(), 2);
        let mut events = replicator.subscribe();

        replicator.start();
        assert_eq!(replicator.state(), LifecycleState::AwaitingQueueReady);
        assert_eq!(replicator.active_workers(), 0);

        queue.mark_ready();
        assert!(matches!(next_lifecycle_event(&mut events).await, ReplicatorEvent::Ready));
        assert!(matches!(next_lifecycle_event(&mut events).await, ReplicatorEvent::Started));
        assert_eq!(replicator.state(), LifecycleState::Running);
        assert_eq!(replicator.active_workers(), 2);

        replicator.stop();
        assert!(matches!(next_lifecycle_event(&mut events).await, ReplicatorEvent::Stopped));
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_never_spawns() {
        let queue = MemoryQueue::not_ready();
        let replicator = replicator(queue.clone(), 3);
        let mut events = replicator.subscribe();

        replicator.start();
        replicator.stop();
        assert!(matches!(next_lifecycle_event(&mut events).await, ReplicatorEvent::Stopped));

        queue.mark_ready();
        assert!(matches!(next_lifecycle_event(&mut events).await, ReplicatorEvent::Ready));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(replicator.active_workers(), 0);
        assert_eq!(replicator.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_stale_queue_readiness_ignored() {
        let stale = MemoryQueue::not_ready();
        let replicator = replicator(stale.clone(), 1);

        let current = MemoryQueue::not_ready();
        replicator.set_queue(Arc::new(current.clone()));

        stale.mark_ready();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!replicator.is_ready());

        current.mark_ready();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(replicator.is_ready());
    }

    #[tokio::test]
    async fn test_ready_queue_swap_releases_pending_start() {
        let replicator = replicator(MemoryQueue::not_ready(), 2);
        let mut events = replicator.subscribe();

        replicator.start();
        replicator.set_queue(Arc::new(MemoryQueue::new()));

        assert!(matches!(next_lifecycle_event(&mut events).await, ReplicatorEvent::Started));
        assert_eq!(replicator.active_workers(), 2);
        replicator.stop();
    }
}
