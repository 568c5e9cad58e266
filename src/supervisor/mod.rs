//! Coordination-driven supervisor
//!
//! The [`Supervisor`] keeps a session with the coordination service, watches
//! `/servers-map` and `/queue`, and builds a single [`Replicator`] once both
//! have been read. Every later change is applied to that same replicator:
//! a new node map is swapped in directly, a new queue descriptor yields a
//! new queue that is swapped in once ready while the previous queue is
//! closed after its outstanding leases drain.
//!
//! Session expiry restarts the session and both subscriptions. Nothing here
//! is fatal except asking a closed supervisor for its replicator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, watch, OnceCell};

use crate::config::ReplicatorConfig;
use crate::coordination::{
    ConfigWatch, CoordinationClient, CoordinationError, SessionEvent, WatchError,
};
use crate::models::{NodeMap, QueueDescriptor};
use crate::queue::{QueueError, QueueFactory, SharedQueue};
use crate::replicator::{Replicator, ReplicatorError};
use crate::transfer::SharedTransfer;

/// Config path of the node map document
pub const SERVERS_MAP_PATH: &str = "/servers-map";

/// Config path of the queue descriptor document
pub const QUEUE_PATH: &str = "/queue";

/// Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Trying to get replicator from closed supervisor")]
    Closed,

    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Replicator error: {0}")]
    Replicator(#[from] ReplicatorError),
}

/// Supervisor notifications
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    SessionStarted,
    SessionExpired,
    Error(Arc<SupervisorError>),
}

#[derive(Default)]
struct State {
    map: Option<NodeMap>,
    queue: Option<SharedQueue>,
    replicator: Option<Replicator>,
}

struct Inner {
    coordinator: Arc<dyn CoordinationClient>,
    queue_factory: Arc<dyn QueueFactory>,
    transfer: SharedTransfer,
    config: ReplicatorConfig,
    state: Mutex<State>,
    replicator: OnceCell<Replicator>,
    configured: watch::Sender<u64>,
    closed: watch::Sender<bool>,
    session_spawned: AtomicBool,
    events: broadcast::Sender<SupervisorEvent>,
}

/// Builds and reconfigures the replicator from coordination data
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        coordinator: Arc<dyn CoordinationClient>,
        queue_factory: Arc<dyn QueueFactory>,
        transfer: SharedTransfer,
        config: ReplicatorConfig,
    ) -> Self {
        let (configured, _) = watch::channel(0);
        let (closed, _) = watch::channel(false);
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                coordinator,
                queue_factory,
                transfer,
                config,
                state: Mutex::new(State::default()),
                replicator: OnceCell::new(),
                configured,
                closed,
                session_spawned: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Return the replicator, building it on the first call
    ///
    /// The first call starts the session and both subscriptions and resolves
    /// once the node map and a ready queue are available. Concurrent callers
    /// share that construction.
    pub async fn get_replicator(&self) -> Result<Replicator, SupervisorError> {
        if self.inner.is_closed() {
            return Err(SupervisorError::Closed);
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .replicator
            .get_or_try_init(|| async move {
                inner.spawn_session();
                inner.build_replicator().await
            })
            .await
            .cloned()
    }

    /// Close the supervisor and its coordination session; idempotent
    pub async fn stop(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        tracing::info!("Stopping supervisor");
        self.inner.coordinator.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Subscribe to supervisor notifications and errors
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Latest node map read from the coordination service
    pub fn current_map(&self) -> Option<NodeMap> {
        self.inner.state().map.clone()
    }

    /// Queue currently wired into the replicator
    pub fn current_queue(&self) -> Option<SharedQueue> {
        self.inner.state().queue.clone()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: SupervisorError) {
        tracing::warn!(error = %error, "Supervisor error");
        self.emit(SupervisorEvent::Error(Arc::new(error)));
    }

    fn spawn_session(self: &Arc<Self>) {
        if self.session_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(self).run_session());
    }

    /// Wait until both documents were applied, then build the replicator
    async fn build_replicator(&self) -> Result<Replicator, SupervisorError> {
        let mut configured = self.configured.subscribe();
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Err(SupervisorError::Closed);
            }

            {
                let mut guard = self.state();
                let state = &mut *guard;
                if let (Some(map), Some(queue)) = (&state.map, &state.queue) {
                    let replicator = Replicator::new(
                        Arc::clone(queue),
                        map.clone(),
                        Arc::clone(&self.transfer),
                        self.config.clone(),
                    )?;
                    state.replicator = Some(replicator.clone());

                    tracing::info!(
                        nodes = map.len(),
                        concurrency = replicator.concurrency(),
                        "Replicator constructed"
                    );
                    return Ok(replicator);
                }
            }

            tokio::select! {
                _ = configured.changed() => {}
                _ = closed.changed() => {}
            }
        }
    }

    /// Session loop: (re)start the session and run both subscriptions on it
    async fn run_session(self: Arc<Self>) {
        let mut closed = self.closed.subscribe();

        loop {
            if self.is_closed() {
                return;
            }

            let mut session_events = self.coordinator.session_events();

            if let Err(e) = self.coordinator.start().await {
                if self.is_closed() {
                    return;
                }
                self.emit_error(e.into());

                tokio::select! {
                    _ = tokio::time::sleep(self.config.session_restart_backoff()) => continue,
                    _ = wait_closed(&mut closed) => return,
                }
            }

            tracing::info!("Coordination session established");
            self.emit(SupervisorEvent::SessionStarted);

            let subscriptions = async {
                tokio::join!(self.watch_servers_map(), self.watch_queue());
                std::future::pending::<()>().await;
            };

            tokio::select! {
                _ = wait_expired(&mut session_events) => {
                    if self.is_closed() {
                        return;
                    }
                    tracing::warn!("Coordination session expired, restarting");
                    self.emit(SupervisorEvent::SessionExpired);
                }
                _ = wait_closed(&mut closed) => return,
                _ = subscriptions => {}
            }
        }
    }

    async fn watch_servers_map(&self) {
        let mut watch: ConfigWatch<NodeMap> = ConfigWatch::new(
            Arc::clone(&self.coordinator),
            SERVERS_MAP_PATH,
            self.config.config_read_backoff(),
        );

        while let Some(item) = watch.next().await {
            if self.is_closed() {
                return;
            }

            match item {
                Ok(map) => self.apply_map(map),
                Err(e) => self.emit_error(e.into()),
            }
        }
    }

    fn apply_map(&self, map: NodeMap) {
        tracing::info!(nodes = map.len(), "Servers map updated");

        let mut state = self.state();
        if let Some(replicator) = &state.replicator {
            replicator.set_map(map.clone());
        }
        state.map = Some(map);
        drop(state);

        self.configured.send_modify(|version| *version += 1);
    }

    /// Queue subscription
    ///
    /// A queue that is still waiting for readiness is dropped (and closed)
    /// as soon as a newer descriptor arrives, so a corrected `/queue`
    /// document is never stuck behind an unreachable one.
    async fn watch_queue(&self) {
        let mut watch: ConfigWatch<QueueDescriptor> = ConfigWatch::new(
            Arc::clone(&self.coordinator),
            QUEUE_PATH,
            self.config.config_read_backoff(),
        );

        let mut item = watch.next().await;
        while let Some(current) = item.take() {
            if self.is_closed() {
                return;
            }

            let descriptor = match current {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    self.emit_error(e.into());
                    item = watch.next().await;
                    continue;
                }
            };

            let queue = match self.create_queue(&descriptor).await {
                Ok(queue) => queue,
                Err(e) => {
                    self.emit_error(e);
                    watch.retry_later();
                    item = watch.next().await;
                    continue;
                }
            };
            let pending = PendingQueue(Some(Arc::clone(&queue)));

            let superseded = tokio::select! {
                _ = queue.wait_ready() => None,
                newer = watch.next() => Some(newer),
            };

            match superseded {
                None => {
                    if self.is_closed() {
                        return;
                    }
                    pending.disarm();
                    self.swap_queue(queue);
                    item = watch.next().await;
                }
                Some(newer) => {
                    tracing::info!(
                        key = %descriptor.key,
                        "Queue descriptor replaced before its queue became ready"
                    );
                    drop(pending);
                    item = newer;
                }
            }
        }
    }

    async fn create_queue(&self, descriptor: &QueueDescriptor) -> Result<SharedQueue, SupervisorError> {
        tracing::info!(
            key = %descriptor.key,
            servers = descriptor.servers.len(),
            "Queue descriptor updated"
        );

        let session = self.coordinator.options();
        let queue = self.queue_factory.create(descriptor, &session).await?;
        self.forward_queue_errors(&queue);
        Ok(queue)
    }

    /// Wire a ready queue into the replicator and retire the previous one
    fn swap_queue(&self, queue: SharedQueue) {
        let previous = {
            let mut state = self.state();
            if let Some(replicator) = &state.replicator {
                replicator.set_queue(Arc::clone(&queue));
            }
            state.queue.replace(queue)
        };
        self.configured.send_modify(|version| *version += 1);

        if let Some(old) = previous {
            tokio::spawn(async move {
                old.wait_idle().await;
                old.close().await;
                tracing::debug!("Previous queue closed");
            });
        }
    }

    fn forward_queue_errors(&self, queue: &SharedQueue) {
        let mut errors = queue.subscribe_errors();
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                match errors.recv().await {
                    Ok(error) => {
                        tracing::warn!(error = %error, "Queue error");
                        let error = SupervisorError::Queue(error);
                        let _ = events.send(SupervisorEvent::Error(Arc::new(error)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }
}

/// Queue created but not yet wired in; closed if abandoned
struct PendingQueue(Option<SharedQueue>);

impl PendingQueue {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingQueue {
    fn drop(&mut self) {
        if let Some(queue) = self.0.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { queue.close().await });
            }
        }
    }
}

async fn wait_expired(events: &mut broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Expired) | Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::queue::MemoryQueueFactory;
    use crate::transfer::{Transfer, TransferError};
    use async_trait::async_trait;
    use url::Url;

    struct NoopTransfer;

    #[async_trait]
    impl Transfer for NoopTransfer {
        async fn transfer(&self, _: &Url, _: &Url) -> Result<(), TransferError> {
            Ok(())
        }
    }

    fn supervisor(coordinator: &Arc<MemoryCoordinator>) -> Supervisor {
        Supervisor::new(
            coordinator.clone(),
            Arc::new(MemoryQueueFactory::new()),
            Arc::new(NoopTransfer),
            ReplicatorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_closed_supervisor_rejects() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let supervisor = supervisor(&coordinator);

        supervisor.stop().await;
        assert!(supervisor.is_closed());
        assert!(coordinator.is_closed());
        assert!(matches!(
            supervisor.get_replicator().await,
            Err(SupervisorError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_stop_during_construction() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let supervisor = supervisor(&coordinator);

        let pending = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.get_replicator().await }
        });

        tokio::task::yield_now().await;
        supervisor.stop().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(SupervisorError::Closed)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let supervisor = supervisor(&coordinator);
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(supervisor.is_closed());
    }
}
