//! In-process lease queue
//!
//! Honors the same contract as the Redis queue (leases, release for
//! redelivery, readiness, idle tracking) without any backing server. Also
//! lets callers inject pop failures and defer readiness.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::{
    Lease, LeaseGuard, LeaseHandle, LeaseTracker, QueueError, QueueFactory, Readiness, SharedQueue,
    WorkQueue,
};
use crate::coordination::SessionOptions;
use crate::models::QueueDescriptor;

#[derive(Debug, Default)]
struct Slots {
    pending: VecDeque<String>,
    leased: HashMap<u64, String>,
}

#[derive(Debug)]
struct Shared {
    slots: Mutex<Slots>,
    next_lease: AtomicU64,
    fail_pops: AtomicUsize,
    closed: AtomicBool,
    completed: AtomicU64,
    released: AtomicU64,
}

impl Shared {
    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory [`WorkQueue`]
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
    readiness: Readiness,
    tracker: LeaseTracker,
    errors: broadcast::Sender<QueueError>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    /// Create a queue that is ready immediately
    pub fn new() -> Self {
        Self::with_readiness(true)
    }

    /// Create a queue that stays not-ready until [`MemoryQueue::mark_ready`]
    pub fn not_ready() -> Self {
        Self::with_readiness(false)
    }

    fn with_readiness(ready: bool) -> Self {
        let (errors, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(Slots::default()),
                next_lease: AtomicU64::new(1),
                fail_pops: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
            readiness: Readiness::new(ready),
            tracker: LeaseTracker::new(),
            errors,
        }
    }

    pub fn mark_ready(&self) {
        self.readiness.mark_ready();
    }

    /// Make the next `count` pops fail with a connection error
    pub fn fail_next_pops(&self, count: usize) {
        self.shared.fail_pops.store(count, Ordering::SeqCst);
    }

    /// Publish a background error to subscribers
    pub fn emit_error(&self, error: QueueError) {
        let _ = self.errors.send(error);
    }

    pub fn pending_len(&self) -> usize {
        self.shared.slots().pending.len()
    }

    pub fn leased_len(&self) -> usize {
        self.shared.slots().leased.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> u64 {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn outstanding_leases(&self) -> usize {
        self.tracker.outstanding()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if !self.readiness.is_ready() {
            return Err(QueueError::NotReady);
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, payload: String) -> Result<(), QueueError> {
        self.check_open()?;
        self.shared.slots().pending.push_back(payload);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Lease>, QueueError> {
        self.check_open()?;

        let injected = self
            .shared
            .fail_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(QueueError::Connection("injected pop failure".to_string()));
        }

        let mut slots = self.shared.slots();
        let Some(payload) = slots.pending.pop_front() else {
            return Ok(None);
        };

        let id = self.shared.next_lease.fetch_add(1, Ordering::SeqCst);
        slots.leased.insert(id, payload.clone());

        let handle = MemoryLease {
            id,
            shared: Arc::clone(&self.shared),
            _guard: self.tracker.acquire(),
        };

        Ok(Some(Lease::new(payload, Box::new(handle))))
    }

    fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    async fn wait_ready(&self) {
        self.readiness.wait().await;
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<QueueError> {
        self.errors.subscribe()
    }

    async fn size(&self) -> Result<usize, QueueError> {
        let slots = self.shared.slots();
        Ok(slots.pending.len() + slots.leased.len())
    }

    async fn wait_idle(&self) {
        self.tracker.wait_idle().await;
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryLease {
    id: u64,
    shared: Arc<Shared>,
    _guard: LeaseGuard,
}

#[async_trait]
impl LeaseHandle for MemoryLease {
    async fn complete(&mut self) -> Result<(), QueueError> {
        let removed = self.shared.slots().leased.remove(&self.id);
        match removed {
            Some(_) => {
                self.shared.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(QueueError::LeaseLost(self.id.to_string())),
        }
    }

    async fn release(&mut self) -> Result<(), QueueError> {
        let mut slots = self.shared.slots();
        let payload = slots
            .leased
            .remove(&self.id)
            .ok_or_else(|| QueueError::LeaseLost(self.id.to_string()))?;
        slots.pending.push_back(payload);
        self.shared.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        // Abandoned without a terminal action
        let mut slots = self.shared.slots();
        if let Some(payload) = slots.leased.remove(&self.id) {
            slots.pending.push_back(payload);
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Hands out [`MemoryQueue`]s and remembers every one it created
#[derive(Debug, Default)]
pub struct MemoryQueueFactory {
    created: Mutex<Vec<(QueueDescriptor, MemoryQueue)>>,
    defer_ready: bool,
}

impl MemoryQueueFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues start not-ready; the caller readies them via [`MemoryQueue::mark_ready`]
    pub fn deferred() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            defer_ready: true,
        }
    }

    pub fn created(&self) -> Vec<(QueueDescriptor, MemoryQueue)> {
        self.created.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<MemoryQueue> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|(_, queue)| queue.clone())
    }
}

#[async_trait]
impl QueueFactory for MemoryQueueFactory {
    async fn create(
        &self,
        descriptor: &QueueDescriptor,
        _session: &SessionOptions,
    ) -> Result<SharedQueue, QueueError> {
        let queue = if self.defer_ready {
            MemoryQueue::not_ready()
        } else {
            MemoryQueue::new()
        };

        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((descriptor.clone(), queue.clone()));

        Ok(Arc::new(queue))
    }
}
