//! Lease-based work queue abstraction
//!
//! The replicator consumes jobs through the [`WorkQueue`] trait. A successful
//! `pop` hands out a [`Lease`]: exclusive ownership of one payload until the
//! consumer either completes it (permanent removal) or releases it (back to
//! the queue for redelivery).
//!
//! Two implementations ship with the crate:
//!
//! - [`memory::MemoryQueue`] - in-process queue for embedding and tests
//! - [`redis::RedisQueue`] - durable queue sharded over Redis servers

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::coordination::SessionOptions;
use crate::models::QueueDescriptor;

pub use self::memory::{MemoryQueue, MemoryQueueFactory};
pub use self::redis::{RedisQueue, RedisQueueFactory};

/// Shared handle to a queue, swapped atomically inside the replicator
pub type SharedQueue = Arc<dyn WorkQueue>;

// ============================================================================
// Queue Errors
// ============================================================================

/// Errors reported by queue implementations
///
/// Cloneable so they can be fanned out to error subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue command failed: {0}")]
    Command(String),

    #[error("Queue is not ready")]
    NotReady,

    #[error("Queue is closed")]
    Closed,

    #[error("Lease {0} is no longer held")]
    LeaseLost(String),
}

impl From<::redis::RedisError> for QueueError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Terminal actions behind a lease, provided by the queue implementation
#[async_trait]
pub trait LeaseHandle: Send {
    /// Remove the payload permanently
    async fn complete(&mut self) -> Result<(), QueueError>;

    /// Return the payload to the queue for redelivery
    async fn release(&mut self) -> Result<(), QueueError>;
}

/// One dequeued payload plus its two terminal actions
///
/// Both actions consume the lease, so exactly one of them can run.
pub struct Lease {
    payload: String,
    handle: Box<dyn LeaseHandle>,
}

impl Lease {
    pub fn new(payload: impl Into<String>, handle: Box<dyn LeaseHandle>) -> Self {
        Self {
            payload: payload.into(),
            handle,
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub async fn complete(mut self) -> Result<(), QueueError> {
        self.handle.complete().await
    }

    pub async fn release(mut self) -> Result<(), QueueError> {
        self.handle.release().await
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Lease Tracking
// ============================================================================

/// Counts leases that have not reached a terminal action yet
///
/// Queues hand a [`LeaseGuard`] to every lease handle; `wait_idle` resolves
/// once every guard is dropped.
#[derive(Debug, Clone)]
pub struct LeaseTracker {
    outstanding: Arc<AtomicUsize>,
    idle_tx: Arc<watch::Sender<usize>>,
}

impl Default for LeaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTracker {
    pub fn new() -> Self {
        let (idle_tx, _) = watch::channel(0);
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle_tx: Arc::new(idle_tx),
        }
    }

    pub fn acquire(&self) -> LeaseGuard {
        let count = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.idle_tx.send_replace(count);
        LeaseGuard {
            tracker: self.clone(),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.idle_tx.subscribe();
        // Sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|_| self.outstanding() == 0).await;
    }
}

/// Decrements the tracker when dropped
#[derive(Debug)]
pub struct LeaseGuard {
    tracker: LeaseTracker,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let count = self.tracker.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        self.tracker.idle_tx.send_replace(count);
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// One-way readiness flag shared by queue implementations
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Readiness {
    pub fn new(ready: bool) -> Self {
        let (tx, _) = watch::channel(ready);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn mark_ready(&self) {
        self.tx.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

// ============================================================================
// Queue Traits
// ============================================================================

/// Durable, multi-consumer, lease-based queue of serialized jobs
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Submit one payload (single attempt)
    async fn push(&self, payload: String) -> Result<(), QueueError>;

    /// Lease the next payload, `None` when nothing is available
    async fn pop(&self) -> Result<Option<Lease>, QueueError>;

    fn is_ready(&self) -> bool;

    /// Resolve once the queue is ready (immediately if it already is)
    async fn wait_ready(&self);

    /// Ongoing background errors (connection drops, lease renewal failures)
    fn subscribe_errors(&self) -> broadcast::Receiver<QueueError>;

    /// Number of stored payloads, leased ones included
    async fn size(&self) -> Result<usize, QueueError>;

    /// Resolve once no lease handed out by this queue is outstanding
    async fn wait_idle(&self);

    async fn close(&self);
}

/// Builds a queue from the `/queue` descriptor
#[async_trait]
pub trait QueueFactory: Send + Sync {
    /// `session` carries the coordination session settings so a queue that
    /// needs its own coordination can derive a sub-session from them.
    async fn create(
        &self,
        descriptor: &QueueDescriptor,
        session: &SessionOptions,
    ) -> Result<SharedQueue, QueueError>;
}
