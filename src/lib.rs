//! backpack-replicator - content replication between storage nodes
//!
//! A fleet of replicator processes consumes replication jobs from a shared
//! lease-based queue and copies content between HTTP storage nodes. The
//! topology (node addresses and the queue location) lives in a coordination
//! service and can change without restarting any worker.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`] - Node map, replication jobs and queue descriptors
//! - [`queue`] - Lease-based work queue trait with in-memory and Redis backends
//! - [`coordination`] - Coordination session trait, HTTP config store client and config watches
//! - [`transfer`] - Content transfer between nodes
//! - [`replicator`] - Concurrency-bounded worker pool
//! - [`supervisor`] - Builds and hot-swaps the replicator from coordination data
//! - [`config`] - Configuration management and settings
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use backpack_replicator::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> backpack_replicator::Result<()> {
//!     let config = Config::from_env()?;
//!     let options = SessionOptions::new(vec!["cfg1:8500".to_string()], "/backpack");
//!
//!     let supervisor = Supervisor::new(
//!         Arc::new(HttpCoordinator::new(options, &config.coordination)?),
//!         Arc::new(RedisQueueFactory::new(config.queue.clone())),
//!         Arc::new(HttpTransfer::new(&config.transfer)?),
//!         config.replicator.clone(),
//!     );
//!
//!     let replicator = supervisor.get_replicator().await?;
//!     replicator.start();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
pub mod models;
pub mod queue;
pub mod replicator;
pub mod supervisor;
pub mod transfer;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::coordination::{
        ConfigWatch, CoordinationClient, HttpCoordinator, MemoryCoordinator, SessionOptions,
    };
    pub use crate::error::{BackpackErrorTrait, Error, ErrorCategory, Result};
    pub use crate::models::{Endpoint, NodeId, NodeMap, QueueDescriptor, ReplicationJob};
    pub use crate::queue::{
        Lease, MemoryQueue, MemoryQueueFactory, QueueFactory, RedisQueueFactory, WorkQueue,
    };
    pub use crate::replicator::{LifecycleState, Replicator, ReplicatorEvent};
    pub use crate::supervisor::{Supervisor, SupervisorEvent};
    pub use crate::transfer::{HttpTransfer, Transfer};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{Endpoint, NodeId, NodeMap, QueueDescriptor, ReplicationJob};
pub use replicator::Replicator;
pub use supervisor::Supervisor;
