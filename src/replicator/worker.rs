//! Consume-process-acknowledge loop run by every worker

use std::sync::Arc;

use super::{Inner, ReplicatorError};
use crate::models::ReplicationJob;
use crate::queue::Lease;

/// Worker loop; exits at an iteration boundary once the pool is stopped
pub(super) async fn run(inner: Arc<Inner>) {
    while inner.keep_running() {
        let queue = inner.queue.borrow().clone();

        match queue.pop().await {
            Err(e) => {
                inner.emit_error(e.into());
                tokio::time::sleep(inner.config.queue_poll_backoff()).await;
            }
            Ok(None) => {
                tokio::time::sleep(inner.config.queue_poll_backoff()).await;
            }
            Ok(Some(lease)) => {
                if !acknowledge(&inner, lease).await {
                    tokio::time::sleep(inner.config.queue_poll_backoff()).await;
                }
            }
        }
    }
}

/// Process a leased job and take its terminal action; true on success
async fn acknowledge(inner: &Inner, lease: Lease) -> bool {
    match process(inner, lease.payload()).await {
        Ok(()) => {
            if let Err(e) = lease.complete().await {
                inner.emit_error(e.into());
            }
            true
        }
        Err(e) => {
            inner.emit_error(e);
            if let Err(e) = lease.release().await {
                inner.emit_error(e.into());
            }
            false
        }
    }
}

async fn process(inner: &Inner, payload: &str) -> Result<(), ReplicatorError> {
    let job = ReplicationJob::from_payload(payload)?;

    let source = {
        let mut rng = rand::thread_rng();
        job.choose_source(&mut rng).cloned()
    }
    .ok_or(ReplicatorError::EmptySources)?;

    let map = inner.map.borrow().clone();
    let from = map.resolve_url(&source, &job.path)?;
    let to = map.resolve_url(&job.to, &job.path)?;

    tracing::info!(from = %from, to = %to, "Replicating");
    inner.transfer.transfer(&from, &to).await?;
    Ok(())
}
