//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use backpack_replicator::config::ReplicatorConfig;
use backpack_replicator::models::{Endpoint, NodeId, NodeMap};
use backpack_replicator::replicator::ReplicatorEvent;
use backpack_replicator::transfer::{Transfer, TransferError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

pub const SERVERS_MAP_1_2: &str = r#"{
    "1": {"host": "node-1.local", "port": 8080},
    "2": {"host": "node-2.local", "port": 8081}
}"#;

pub const QUEUE_DESCRIPTOR: &str = r#"{
    "servers": [{"host": "redis-1.local", "port": 6379}],
    "key": "replication"
}"#;

/// Node map with nodes 1 and 2
pub fn node_map_1_2() -> NodeMap {
    [
        (NodeId::from(1), Endpoint::new("node-1.local", 8080)),
        (NodeId::from(2), Endpoint::new("node-2.local", 8081)),
    ]
    .into_iter()
    .collect()
}

/// Replicator config with a short backoff
pub fn fast_config(concurrency: usize) -> ReplicatorConfig {
    ReplicatorConfig {
        backoff_ms: 10,
        ..ReplicatorConfig::with_concurrency(concurrency)
    }
}

pub fn ids(raw: &[u64]) -> Vec<NodeId> {
    raw.iter().copied().map(NodeId::from).collect()
}

/// Transfer that records every (source, destination) pair
#[derive(Default)]
pub struct RecordingTransfer {
    calls: Mutex<Vec<(String, String)>>,
    failures: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` transfers
    pub fn failing(count: usize) -> Self {
        Self {
            failures: AtomicUsize::new(count),
            ..Default::default()
        }
    }

    /// Hold every transfer for `delay` before succeeding
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transfer for RecordingTransfer {
    async fn transfer(&self, source: &Url, destination: &Url) -> Result<(), TransferError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.calls
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string()));

        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransferError::Other("injected transfer failure".to_string()));
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next lifecycle event, skipping errors
pub async fn next_lifecycle_event(events: &mut broadcast::Receiver<ReplicatorEvent>) -> ReplicatorEvent {
    let wait = async {
        loop {
            match events.recv().await.expect("event stream closed") {
                ReplicatorEvent::Error(_) => continue,
                event => return event,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("no lifecycle event within 5s")
}
