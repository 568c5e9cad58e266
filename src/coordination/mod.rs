//! Coordination service abstraction
//!
//! The supervisor reads its configuration through [`CoordinationClient`]:
//! a session that can be (re)started, one-shot watched reads, and a
//! session event stream announcing expiry.
//!
//! ```text
//! start() ──► get(path) ──► (bytes, Watcher)
//!                               │
//!                               └─ wait() ─► Changed | Deleted | SessionLost
//! ```
//!
//! [`ConfigWatch`] turns the one-shot watches into a persistent subscription
//! that yields every successive parsed value of a path.

pub mod http;
pub mod memory;
pub mod watch;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

pub use self::http::HttpCoordinator;
pub use self::memory::MemoryCoordinator;
pub use self::watch::{ConfigWatch, WatchError};

// ============================================================================
// Session Types
// ============================================================================

/// Settings of a coordination session
///
/// Exposed by every client so a collaborator that needs its own
/// coordination (such as a queue) can derive a sub-session from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Coordination hosts, in preference order
    pub hosts: Vec<String>,

    /// Config root every path is resolved under
    pub root: String,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            root: "/".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl SessionOptions {
    pub fn new(hosts: Vec<String>, root: impl Into<String>) -> Self {
        Self {
            hosts,
            root: normalize_root(&root.into()),
            ..Default::default()
        }
    }

    /// Parse a comma separated host list, skipping blanks
    pub fn parse_hosts(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve a config path such as `/queue` under the root
    pub fn full_path(&self, path: &str) -> String {
        let root = normalize_root(&self.root);
        if root == "/" {
            path.to_string()
        } else {
            format!("{root}{path}")
        }
    }
}

/// Make a config root absolute and strip its trailing slash
fn normalize_root(root: &str) -> String {
    let trimmed = root.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Session-level notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is gone; watches armed on it will never fire
    Expired,
}

// ============================================================================
// Watches
// ============================================================================

/// Outcome of a one-shot watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Changed,
    Deleted,
    SessionLost,
}

/// Receiving half of a one-shot watch returned by [`CoordinationClient::get`]
#[derive(Debug)]
pub struct Watcher {
    rx: oneshot::Receiver<WatchEvent>,
}

/// Firing half of a one-shot watch, kept by the client
#[derive(Debug)]
pub struct WatchTrigger {
    tx: oneshot::Sender<WatchEvent>,
}

impl Watcher {
    pub fn pair() -> (WatchTrigger, Watcher) {
        let (tx, rx) = oneshot::channel();
        (WatchTrigger { tx }, Watcher { rx })
    }

    /// Wait for the watch to fire; a dropped trigger means the session is gone
    pub async fn wait(mut self) -> WatchEvent {
        self.fired().await
    }

    /// Like [`Watcher::wait`] but cancel-safe; must not be polled again
    /// once it has returned
    pub async fn fired(&mut self) -> WatchEvent {
        (&mut self.rx).await.unwrap_or(WatchEvent::SessionLost)
    }
}

impl WatchTrigger {
    pub fn fire(self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }

    /// True once nobody waits on this watch anymore
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by coordination clients
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("No coordination hosts configured")]
    NoHosts,

    #[error("No coordination host reachable: {0}")]
    Unreachable(String),

    #[error("Coordination session not started")]
    NotStarted,

    #[error("Coordination session closed")]
    SessionClosed,

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Unexpected status {status} reading {path}")]
    Status { path: String, status: u16 },

    #[error("Coordination network error: {0}")]
    Network(String),
}

impl CoordinationError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SessionClosed | Self::NoHosts)
    }
}

// ============================================================================
// Client Trait
// ============================================================================

/// Session with a coordination service
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Establish (or re-establish) the session
    async fn start(&self) -> Result<(), CoordinationError>;

    /// Read `path` (relative to the config root) and arm a one-shot watch
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Watcher), CoordinationError>;

    /// Session notifications; subscribe before `start` to see every expiry
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// End the session for good; armed watches report `SessionLost`
    async fn close(&self);

    fn options(&self) -> SessionOptions;
}
