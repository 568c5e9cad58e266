//! In-process coordination service
//!
//! Keeps config documents in memory and fires watches on `set`/`delete`.
//! Read failures, start failures and session expiry can be injected, which
//! makes it the backbone of the supervisor tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use super::{
    CoordinationClient, CoordinationError, SessionEvent, SessionOptions, WatchEvent, WatchTrigger,
    Watcher,
};

#[derive(Debug, Default)]
struct State {
    data: HashMap<String, Vec<u8>>,
    watchers: HashMap<String, Vec<WatchTrigger>>,
    read_failures: HashMap<String, usize>,
    read_counts: HashMap<String, usize>,
    start_failures: usize,
    start_count: usize,
    started: bool,
    closed: bool,
}

impl State {
    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(triggers) = self.watchers.remove(path) {
            for trigger in triggers {
                trigger.fire(event);
            }
        }
    }

    fn drop_session(&mut self) {
        self.started = false;
        for (_, triggers) in self.watchers.drain() {
            for trigger in triggers {
                trigger.fire(WatchEvent::SessionLost);
            }
        }
    }
}

/// In-memory [`CoordinationClient`]
#[derive(Debug)]
pub struct MemoryCoordinator {
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
    options: SessionOptions,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::with_options(SessionOptions::new(vec!["memory".to_string()], "/"))
    }

    pub fn with_options(options: SessionOptions) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(State::default()),
            events,
            options,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a document and fire its watches
    pub fn set(&self, path: &str, value: impl Into<Vec<u8>>) {
        let mut state = self.state();
        state.data.insert(path.to_string(), value.into());
        state.fire(path, WatchEvent::Changed);
    }

    pub fn delete(&self, path: &str) {
        let mut state = self.state();
        state.data.remove(path);
        state.fire(path, WatchEvent::Deleted);
    }

    /// Make the next `count` reads of `path` fail
    pub fn fail_reads(&self, path: &str, count: usize) {
        self.state().read_failures.insert(path.to_string(), count);
    }

    /// Make the next `count` session starts fail
    pub fn fail_starts(&self, count: usize) {
        self.state().start_failures = count;
    }

    /// Expire the current session: watches report `SessionLost`, subscribers
    /// get [`SessionEvent::Expired`]
    pub fn expire(&self) {
        self.state().drop_session();
        let _ = self.events.send(SessionEvent::Expired);
    }

    pub fn start_count(&self) -> usize {
        self.state().start_count
    }

    pub fn read_count(&self, path: &str) -> usize {
        self.state().read_counts.get(path).copied().unwrap_or(0)
    }

    /// Number of armed watches on `path` that still have a listener
    pub fn watcher_count(&self, path: &str) -> usize {
        self.state()
            .watchers
            .get(path)
            .map(|triggers| triggers.iter().filter(|t| !t.is_abandoned()).count())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn start(&self) -> Result<(), CoordinationError> {
        let mut state = self.state();
        if state.closed {
            return Err(CoordinationError::SessionClosed);
        }

        state.start_count += 1;
        if state.start_failures > 0 {
            state.start_failures -= 1;
            return Err(CoordinationError::Unreachable(
                "injected start failure".to_string(),
            ));
        }

        state.started = true;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Watcher), CoordinationError> {
        let mut state = self.state();
        if state.closed {
            return Err(CoordinationError::SessionClosed);
        }
        if !state.started {
            return Err(CoordinationError::NotStarted);
        }

        *state.read_counts.entry(path.to_string()).or_default() += 1;

        if let Some(remaining) = state.read_failures.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoordinationError::Network(format!(
                    "injected read failure for {path}"
                )));
            }
        }

        let value = state
            .data
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinationError::NotFound(path.to_string()))?;

        let (trigger, watcher) = Watcher::pair();
        state
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(trigger);

        Ok((value, watcher))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.drop_session();
    }

    fn options(&self) -> SessionOptions {
        self.options.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_requires_start() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set("/servers-map", "{}");

        assert_eq!(
            coordinator.get("/servers-map").await.unwrap_err(),
            CoordinationError::NotStarted
        );

        coordinator.start().await.unwrap();
        let (value, _watcher) = coordinator.get("/servers-map").await.unwrap();
        assert_eq!(value, b"{}");
    }

    #[tokio::test]
    async fn test_set_fires_watch() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set("/queue", "a");
        coordinator.start().await.unwrap();

        let (_, watcher) = coordinator.get("/queue").await.unwrap();
        assert_eq!(coordinator.watcher_count("/queue"), 1);

        coordinator.set("/queue", "b");
        assert_eq!(watcher.wait().await, WatchEvent::Changed);
        assert_eq!(coordinator.watcher_count("/queue"), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set("/queue", "a");
        coordinator.fail_starts(1);
        coordinator.fail_reads("/queue", 1);

        assert!(coordinator.start().await.is_err());
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.start_count(), 2);

        assert!(coordinator.get("/queue").await.is_err());
        assert!(coordinator.get("/queue").await.is_ok());
        assert_eq!(coordinator.read_count("/queue"), 2);
    }

    #[tokio::test]
    async fn test_expire_loses_watches() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set("/queue", "a");
        coordinator.start().await.unwrap();
        let mut events = coordinator.session_events();

        let (_, watcher) = coordinator.get("/queue").await.unwrap();
        coordinator.expire();

        assert_eq!(watcher.wait().await, WatchEvent::SessionLost);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert_eq!(
            coordinator.get("/queue").await.unwrap_err(),
            CoordinationError::NotStarted
        );
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let coordinator = MemoryCoordinator::new();
        coordinator.close().await;
        assert!(coordinator.is_closed());
        assert_eq!(
            coordinator.start().await.unwrap_err(),
            CoordinationError::SessionClosed
        );
    }
}
