//! HTTP config store client
//!
//! Serves the [`CoordinationClient`] contract from any HTTP server exposing
//! config documents under a root, e.g. `GET http://cfg1:8500/backpack/queue`.
//!
//! Watches are emulated by polling: each armed watch spawns a task that
//! re-fetches the path every poll interval (sending `If-None-Match` when the
//! server handed out an `ETag`) and fires once the document changes or
//! disappears. Poll failures count against the session; once any watch sees
//! `failure_threshold` consecutive failures the session expires. Direct reads
//! are counted the same way, so a host that dies while no watch is armed
//! still expires the session and the next start moves to another host.

use async_trait::async_trait;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use super::{
    CoordinationClient, CoordinationError, SessionEvent, SessionOptions, WatchEvent, WatchTrigger,
    Watcher,
};
use crate::config::CoordinationConfig;

/// Session bookkeeping; every start, expiry or close bumps the generation
#[derive(Debug, Clone, Default)]
struct SessionState {
    generation: u64,
    host: Option<String>,
    closed: bool,
}

/// Consecutive failed reads within one session generation
#[derive(Debug, Default)]
struct ReadFailures {
    generation: u64,
    count: u32,
}

struct Inner {
    client: Client,
    options: SessionOptions,
    poll_interval: Duration,
    failure_threshold: u32,
    session: watch::Sender<SessionState>,
    read_failures: Mutex<ReadFailures>,
    events: broadcast::Sender<SessionEvent>,
}

/// [`CoordinationClient`] backed by an HTTP config store
#[derive(Clone)]
pub struct HttpCoordinator {
    inner: Arc<Inner>,
}

impl HttpCoordinator {
    /// Create a client; no request is made until [`CoordinationClient::start`]
    pub fn new(options: SessionOptions, config: &CoordinationConfig) -> Result<Self, CoordinationError> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| CoordinationError::Network(e.to_string()))?;

        let (session, _) = watch::channel(SessionState::default());
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                options,
                poll_interval: config.poll_interval(),
                failure_threshold: config.failure_threshold.max(1),
                session,
                read_failures: Mutex::new(ReadFailures::default()),
                events,
            }),
        })
    }

    /// Host of the current session, if one is established
    pub fn current_host(&self) -> Option<String> {
        self.inner.session.borrow().host.clone()
    }
}

/// Base URL of a host given as `host:port` or as a full `scheme://host:port`
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn etag_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

impl Inner {
    fn url(&self, host: &str, path: &str) -> String {
        format!("{}{}", base_url(host), self.options.full_path(path))
    }

    /// Expire the session if it is still the one the caller observed
    fn expire(&self, generation: u64) {
        let mut expired = false;
        self.session.send_if_modified(|state| {
            if state.generation != generation || state.closed {
                return false;
            }
            state.generation += 1;
            state.host = None;
            expired = true;
            true
        });

        if expired {
            tracing::warn!(generation, "Coordination session expired");
            let _ = self.events.send(SessionEvent::Expired);
        }
    }

    /// Count a read against the session; too many failures in a row expire it
    /// so the next start can fail over to another host
    fn record_read(&self, generation: u64, failed: bool) {
        let count = {
            let mut failures = self.read_failures.lock().unwrap_or_else(|e| e.into_inner());
            if failures.generation != generation {
                *failures = ReadFailures {
                    generation,
                    count: 0,
                };
            }
            failures.count = if failed { failures.count + 1 } else { 0 };
            failures.count
        };

        if count >= self.failure_threshold {
            tracing::debug!(generation, failures = count, "Too many failed reads");
            self.expire(generation);
        }
    }

    async fn fetch(&self, url: &str, path: &str) -> Result<(Option<String>, Vec<u8>), CoordinationError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoordinationError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CoordinationError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(CoordinationError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let etag = etag_of(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| CoordinationError::Network(e.to_string()))?
            .to_vec();

        Ok((etag, body))
    }

    async fn probe(&self, host: &str) -> Result<(), String> {
        let url = format!("{}{}", base_url(host), self.options.root);
        let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(format!("{url} answered {status}"))
        }
    }

    /// Poll `url` until its document changes, then fire `trigger`
    ///
    /// Exits without firing when the session moves on or the watcher is
    /// dropped; the dropped trigger then reads as `SessionLost`.
    async fn poll(
        self: Arc<Self>,
        url: String,
        generation: u64,
        etag: Option<String>,
        body: Vec<u8>,
        trigger: WatchTrigger,
    ) {
        let mut session = self.session.subscribe();
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = session.changed() => {
                    if changed.is_err() || session.borrow().generation != generation {
                        return;
                    }
                    continue;
                }
            }

            if trigger.is_abandoned() || self.session.borrow().generation != generation {
                return;
            }

            let mut request = self.client.get(&url);
            if let Some(tag) = &etag {
                request = request.header(IF_NONE_MATCH, tag);
            }

            let outcome = match request.send().await {
                Ok(response) => match response.status() {
                    StatusCode::NOT_MODIFIED => Ok(None),
                    StatusCode::NOT_FOUND => Ok(Some(WatchEvent::Deleted)),
                    status if status.is_success() => {
                        let new_etag = etag_of(&response);
                        match response.bytes().await {
                            Ok(new_body) => {
                                let changed = match (&etag, &new_etag) {
                                    (Some(old), Some(new)) => old != new,
                                    _ => new_body.as_ref() != body.as_slice(),
                                };
                                Ok(changed.then_some(WatchEvent::Changed))
                            }
                            Err(e) => Err(e.to_string()),
                        }
                    }
                    status => Err(format!("unexpected status {status}")),
                },
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(Some(event)) => {
                    tracing::debug!(url = %url, ?event, "Watch fired");
                    trigger.fire(event);
                    return;
                }
                Ok(None) => failures = 0,
                Err(error) => {
                    failures += 1;
                    tracing::debug!(url = %url, failures, error = %error, "Watch poll failed");
                    if failures >= self.failure_threshold {
                        self.expire(generation);
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CoordinationClient for HttpCoordinator {
    async fn start(&self) -> Result<(), CoordinationError> {
        let inner = &self.inner;
        if inner.session.borrow().closed {
            return Err(CoordinationError::SessionClosed);
        }
        if inner.options.hosts.is_empty() {
            return Err(CoordinationError::NoHosts);
        }

        let mut last_error = String::new();
        for host in &inner.options.hosts {
            match inner.probe(host).await {
                Ok(()) => {
                    let mut started = false;
                    inner.session.send_if_modified(|state| {
                        if state.closed {
                            return false;
                        }
                        state.generation += 1;
                        state.host = Some(host.clone());
                        started = true;
                        true
                    });

                    if !started {
                        return Err(CoordinationError::SessionClosed);
                    }

                    tracing::info!(host = %host, root = %inner.options.root, "Coordination session started");
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(host = %host, error = %error, "Coordination host unreachable");
                    last_error = error;
                }
            }
        }

        Err(CoordinationError::Unreachable(last_error))
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Watcher), CoordinationError> {
        let (host, generation) = {
            let state = self.inner.session.borrow();
            if state.closed {
                return Err(CoordinationError::SessionClosed);
            }
            match &state.host {
                Some(host) => (host.clone(), state.generation),
                None => return Err(CoordinationError::NotStarted),
            }
        };

        let url = self.inner.url(&host, path);
        let fetched = self.inner.fetch(&url, path).await;

        // A missing document is a healthy answer
        let failed = match &fetched {
            Ok(_) | Err(CoordinationError::NotFound(_)) => false,
            Err(CoordinationError::Status { status, .. }) => *status >= 500,
            Err(_) => true,
        };
        self.inner.record_read(generation, failed);

        let (etag, body) = fetched?;

        let (trigger, watcher) = Watcher::pair();
        tokio::spawn(Arc::clone(&self.inner).poll(url, generation, etag, body.clone(), trigger));

        Ok((body, watcher))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) {
        self.inner.session.send_modify(|state| {
            state.closed = true;
            state.host = None;
            state.generation += 1;
        });
        tracing::info!("Coordination session closed");
    }

    fn options(&self) -> SessionOptions {
        self.inner.options.clone()
    }
}
