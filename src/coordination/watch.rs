//! Persistent config subscription built on one-shot watches
//!
//! Every successful read re-arms the watch, so a [`ConfigWatch`] yields the
//! current value of a path and then one value per change. Failed reads and
//! unparsable documents are reported and retried after the backoff. Once
//! the session is gone the subscription ends and cannot be restarted; the
//! owner builds a new one on the next session.

use futures::Stream;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{CoordinationClient, CoordinationError, WatchEvent, Watcher};

/// Errors reported by a [`ConfigWatch`]
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: CoordinationError,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl WatchError {
    pub fn path(&self) -> &str {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => path,
        }
    }
}

/// Successive parsed values of one config path
pub struct ConfigWatch<T> {
    client: Arc<dyn CoordinationClient>,
    path: String,
    backoff: Duration,
    armed: Option<Watcher>,
    retry: bool,
    finished: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ConfigWatch<T> {
    pub fn new(client: Arc<dyn CoordinationClient>, path: impl Into<String>, backoff: Duration) -> Self {
        Self {
            client,
            path: path.into(),
            backoff,
            armed: None,
            retry: false,
            finished: false,
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next value of the path
    ///
    /// The first call reads immediately. Later calls wait for the armed watch
    /// to fire, or for one backoff interval after an error. Returns `None`
    /// once the session is gone. Safe to cancel in a `select!`.
    pub async fn next(&mut self) -> Option<Result<T, WatchError>> {
        if self.finished {
            return None;
        }

        // Cancelled while waiting, the watch stays armed for the next call
        if let Some(watcher) = self.armed.as_mut() {
            let event = watcher.fired().await;
            self.armed = None;
            if event == WatchEvent::SessionLost {
                self.finished = true;
                return None;
            }
        } else if self.retry {
            tokio::time::sleep(self.backoff).await;
        }
        self.retry = false;

        match self.client.get(&self.path).await {
            Ok((bytes, watcher)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    self.armed = Some(watcher);
                    Some(Ok(value))
                }
                Err(source) => {
                    self.retry = true;
                    Some(Err(WatchError::Parse {
                        path: self.path.clone(),
                        source,
                    }))
                }
            },
            Err(CoordinationError::SessionClosed) => {
                self.finished = true;
                None
            }
            Err(source) => {
                self.retry = true;
                Some(Err(WatchError::Read {
                    path: self.path.clone(),
                    source,
                }))
            }
        }
    }

    /// Drop the armed watch and re-read after one backoff interval
    ///
    /// For values that parsed but could not be applied.
    pub fn retry_later(&mut self) {
        self.armed = None;
        self.retry = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T, WatchError>>
    where
        T: Send,
    {
        futures::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|item| (item, watch))
        })
    }
}
