//! Content transfer between storage nodes
//!
//! [`Transfer`] copies the content at one resolved URL to another. The
//! replicator treats any error as a failed job and releases it.
//!
//! [`HttpTransfer`] GETs the source and streams the body straight into a PUT
//! on the destination, so content is never buffered whole.

use async_trait::async_trait;
use reqwest::{Body, Client};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::TransferConfig;

pub type SharedTransfer = Arc<dyn Transfer>;

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Source {url} answered {status}")]
    SourceStatus { url: Url, status: u16 },

    #[error("Destination {url} answered {status}")]
    DestinationStatus { url: Url, status: u16 },

    #[error("Transfer failed: {0}")]
    Other(String),
}

impl TransferError {
    /// HTTP status behind the failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::SourceStatus { status, .. } | Self::DestinationStatus { status, .. } => {
                Some(*status)
            }
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Other(_) => None,
        }
    }
}

/// Copies content from a source URL to a destination URL
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn transfer(&self, source: &Url, destination: &Url) -> Result<(), TransferError>;
}

/// Streaming GET-then-PUT transfer
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    /// Create a new transfer client
    pub fn new(config: &TransferConfig) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn transfer(&self, source: &Url, destination: &Url) -> Result<(), TransferError> {
        let response = self.client.get(source.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::SourceStatus {
                url: source.clone(),
                status: status.as_u16(),
            });
        }

        let mut request = self.client.put(destination.clone());
        if let Some(length) = response.content_length() {
            request = request.header(reqwest::header::CONTENT_LENGTH, length);
        }
        if let Some(content_type) = response.headers().get(reqwest::header::CONTENT_TYPE) {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type.clone());
        }

        let body = Body::wrap_stream(response.bytes_stream());
        let response = request.body(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::DestinationStatus {
                url: destination.clone(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(source = %source, destination = %destination, "Transfer complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_of_errors() {
        let url = Url::parse("http://node-1:8080/a").unwrap();
        let err = TransferError::SourceStatus {
            url: url.clone(),
            status: 404,
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "Source http://node-1:8080/a answered 404");
        assert_eq!(TransferError::Other("x".to_string()).status(), None);
    }

    #[test]
    fn test_client_builds_from_default_config() {
        assert!(HttpTransfer::new(&TransferConfig::default()).is_ok());
    }
}
