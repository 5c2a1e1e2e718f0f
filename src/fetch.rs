//! HTTP download of pipeline subjects into local temp files.
//!
//! [`Fetcher`] wraps a `reqwest` client whose total timeout bounds every
//! request, so a stalled remote cannot hold a download worker forever.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::error::FailureKind;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while downloading a subject.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The server answered with an error status (>= 400).
    #[error("url invalid (status {status})")]
    Status { status: u16 },

    /// The request did not complete within the client timeout.
    #[error("request timed out")]
    Timeout,

    /// The subject could not be turned into a request.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Connection, DNS, or body transfer failure.
    #[error("network error: {0}")]
    Network(reqwest::Error),

    /// The temp file could not be created or written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else {
            FetchError::Network(err)
        }
    }
}

impl FetchError {
    /// Client errors other than 408/429 and malformed URLs will not improve
    /// on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                !status.is_client_error()
                    || status == StatusCode::REQUEST_TIMEOUT
                    || status == StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::InvalidUrl(_) => false,
            FetchError::Timeout | FetchError::Network(_) | FetchError::Io(_) => true,
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        if self.is_retryable() {
            FailureKind::Download
        } else {
            FailureKind::NonRetryable
        }
    }
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Use a caller-provided client (custom timeouts, proxies, test servers).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Download `url` into a fresh temp file and return its path.
    ///
    /// The caller owns the returned file. A partially written file is removed
    /// before an error is returned.
    pub async fn fetch_to_file(&self, url: &str) -> Result<PathBuf, FetchError> {
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let temp = tempfile::Builder::new()
            .prefix("huepipe-")
            .suffix(".img")
            .tempfile()?;
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        // `path` deletes the file on drop until it is kept.
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        path.keep().map_err(|e| FetchError::Io(e.error))
    }
}
