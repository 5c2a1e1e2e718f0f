//! Stage functions invoked by the worker pools.
//!
//! [`StageRunner`] is the seam between the pipeline engine and the work it
//! performs. [`ImageStages`] is the production implementation: HTTP download,
//! prevalent-color summary, temp file removal.

use std::future::Future;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::error::FailureKind;
use crate::fetch::Fetcher;
use crate::palette::{self, Summary};

/// A failed stage function call, converted by the worker into a failure record.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} failure: {message}")]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub type StageResult<T> = Result<T, StageFailure>;

/// The work performed by each pooled stage.
///
/// Implementations are shared by every worker, so calls may run concurrently.
pub trait StageRunner: Send + Sync + 'static {
    /// Fetch `subject` into a local resource.
    fn download(&self, subject: &str) -> impl Future<Output = StageResult<PathBuf>> + Send;

    /// Compute the summary of a downloaded resource.
    fn summarize(&self, local: &Path) -> impl Future<Output = StageResult<Summary>> + Send;

    /// Release a local resource. `None` is a no-op success.
    fn cleanup(&self, local: Option<&Path>) -> impl Future<Output = StageResult<()>> + Send;
}

/// Production stage functions for image URLs.
pub struct ImageStages {
    fetcher: Fetcher,
}

impl ImageStages {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }
}

impl StageRunner for ImageStages {
    async fn download(&self, subject: &str) -> StageResult<PathBuf> {
        self.fetcher
            .fetch_to_file(subject)
            .await
            .map_err(|e| StageFailure::new(e.failure_kind(), e.to_string()))
    }

    async fn summarize(&self, local: &Path) -> StageResult<Summary> {
        let path = local.to_path_buf();
        // Decoding and counting are CPU-bound.
        tokio::task::spawn_blocking(move || palette::summarize_file(&path))
            .await
            .map_err(|e| StageFailure::new(FailureKind::Summarize, e.to_string()))?
            .map_err(|e| StageFailure::new(FailureKind::Summarize, e.to_string()))
    }

    async fn cleanup(&self, local: Option<&Path>) -> StageResult<()> {
        let Some(path) = local else {
            return Ok(());
        };
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| StageFailure::new(FailureKind::Cleanup, format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Removed local copy");
        Ok(())
    }
}
