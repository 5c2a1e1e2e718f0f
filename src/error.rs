use thiserror::Error;

use crate::state_machine::Stage;

#[derive(Debug, Error)]
pub enum HuepipeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Pipeline needs at least one {stage} worker, got {count}")]
    InvalidWorkerCount { stage: Stage, count: usize },

    #[error("Pipeline has no source set. Use `with_source` to set it.")]
    MissingSource,

    #[error("Pipeline has no output set. Use `with_output` to set it.")]
    MissingOutput,

    #[error("Pipeline has no stage functions set. Use `with_stages` or `with_client` to set them.")]
    MissingStages,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Classifies a stage failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    Download,
    Summarize,
    Cleanup,
    /// Writing the output row failed. Never retried.
    Save,
    NonRetryable,
}

impl FailureKind {
    /// Whether the failing job may be re-submitted to the stage it failed at.
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureKind::Save | FailureKind::NonRetryable)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Download => write!(f, "Download"),
            FailureKind::Summarize => write!(f, "Summarize"),
            FailureKind::Cleanup => write!(f, "Cleanup"),
            FailureKind::Save => write!(f, "Save"),
            FailureKind::NonRetryable => write!(f, "NonRetryable"),
        }
    }
}
