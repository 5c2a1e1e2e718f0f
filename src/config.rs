//! huepipe configuration loaded from `huepipe.toml`.
//!
//! [`HuepipeConfig`] holds every tunable. Keys missing from the file fall
//! back to defaults. `HUEPIPE_FETCH_TIMEOUT_SECS` takes precedence over the
//! file for the download timeout.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::HuepipeError;
use crate::state_machine::Stage;

const CONFIG_FILE: &str = "huepipe.toml";
const TIMEOUT_ENV: &str = "HUEPIPE_FETCH_TIMEOUT_SECS";

/// Top-level configuration loaded from `huepipe.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuepipeConfig {
    /// Worker pool sizes per stage.
    #[serde(default)]
    pub workers: WorkerCounts,

    /// Seconds before a single download gives up.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Capacity of the failure channel.
    #[serde(default = "default_failure_buffer")]
    pub failure_buffer: usize,

    /// Log level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Number of workers competing on each pooled stage's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    #[serde(default = "default_download_workers")]
    pub download: usize,
    #[serde(default = "default_summarize_workers")]
    pub summarize: usize,
    #[serde(default = "default_cleanup_workers")]
    pub cleanup: usize,
}

fn default_download_workers() -> usize {
    8
}

fn default_summarize_workers() -> usize {
    4
}

fn default_cleanup_workers() -> usize {
    2
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

fn default_failure_buffer() -> usize {
    1000
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            download: default_download_workers(),
            summarize: default_summarize_workers(),
            cleanup: default_cleanup_workers(),
        }
    }
}

impl WorkerCounts {
    pub fn new(download: usize, summarize: usize, cleanup: usize) -> Self {
        Self {
            download,
            summarize,
            cleanup,
        }
    }

    pub fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Download => self.download,
            Stage::Summarize => self.summarize,
            Stage::Cleanup => self.cleanup,
            Stage::Save => 0,
        }
    }

    pub fn total(&self) -> usize {
        self.download + self.summarize + self.cleanup
    }

    /// Every pooled stage needs at least one worker.
    pub fn validate(&self) -> Result<(), HuepipeError> {
        for stage in Stage::POOLED {
            let count = self.for_stage(stage);
            if count == 0 {
                return Err(HuepipeError::InvalidWorkerCount { stage, count });
            }
        }
        Ok(())
    }
}

impl Default for HuepipeConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCounts::default(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            failure_buffer: default_failure_buffer(),
            log_level: default_log_level(),
        }
    }
}

impl HuepipeConfig {
    /// Load `huepipe.toml` from the current directory.
    /// Uses defaults if the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Load configuration from `path`, falling back to defaults when absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<HuepipeConfig>(&contents)?
        } else {
            Self::default()
        };

        config.override_timeout(std::env::var(TIMEOUT_ENV).ok())?;
        Ok(config)
    }

    /// Apply the `HUEPIPE_FETCH_TIMEOUT_SECS` value. Unset or empty keeps the
    /// current timeout.
    fn override_timeout(&mut self, raw: Option<String>) -> Result<(), HuepipeError> {
        if let Some(raw) = raw.filter(|raw| !raw.is_empty()) {
            self.fetch_timeout_secs = raw.parse().map_err(|_| {
                HuepipeError::Config(format!("{TIMEOUT_ENV} must be a whole number of seconds, got {raw:?}"))
            })?;
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
