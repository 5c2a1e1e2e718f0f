use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobState, MAX_FAILURES};
use crate::error::FailureKind;
use crate::palette::Summary;

/// One ordered step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Download,
    Summarize,
    Cleanup,
    Save,
}

impl Stage {
    /// Stages served by a worker pool. `Save` is drained by the result sink.
    pub const POOLED: [Stage; 3] = [Stage::Download, Stage::Summarize, Stage::Cleanup];

    /// The stage a job is forwarded to after succeeding here.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::Summarize),
            Stage::Summarize => Some(Stage::Cleanup),
            Stage::Cleanup => Some(Stage::Save),
            Stage::Save => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Summarize => write!(f, "summarize"),
            Stage::Cleanup => write!(f, "cleanup"),
            Stage::Save => write!(f, "save"),
        }
    }
}

/// Stage-specific payload carried by a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workpiece {
    /// Downloaded copy of the subject, present between download and cleanup.
    pub local_file: Option<PathBuf>,
    pub summary: Option<Summary>,
}

/// The work record for one subject as it traverses the stages.
///
/// Not `Clone`: a job has exactly one owner at a time and moves between
/// channels by value.
#[derive(Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub subject: String,
    pub work: Workpiece,
    /// Stage to re-submit to on a retryable failure. Bound on dequeue.
    pub origin: Option<Stage>,
    /// Stage to forward to on success. Bound on dequeue.
    pub next: Option<Stage>,
    pub failure_count: u32,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub admitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            work: Workpiece::default(),
            origin: None,
            next: None,
            failure_count: 0,
            state: JobState::Pending,
            state_history: Vec::new(),
            admitted_at: Utc::now(),
        }
    }
}

/// A reported stage failure awaiting a retry or evict decision.
#[derive(Debug)]
pub struct FailureRecord {
    pub job: Job,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureRecord {
    /// Record a failure, counting it against the job.
    pub fn new(mut job: Job, kind: FailureKind, message: impl Into<String>) -> Self {
        job.failure_count = (job.failure_count + 1).min(MAX_FAILURES);
        Self {
            job,
            kind,
            message: message.into(),
        }
    }
}
