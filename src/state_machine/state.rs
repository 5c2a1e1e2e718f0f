use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::{Job, Stage};
use crate::error::FailureKind;

/// Failures a job may accumulate before it is evicted.
pub const MAX_FAILURES: u32 = 3;

/// Lifecycle of a single job.
///
/// `Pending → Downloading → Summarizing → Cleaning → Saving → Saved`, where
/// every active state may fork to `Retrying(stage)` (which re-enters the same
/// stage) or to `Evicted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Downloading,
    Summarizing,
    Cleaning,
    Saving,
    Retrying(Stage),
    Saved,
    Evicted,
}

impl JobState {
    /// The state a job is in while `stage` holds it.
    pub fn active(stage: Stage) -> Self {
        match stage {
            Stage::Download => JobState::Downloading,
            Stage::Summarize => JobState::Summarizing,
            Stage::Cleanup => JobState::Cleaning,
            Stage::Save => JobState::Saving,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Saved | JobState::Evicted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Downloading => write!(f, "DOWNLOADING"),
            JobState::Summarizing => write!(f, "SUMMARIZING"),
            JobState::Cleaning => write!(f, "CLEANING"),
            JobState::Saving => write!(f, "SAVING"),
            JobState::Retrying(stage) => write!(f, "RETRYING({stage})"),
            JobState::Saved => write!(f, "SAVED"),
            JobState::Evicted => write!(f, "EVICTED"),
        }
    }
}

/// The decision taken for a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Re-submit the job to the stage it failed at.
    Retry { stage: Stage, reason: FailureKind },
    /// Remove the job from the pipeline without output.
    Evict(FailureKind),
}

/// Drives a `Job` through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Bind a freshly dequeued job to `stage`: failures return here, success
    /// forwards to the following stage.
    pub fn enter(job: &mut Job, stage: Stage) {
        job.origin = Some(stage);
        job.next = stage.next();
        Self::advance(job, JobState::active(stage));
    }

    /// Decide what happens to a job whose failure has already been counted.
    ///
    /// - Non-retryable kinds evict immediately.
    /// - A job that has reached [`MAX_FAILURES`] is evicted.
    /// - A job that never entered a stage has nowhere to return to and is
    ///   evicted.
    /// - Anything else retries at its origin stage.
    pub fn on_failure(job: &mut Job, kind: FailureKind) -> Transition {
        let transition = match job.origin {
            Some(stage) if kind.is_retryable() && job.failure_count < MAX_FAILURES => {
                Transition::Retry {
                    stage,
                    reason: kind,
                }
            }
            _ => Transition::Evict(kind),
        };

        match &transition {
            Transition::Retry { stage, .. } => Self::advance(job, JobState::Retrying(*stage)),
            Transition::Evict(_) => Self::advance(job, JobState::Evicted),
        }

        transition
    }

    pub fn on_saved(job: &mut Job) {
        Self::advance(job, JobState::Saved);
    }

    fn advance(job: &mut Job, next: JobState) {
        job.state_history.push(job.state);
        job.state = next;
    }
}
