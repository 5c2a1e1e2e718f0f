//! Global completion detection and the one-shot shutdown broadcast.
//!
//! [`CompletionTracker`] owns the only cross-cutting mutable state of a run:
//! whether the source is exhausted and how many admitted jobs are still in
//! flight. Both live behind one mutex, and the "decrement, test, maybe
//! broadcast" sequence runs inside a single critical section, so two jobs
//! finishing at the same time cannot both see a non-zero count and leave the
//! pipeline running forever.
//!
//! The broadcast itself is guarded by a compare-and-swap latch and fires at
//! most once per tracker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::FailureKind;
use crate::state_machine::{FailureRecord, Stage};

/// Run-level lifecycle: `Running → Completing → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Running,
    Completing,
    Stopped,
}

/// A job removed from the pipeline without output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Eviction {
    pub job_id: String,
    pub subject: String,
    pub stage: Option<Stage>,
    pub kind: FailureKind,
    pub message: String,
    pub failure_count: u32,
}

impl Eviction {
    pub fn from_record(record: &FailureRecord) -> Self {
        Self {
            job_id: record.job.id.clone(),
            subject: record.job.subject.clone(),
            stage: record.job.origin,
            kind: record.kind,
            message: record.message.clone(),
            failure_count: record.job.failure_count,
        }
    }
}

/// How an in-flight job left the pipeline.
#[derive(Debug)]
pub enum Resolution {
    Saved,
    Evicted(Eviction),
}

/// Point-in-time counters for progress display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub admitted: u64,
    pub in_flight: u64,
    pub saved: u64,
    pub evicted: u64,
    pub retries: u64,
    pub phase: Phase,
}

#[derive(Debug)]
struct CompletionState {
    source_exhausted: bool,
    in_flight: u64,
    admitted: u64,
    saved: u64,
    retries: u64,
    evictions: Vec<Eviction>,
    phase: Phase,
}

pub struct CompletionTracker {
    state: Mutex<CompletionState>,
    latch: AtomicBool,
    broadcasts: AtomicUsize,
    shutdown: CancellationToken,
    listeners: usize,
}

impl CompletionTracker {
    /// `listeners` is the number of tasks expected to observe the shutdown.
    pub fn new(listeners: usize) -> Self {
        Self {
            state: Mutex::new(CompletionState {
                source_exhausted: false,
                in_flight: 0,
                admitted: 0,
                saved: 0,
                retries: 0,
                evictions: Vec::new(),
                phase: Phase::Running,
            }),
            latch: AtomicBool::new(false),
            broadcasts: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            listeners,
        }
    }

    /// Token cancelled by the shutdown broadcast.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Count a job entering the pipeline. Must precede its first send.
    pub fn admit(&self) {
        let mut state = self.lock();
        state.admitted += 1;
        state.in_flight += 1;
    }

    /// Record that the source has no more jobs. Returns `true` if this call
    /// completed the run.
    pub fn finish_source(&self) -> bool {
        let mut state = self.lock();
        state.source_exhausted = true;
        self.complete_if_drained(&mut state)
    }

    /// Record a job leaving the pipeline. Returns `true` if this call
    /// completed the run.
    pub fn resolve(&self, resolution: Resolution) -> bool {
        let mut state = self.lock();
        if state.in_flight == 0 {
            error!(?resolution, "Resolved a job that was never admitted");
            return false;
        }
        state.in_flight -= 1;
        match resolution {
            Resolution::Saved => state.saved += 1,
            Resolution::Evicted(eviction) => state.evictions.push(eviction),
        }
        self.complete_if_drained(&mut state)
    }

    /// Count a failed job sent back to its stage. Retries do not change the
    /// in-flight count.
    pub fn record_retry(&self) {
        self.lock().retries += 1;
    }

    pub fn progress(&self) -> Progress {
        let state = self.lock();
        Progress {
            admitted: state.admitted,
            in_flight: state.in_flight,
            saved: state.saved,
            evicted: state.evictions.len() as u64,
            retries: state.retries,
            phase: state.phase,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Number of shutdown broadcasts sent. At most one.
    pub fn broadcasts(&self) -> usize {
        self.broadcasts.load(Ordering::Acquire)
    }

    fn complete_if_drained(&self, state: &mut CompletionState) -> bool {
        if state.phase != Phase::Running || !state.source_exhausted || state.in_flight > 0 {
            return false;
        }
        state.phase = Phase::Completing;
        let fired = self.broadcast_shutdown();
        state.phase = Phase::Stopped;
        fired
    }

    fn broadcast_shutdown(&self) -> bool {
        if self
            .latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.broadcasts.fetch_add(1, Ordering::AcqRel);
        info!(listeners = self.listeners, "Pipeline complete, broadcasting shutdown");
        self.shutdown.cancel();
        true
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub admitted: u64,
    pub saved: u64,
    pub retries: u64,
    pub evictions: Vec<Eviction>,
    pub phase: Phase,
    pub shutdown_broadcasts: usize,
    pub listeners: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunReport {
    pub fn from_tracker(tracker: &CompletionTracker, started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        let state = tracker.lock();
        Self {
            admitted: state.admitted,
            saved: state.saved,
            retries: state.retries,
            evictions: state.evictions.clone(),
            phase: state.phase,
            shutdown_broadcasts: tracker.broadcasts(),
            listeners: tracker.listeners,
            started_at,
            finished_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }
}
