use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::channels::StageChannels;
use super::stages::StageRunner;
use super::tracker::{CompletionTracker, Eviction, Resolution};
use crate::state_machine::{FailureRecord, StateMachine, Transition};

/// Sole consumer of the failure channel.
///
/// Every retry or evict decision is made here, one record at a time. A retry
/// is re-submitted to the stage it failed at from a separate task, so the
/// handler keeps draining the failure channel while that stage is saturated.
/// Workers blocked on a full failure channel therefore always make progress.
pub(crate) struct FailureHandler<S> {
    runner: Arc<S>,
    channels: StageChannels,
    tracker: Arc<CompletionTracker>,
    shutdown: CancellationToken,
}

impl<S: StageRunner> FailureHandler<S> {
    pub fn new(
        runner: Arc<S>,
        channels: StageChannels,
        tracker: Arc<CompletionTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner,
            channels,
            tracker,
            shutdown,
        }
    }

    pub async fn run(self) {
        let failures = self.channels.failure_receiver().clone();
        let mut resubmits = JoinSet::new();
        loop {
            let record = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = failures.recv() => match received {
                    Ok(record) => record,
                    Err(_) => break,
                },
            };
            self.handle(record, &mut resubmits).await;
            // Reap finished re-submissions.
            while resubmits.try_join_next().is_some() {}
        }
        resubmits.shutdown().await;
        debug!("Failure handler exiting");
    }

    async fn handle(&self, mut record: FailureRecord, resubmits: &mut JoinSet<()>) {
        match StateMachine::on_failure(&mut record.job, record.kind) {
            Transition::Retry { stage, reason } => {
                warn!(
                    subject = %record.job.subject,
                    job_id = %record.job.id,
                    %stage,
                    kind = %reason,
                    failures = record.job.failure_count,
                    message = %record.message,
                    "Job failed, retrying"
                );
                self.tracker.record_retry();

                let sender = self.channels.sender(stage).clone();
                let runner = Arc::clone(&self.runner);
                let tracker = Arc::clone(&self.tracker);
                resubmits.spawn(async move {
                    let FailureRecord { job, kind, message } = record;
                    if let Err(err) = sender.send(job).await {
                        let record = FailureRecord {
                            job: err.into_inner(),
                            kind,
                            message: format!("{message} (stage channel closed)"),
                        };
                        evict(runner.as_ref(), &tracker, record).await;
                    }
                });
            }
            Transition::Evict(_) => evict(self.runner.as_ref(), &self.tracker, record).await,
        }
    }
}

async fn evict<S: StageRunner>(runner: &S, tracker: &CompletionTracker, record: FailureRecord) {
    // Best effort: a job may still hold its downloaded copy.
    if let Err(failure) = runner.cleanup(record.job.work.local_file.as_deref()).await {
        warn!(subject = %record.job.subject, error = %failure, "Failed to release local copy");
    }

    error!(
        subject = %record.job.subject,
        job_id = %record.job.id,
        kind = %record.kind,
        failures = record.job.failure_count,
        message = %record.message,
        "Job evicted"
    );
    tracker.resolve(Resolution::Evicted(Eviction::from_record(&record)));
}
