use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channels::StageChannels;
use super::stages::{StageFailure, StageResult, StageRunner};
use crate::error::FailureKind;
use crate::state_machine::{FailureRecord, Job, Stage, StateMachine};

/// One slot of a stage's worker pool.
///
/// All workers of a stage compete on the same channel; whichever receives a
/// job owns it until it is forwarded or reported as failed.
pub(crate) struct StageWorker<S> {
    stage: Stage,
    index: usize,
    runner: Arc<S>,
    channels: StageChannels,
    shutdown: CancellationToken,
}

impl<S: StageRunner> StageWorker<S> {
    pub fn new(
        stage: Stage,
        index: usize,
        runner: Arc<S>,
        channels: StageChannels,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stage,
            index,
            runner,
            channels,
            shutdown,
        }
    }

    pub async fn run(self) {
        let input = self.channels.receiver(self.stage).clone();
        loop {
            let mut job = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = input.recv() => match received {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            StateMachine::enter(&mut job, self.stage);
            match self.process(&mut job).await {
                Ok(()) => self.forward(job).await,
                Err(failure) => self.report(job, failure).await,
            }
        }
        debug!(stage = %self.stage, worker = self.index, "Worker exiting");
    }

    async fn process(&self, job: &mut Job) -> StageResult<()> {
        match self.stage {
            Stage::Download => {
                let local = self.runner.download(&job.subject).await?;
                job.work.local_file = Some(local);
                info!(subject = %job.subject, job_id = %job.id, "Downloaded");
            }
            Stage::Summarize => {
                let Some(local) = job.work.local_file.as_deref() else {
                    return Err(StageFailure::new(
                        FailureKind::NonRetryable,
                        "no local copy to summarize",
                    ));
                };
                let summary = self.runner.summarize(local).await?;
                job.work.summary = Some(summary);
                info!(subject = %job.subject, job_id = %job.id, "Summarized");
            }
            Stage::Cleanup => {
                self.runner.cleanup(job.work.local_file.as_deref()).await?;
                job.work.local_file = None;
                info!(subject = %job.subject, job_id = %job.id, "Cleaned");
            }
            Stage::Save => {
                return Err(StageFailure::new(
                    FailureKind::NonRetryable,
                    "save has no worker pool",
                ));
            }
        }
        Ok(())
    }

    /// Blocking hand-off to the next stage; a slow consumer throttles this pool.
    async fn forward(&self, job: Job) {
        let Some(next) = job.next else {
            self.report(job, StageFailure::new(FailureKind::NonRetryable, "no next stage"))
                .await;
            return;
        };
        if let Err(err) = self.channels.sender(next).send(job).await {
            let job = err.into_inner();
            warn!(subject = %job.subject, stage = %next, "Stage channel closed, dropping job");
        }
    }

    async fn report(&self, job: Job, failure: StageFailure) {
        let record = FailureRecord::new(job, failure.kind, failure.message);
        if let Err(err) = self.channels.failures().send(record).await {
            let record = err.into_inner();
            warn!(subject = %record.job.subject, "Failure channel closed, dropping job");
        }
    }
}
