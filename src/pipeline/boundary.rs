//! Tasks at the two ends of the pipeline: the source feeder admits jobs, the
//! result sink writes finished ones out.

use std::sync::Arc;

use async_channel::Sender;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::StageChannels;
use super::tracker::{CompletionTracker, Eviction, Resolution};
use crate::error::FailureKind;
use crate::palette;
use crate::state_machine::{FailureRecord, Job, Stage, StateMachine};

/// Read subjects line by line and admit each one into the download stage.
///
/// Every job is counted in flight before it is sent. A line that is not
/// valid UTF-8 is skipped on its own. Exhaustion is recorded whether the
/// source ends cleanly or fails to read; a read error stops admission but
/// never leaves the run without an end.
pub(crate) async fn feed_source<R>(
    source: R,
    download: Sender<Job>,
    tracker: Arc<CompletionTracker>,
) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    let mut line_number = 0u64;
    let mut admitted = 0u64;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => line_number += 1,
            Err(err) => {
                error!(error = %err, admitted, "Failed to read source, no further jobs admitted");
                break;
            }
        }
        let Ok(line) = std::str::from_utf8(&buf) else {
            warn!(line = line_number, "Skipping source line that is not valid UTF-8");
            continue;
        };
        let subject = line.trim();
        if subject.is_empty() {
            continue;
        }

        tracker.admit();
        admitted += 1;
        info!(subject, "Starting");

        if let Err(err) = download.send(Job::new(subject)).await {
            let job = err.into_inner();
            let record = FailureRecord::new(job, FailureKind::NonRetryable, "download stage closed");
            tracker.resolve(Resolution::Evicted(Eviction::from_record(&record)));
        }
    }

    debug!(admitted, "Source exhausted");
    tracker.finish_source();
    admitted
}

/// Consumer of the save channel: writes one row per finished job.
pub(crate) struct ResultSink<W> {
    output: W,
    channels: StageChannels,
    tracker: Arc<CompletionTracker>,
    shutdown: CancellationToken,
}

impl<W: AsyncWrite + Unpin> ResultSink<W> {
    pub fn new(
        output: W,
        channels: StageChannels,
        tracker: Arc<CompletionTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            output,
            channels,
            tracker,
            shutdown,
        }
    }

    /// Drain saved jobs until the run completes, then flush the output.
    pub async fn run(mut self) -> std::io::Result<()> {
        let saves = self.channels.receiver(Stage::Save).clone();
        loop {
            let mut job = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = saves.recv() => match received {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            StateMachine::enter(&mut job, Stage::Save);
            match self.write(&job).await {
                Ok(()) => {
                    StateMachine::on_saved(&mut job);
                    info!(subject = %job.subject, job_id = %job.id, "Finished");
                    if self.tracker.resolve(Resolution::Saved) {
                        break;
                    }
                }
                Err(message) => {
                    let record = FailureRecord::new(job, FailureKind::Save, message);
                    if let Err(err) = self.channels.failures().send(record).await {
                        let record = err.into_inner();
                        warn!(subject = %record.job.subject, "Failure channel closed, dropping job");
                    }
                }
            }
        }

        debug!("Result sink exiting");
        self.output.flush().await
    }

    async fn write(&mut self, job: &Job) -> Result<(), String> {
        let summary = job
            .work
            .summary
            .as_ref()
            .ok_or_else(|| "job reached save without a summary".to_string())?;
        let row = palette::serialize_row(&job.subject, summary);
        self.output
            .write_all(row.as_bytes())
            .await
            .map_err(|e| e.to_string())
    }
}
