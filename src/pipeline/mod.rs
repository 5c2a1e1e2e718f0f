//! The staged, bounded, concurrent pipeline.
//!
//! A run wires four job channels (download, summarize, cleanup, save) and a
//! failure channel between:
//!
//! - the source feeder, which admits one job per subject line;
//! - one worker pool per pooled stage;
//! - the failure handler, which decides between retry and eviction;
//! - the result sink, which writes one row per saved job.
//!
//! The run ends when the [`CompletionTracker`] sees the source exhausted and
//! no job in flight. It then cancels the shared shutdown token once, every
//! task exits, and the channels are closed.

mod boundary;
mod channels;
mod failure;
pub mod stages;
pub mod tracker;
mod worker;

use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::WorkerCounts;
use crate::error::HuepipeError;
use crate::fetch::Fetcher;
use crate::state_machine::Stage;

use boundary::{ResultSink, feed_source};
use channels::StageChannels;
use failure::FailureHandler;
use worker::StageWorker;

pub use stages::{ImageStages, StageRunner};
pub use tracker::{CompletionTracker, Progress, RunReport};

/// Default capacity of the failure channel.
pub const DEFAULT_FAILURE_BUFFER: usize = 1000;

type BoxedSource = Box<dyn AsyncRead + Unpin + Send>;
type BoxedOutput = Box<dyn AsyncWrite + Unpin + Send>;

/// A configured, not yet started run.
pub struct Pipeline<S> {
    workers: WorkerCounts,
    failure_buffer: usize,
    source: BoxedSource,
    output: BoxedOutput,
    stages: Arc<S>,
    tracker: Arc<CompletionTracker>,
}

/// Builder for [`Pipeline`].
///
/// Source, output and stage functions are required; `build` rejects a
/// pipeline missing any of them, or with an empty worker pool.
pub struct PipelineBuilder<S> {
    workers: WorkerCounts,
    failure_buffer: usize,
    source: Option<BoxedSource>,
    output: Option<BoxedOutput>,
    stages: Option<S>,
}

impl Pipeline<ImageStages> {
    pub fn builder(workers: WorkerCounts) -> PipelineBuilder<ImageStages> {
        PipelineBuilder {
            workers,
            failure_buffer: DEFAULT_FAILURE_BUFFER,
            source: None,
            output: None,
            stages: None,
        }
    }
}

impl<S> PipelineBuilder<S> {
    pub fn failure_buffer(mut self, capacity: usize) -> Self {
        self.failure_buffer = capacity;
        self
    }

    /// Subjects are read one per line.
    pub fn with_source(mut self, source: impl AsyncRead + Unpin + Send + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_output(mut self, output: impl AsyncWrite + Unpin + Send + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Replace the stage functions.
    pub fn with_stages<T: StageRunner>(self, stages: T) -> PipelineBuilder<T> {
        PipelineBuilder {
            workers: self.workers,
            failure_buffer: self.failure_buffer,
            source: self.source,
            output: self.output,
            stages: Some(stages),
        }
    }
}

impl PipelineBuilder<ImageStages> {
    /// Use the image stage functions, downloading through `client`.
    #[allow(dead_code)]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.stages = Some(ImageStages::new(Fetcher::with_client(client)));
        self
    }
}

impl<S: StageRunner> PipelineBuilder<S> {
    pub fn build(self) -> Result<Pipeline<S>, HuepipeError> {
        self.workers.validate()?;
        if self.failure_buffer == 0 {
            return Err(HuepipeError::Config(
                "failure_buffer must be at least 1".to_string(),
            ));
        }
        let source = self.source.ok_or(HuepipeError::MissingSource)?;
        let output = self.output.ok_or(HuepipeError::MissingOutput)?;
        let stages = self.stages.ok_or(HuepipeError::MissingStages)?;

        // Every pooled worker plus the failure handler observes the shutdown.
        let tracker = Arc::new(CompletionTracker::new(self.workers.total() + 1));

        Ok(Pipeline {
            workers: self.workers,
            failure_buffer: self.failure_buffer,
            source,
            output,
            stages: Arc::new(stages),
            tracker,
        })
    }
}

impl<S: StageRunner> Pipeline<S> {
    /// Shared handle for observing progress while the run is in progress.
    pub fn tracker(&self) -> Arc<CompletionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run until every admitted job is saved or evicted.
    ///
    /// Returns once every task has exited and every channel is closed.
    pub async fn run(self) -> Result<RunReport, HuepipeError> {
        let started_at = Utc::now();
        let Pipeline {
            workers,
            failure_buffer,
            source,
            output,
            stages,
            tracker,
        } = self;

        let channels = StageChannels::new(failure_buffer);
        let shutdown = tracker.shutdown_token();
        info!(
            download = workers.download,
            summarize = workers.summarize,
            cleanup = workers.cleanup,
            failure_buffer,
            "Starting pipeline"
        );

        let mut listeners = JoinSet::new();
        listeners.spawn(
            FailureHandler::new(
                Arc::clone(&stages),
                channels.clone(),
                Arc::clone(&tracker),
                shutdown.clone(),
            )
            .run(),
        );
        for stage in Stage::POOLED {
            for index in 0..workers.for_stage(stage) {
                listeners.spawn(
                    StageWorker::new(
                        stage,
                        index,
                        Arc::clone(&stages),
                        channels.clone(),
                        shutdown.clone(),
                    )
                    .run(),
                );
            }
        }

        let sink = tokio::spawn(
            ResultSink::new(output, channels.clone(), Arc::clone(&tracker), shutdown.clone()).run(),
        );
        let feeder = tokio::spawn(feed_source(
            source,
            channels.sender(Stage::Download).clone(),
            Arc::clone(&tracker),
        ));

        let admitted = feeder.await?;
        debug!(admitted, "Feeder finished");

        while let Some(joined) = listeners.join_next().await {
            joined?;
        }
        sink.await??;

        channels.close();

        let report = RunReport::from_tracker(&tracker, started_at);
        info!(
            admitted = report.admitted,
            saved = report.saved,
            evicted = report.evictions.len(),
            retries = report.retries,
            duration_ms = report.duration_ms,
            "Pipeline stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::palette::{Color, Summary};
    use super::stages::{StageFailure, StageResult};
    use super::tracker::Phase;
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    const VIRTUAL_ROOT: &str = "/virtual";

    /// Per-subject failure script: fail the first `times` calls with `kind`.
    #[derive(Clone, Copy)]
    struct Fail {
        times: u32,
        kind: FailureKind,
    }

    #[derive(Default)]
    struct CallLog {
        calls: Mutex<HashMap<(Stage, String), u32>>,
    }

    impl CallLog {
        /// Count the call and return how many came before it.
        fn record(&self, stage: Stage, subject: &str) -> u32 {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry((stage, subject.to_string())).or_insert(0);
            *count += 1;
            *count - 1
        }

        fn count(&self, stage: Stage, subject: &str) -> u32 {
            let calls = self.calls.lock().unwrap();
            calls.get(&(stage, subject.to_string())).copied().unwrap_or(0)
        }

        fn total(&self, stage: Stage) -> u32 {
            let calls = self.calls.lock().unwrap();
            calls.iter().filter(|((s, _), _)| *s == stage).map(|(_, n)| n).sum()
        }
    }

    #[derive(Default)]
    struct ScriptedStages {
        download: HashMap<String, Fail>,
        summarize: HashMap<String, Fail>,
        cleanup: HashMap<String, Fail>,
        log: Arc<CallLog>,
    }

    impl ScriptedStages {
        fn fail(mut self, stage: Stage, subject: &str, times: u32, kind: FailureKind) -> Self {
            let script = match stage {
                Stage::Download => &mut self.download,
                Stage::Summarize => &mut self.summarize,
                Stage::Cleanup => &mut self.cleanup,
                Stage::Save => panic!("save is not scripted"),
            };
            script.insert(subject.to_string(), Fail { times, kind });
            self
        }

        fn call(&self, stage: Stage, subject: &str) -> StageResult<()> {
            let previous = self.log.record(stage, subject);
            let script = match stage {
                Stage::Download => &self.download,
                Stage::Summarize => &self.summarize,
                _ => &self.cleanup,
            };
            match script.get(subject) {
                Some(fail) if previous < fail.times => {
                    Err(StageFailure::new(fail.kind, format!("scripted {stage} failure")))
                }
                _ => Ok(()),
            }
        }
    }

    fn subject_of(local: &Path) -> String {
        local
            .strip_prefix(VIRTUAL_ROOT)
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    fn summary_for(subject: &str) -> Summary {
        let shade = subject.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        Summary([Color::new(shade, 0, 0), Color::new(0, shade, 0), Color::new(0, 0, shade)])
    }

    impl StageRunner for ScriptedStages {
        async fn download(&self, subject: &str) -> StageResult<PathBuf> {
            tokio::task::yield_now().await;
            self.call(Stage::Download, subject)?;
            Ok(Path::new(VIRTUAL_ROOT).join(subject))
        }

        async fn summarize(&self, local: &Path) -> StageResult<Summary> {
            let subject = subject_of(local);
            tokio::task::yield_now().await;
            self.call(Stage::Summarize, &subject)?;
            Ok(summary_for(&subject))
        }

        async fn cleanup(&self, local: Option<&Path>) -> StageResult<()> {
            match local {
                Some(local) => self.call(Stage::Cleanup, &subject_of(local)),
                None => {
                    self.log.record(Stage::Cleanup, "<none>");
                    Ok(())
                }
            }
        }
    }

    struct Outcome {
        report: RunReport,
        rows: Vec<String>,
        log: Arc<CallLog>,
    }

    impl Outcome {
        fn saved_subjects(&self) -> Vec<String> {
            self.rows
                .iter()
                .map(|row| row.split(',').next().unwrap().to_string())
                .collect()
        }
    }

    async fn run_scripted(stages: ScriptedStages, source: String, workers: WorkerCounts) -> Outcome {
        let log = Arc::clone(&stages.log);
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.csv");
        let output = tokio::fs::File::create(&out_path).await.unwrap();

        let pipeline = Pipeline::builder(workers)
            .with_source(std::io::Cursor::new(source.into_bytes()))
            .with_output(output)
            .with_stages(stages)
            .build()
            .unwrap();
        let report = timeout(Duration::from_secs(30), pipeline.run())
            .await
            .expect("pipeline did not stop")
            .unwrap();

        let rows = std::fs::read_to_string(&out_path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        Outcome { report, rows, log }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn transient_download_failures_are_retried() {
        let stages = ScriptedStages::default().fail(Stage::Download, "A", 2, FailureKind::Download);
        let out = run_scripted(stages, "A\nB\n".to_string(), WorkerCounts::new(2, 2, 2)).await;

        let mut saved = out.saved_subjects();
        saved.sort();
        assert_eq!(saved, vec!["A", "B"]);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.log.count(Stage::Download, "A"), 3);
        assert_eq!(out.log.count(Stage::Download, "B"), 1);
        assert_eq!(out.report.retries, 2);
        assert!(out.report.evictions.is_empty());
        assert_eq!(out.report.phase, Phase::Stopped);
        assert_eq!(out.report.shutdown_broadcasts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn non_retryable_failure_evicts_immediately() {
        let stages = ScriptedStages::default().fail(Stage::Download, "C", u32::MAX, FailureKind::NonRetryable);
        let out = run_scripted(stages, "C\n".to_string(), WorkerCounts::new(1, 1, 1)).await;

        assert!(out.rows.is_empty());
        assert_eq!(out.log.count(Stage::Download, "C"), 1);
        assert_eq!(out.report.evictions.len(), 1);
        let eviction = &out.report.evictions[0];
        assert_eq!(eviction.subject, "C");
        assert_eq!(eviction.kind, FailureKind::NonRetryable);
        assert_eq!(eviction.stage, Some(Stage::Download));
        assert_eq!(eviction.failure_count, 1);
        assert_eq!(out.report.phase, Phase::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retries_stop_at_the_failure_limit() {
        let stages = ScriptedStages::default().fail(Stage::Download, "D", u32::MAX, FailureKind::Download);
        let out = run_scripted(stages, "D\n".to_string(), WorkerCounts::new(2, 1, 1)).await;

        assert!(out.rows.is_empty());
        assert_eq!(out.log.count(Stage::Download, "D"), crate::state_machine::MAX_FAILURES);
        assert_eq!(out.log.total(Stage::Summarize), 0);
        assert_eq!(out.report.retries, u64::from(crate::state_machine::MAX_FAILURES) - 1);
        assert_eq!(out.report.evictions.len(), 1);
        assert_eq!(out.report.evictions[0].failure_count, crate::state_machine::MAX_FAILURES);
        assert_eq!(out.report.evictions[0].kind, FailureKind::Download);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retry_resumes_at_the_failed_stage() {
        let stages = ScriptedStages::default().fail(Stage::Summarize, "E", 2, FailureKind::Summarize);
        let out = run_scripted(stages, "E\n".to_string(), WorkerCounts::new(1, 1, 1)).await;

        assert_eq!(out.saved_subjects(), vec!["E"]);
        assert_eq!(out.log.count(Stage::Download, "E"), 1);
        assert_eq!(out.log.count(Stage::Summarize, "E"), 3);
        assert_eq!(out.log.count(Stage::Cleanup, "E"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn eviction_after_download_releases_local_copy() {
        let stages = ScriptedStages::default().fail(Stage::Summarize, "F", u32::MAX, FailureKind::NonRetryable);
        let out = run_scripted(stages, "F\n".to_string(), WorkerCounts::new(1, 1, 1)).await;

        assert!(out.rows.is_empty());
        assert_eq!(out.report.evictions[0].stage, Some(Stage::Summarize));
        // Released by the failure handler, not by a cleanup worker.
        assert_eq!(out.log.count(Stage::Cleanup, "F"), 1);
    }

    #[tokio::test]
    async fn empty_source_stops_immediately() {
        let out = run_scripted(ScriptedStages::default(), "\n  \n".to_string(), WorkerCounts::new(3, 2, 1)).await;

        assert!(out.rows.is_empty());
        assert_eq!(out.report.admitted, 0);
        assert_eq!(out.report.phase, Phase::Stopped);
        assert_eq!(out.report.shutdown_broadcasts, 1);
        assert_eq!(out.report.listeners, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_job_is_saved_or_evicted_exactly_once() {
        const JOBS: usize = 200;
        let subjects: Vec<String> = (0..JOBS).map(|i| format!("job-{i:03}")).collect();

        let mut stages = ScriptedStages::default();
        let mut doomed = HashSet::new();
        for (i, subject) in subjects.iter().enumerate() {
            if i % 7 == 0 {
                stages = stages.fail(Stage::Download, subject, u32::MAX, FailureKind::NonRetryable);
                doomed.insert(subject.clone());
            } else if i % 11 == 0 {
                stages = stages.fail(Stage::Cleanup, subject, u32::MAX, FailureKind::Cleanup);
                doomed.insert(subject.clone());
            } else if i % 5 == 0 {
                stages = stages.fail(Stage::Download, subject, 1, FailureKind::Download);
            } else if i % 3 == 0 {
                stages = stages.fail(Stage::Summarize, subject, 2, FailureKind::Summarize);
            }
        }

        let out = run_scripted(stages, subjects.join("\n"), WorkerCounts::new(3, 2, 2)).await;

        let saved: HashSet<String> = out.saved_subjects().into_iter().collect();
        let evicted: HashSet<String> = out.report.evictions.iter().map(|e| e.subject.clone()).collect();
        assert_eq!(saved.len(), out.rows.len(), "a subject was saved twice");
        assert_eq!(evicted.len(), out.report.evictions.len(), "a subject was evicted twice");
        assert!(saved.is_disjoint(&evicted));
        assert_eq!(saved.len() + evicted.len(), JOBS);
        assert_eq!(evicted, doomed);

        assert_eq!(out.report.admitted, JOBS as u64);
        assert_eq!(out.report.saved, saved.len() as u64);
        assert_eq!(out.report.shutdown_broadcasts, 1);
        assert_eq!(out.report.phase, Phase::Stopped);
    }

    #[tokio::test]
    async fn rows_follow_the_summary() {
        let out = run_scripted(ScriptedStages::default(), "G\n".to_string(), WorkerCounts::new(1, 1, 1)).await;
        let expected = crate::palette::serialize_row("G", &summary_for("G"));
        assert_eq!(out.rows, vec![expected.trim_end().to_string()]);
    }

    #[test]
    fn build_rejects_empty_pool() {
        let err = Pipeline::builder(WorkerCounts::new(1, 0, 1))
            .with_source(tokio::io::empty())
            .with_output(tokio::io::sink())
            .with_stages(ScriptedStages::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            HuepipeError::InvalidWorkerCount { stage: Stage::Summarize, count: 0 }
        ));
    }

    #[test]
    fn build_rejects_missing_parts() {
        let no_source = Pipeline::builder(WorkerCounts::default())
            .with_output(tokio::io::sink())
            .with_stages(ScriptedStages::default())
            .build();
        assert!(matches!(no_source.err(), Some(HuepipeError::MissingSource)));

        let no_output = Pipeline::builder(WorkerCounts::default())
            .with_source(tokio::io::empty())
            .with_stages(ScriptedStages::default())
            .build();
        assert!(matches!(no_output.err(), Some(HuepipeError::MissingOutput)));

        let no_stages = Pipeline::builder(WorkerCounts::default())
            .with_source(tokio::io::empty())
            .with_output(tokio::io::sink())
            .build();
        assert!(matches!(no_stages.err(), Some(HuepipeError::MissingStages)));
    }

    #[test]
    fn build_rejects_zero_failure_buffer() {
        let result = Pipeline::builder(WorkerCounts::default())
            .failure_buffer(0)
            .with_source(tokio::io::empty())
            .with_output(tokio::io::sink())
            .with_stages(ScriptedStages::default())
            .build();
        assert!(matches!(result.err(), Some(HuepipeError::Config(_))));
    }

    #[test]
    fn any_positive_failure_buffer_is_accepted() {
        // Retries never block the failure handler, so the buffer size is a
        // throughput knob only.
        for capacity in [1, 2, 1000] {
            let result = Pipeline::builder(WorkerCounts::new(4, 1, 1))
                .failure_buffer(capacity)
                .with_source(tokio::io::empty())
                .with_output(tokio::io::sink())
                .with_stages(ScriptedStages::default())
                .build();
            assert!(result.is_ok(), "capacity {capacity} rejected");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_slot_failure_buffer_drains_retry_storm() {
        const JOBS: usize = 40;
        let workers = WorkerCounts::new(4, 1, 1);
        let subjects: Vec<String> = (0..JOBS).map(|i| format!("job-{i:02}")).collect();
        let mut stages = ScriptedStages::default();
        for subject in &subjects {
            stages = stages.fail(Stage::Download, subject, 2, FailureKind::Download);
        }

        for _ in 0..10 {
            let pipeline = Pipeline::builder(workers)
                .failure_buffer(1)
                .with_source(std::io::Cursor::new(subjects.join("\n").into_bytes()))
                .with_output(tokio::io::sink())
                .with_stages(ScriptedStages {
                    download: stages.download.clone(),
                    ..ScriptedStages::default()
                })
                .build()
                .unwrap();
            let report = timeout(Duration::from_secs(3), pipeline.run())
                .await
                .expect("pipeline deadlocked")
                .unwrap();

            assert_eq!(report.saved, JOBS as u64);
            assert_eq!(report.retries, 2 * JOBS as u64);
            assert!(report.evictions.is_empty());
        }
    }

    mod http {
        use super::*;
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn red_png() -> Vec<u8> {
            let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])));
            let mut bytes = std::io::Cursor::new(Vec::new());
            image.write_to(&mut bytes, ImageFormat::Png).unwrap();
            bytes.into_inner()
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn downloads_summarizes_and_records_images() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/red.png"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(red_png()))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/missing.png"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let red = format!("{}/red.png", server.uri());
            let missing = format!("{}/missing.png", server.uri());
            let source = format!("{red}\n{missing}\n");

            let dir = tempfile::tempdir().unwrap();
            let out_path = dir.path().join("out.csv");
            let output = tokio::fs::File::create(&out_path).await.unwrap();

            let pipeline = Pipeline::builder(WorkerCounts::new(2, 1, 1))
                .with_source(std::io::Cursor::new(source.into_bytes()))
                .with_output(output)
                .with_client(reqwest::Client::new())
                .build()
                .unwrap();
            let report = timeout(Duration::from_secs(30), pipeline.run())
                .await
                .unwrap()
                .unwrap();

            let written = std::fs::read_to_string(&out_path).unwrap();
            assert_eq!(written, format!("{red},#ff0000,#000000,#000000\n"));
            assert_eq!(report.saved, 1);
            assert_eq!(report.evictions.len(), 1);
            assert_eq!(report.evictions[0].subject, missing);
            assert_eq!(report.evictions[0].kind, FailureKind::NonRetryable);
        }
    }
}
