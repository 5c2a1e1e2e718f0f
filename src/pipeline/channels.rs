use async_channel::{Receiver, Sender};

use crate::state_machine::{FailureRecord, Job, Stage};

/// Buffer of each stage channel. `async-channel` has no zero-capacity
/// rendezvous, so one slot is the tightest hand-off it offers.
const STAGE_CAPACITY: usize = 1;

/// A multi-producer, multi-consumer job queue for one stage.
#[derive(Clone)]
struct StageQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl StageQueue {
    fn new() -> Self {
        let (tx, rx) = async_channel::bounded(STAGE_CAPACITY);
        Self { tx, rx }
    }
}

/// Channel wiring between the stages, the failure handler, and the
/// boundary tasks. Cloning shares the same underlying channels.
#[derive(Clone)]
pub(crate) struct StageChannels {
    download: StageQueue,
    summarize: StageQueue,
    cleanup: StageQueue,
    save: StageQueue,
    failures_tx: Sender<FailureRecord>,
    failures_rx: Receiver<FailureRecord>,
}

impl StageChannels {
    /// `failure_buffer` must be at least one.
    pub fn new(failure_buffer: usize) -> Self {
        let (failures_tx, failures_rx) = async_channel::bounded(failure_buffer);
        Self {
            download: StageQueue::new(),
            summarize: StageQueue::new(),
            cleanup: StageQueue::new(),
            save: StageQueue::new(),
            failures_tx,
            failures_rx,
        }
    }

    fn queue(&self, stage: Stage) -> &StageQueue {
        match stage {
            Stage::Download => &self.download,
            Stage::Summarize => &self.summarize,
            Stage::Cleanup => &self.cleanup,
            Stage::Save => &self.save,
        }
    }

    pub fn sender(&self, stage: Stage) -> &Sender<Job> {
        &self.queue(stage).tx
    }

    pub fn receiver(&self, stage: Stage) -> &Receiver<Job> {
        &self.queue(stage).rx
    }

    pub fn failures(&self) -> &Sender<FailureRecord> {
        &self.failures_tx
    }

    pub fn failure_receiver(&self) -> &Receiver<FailureRecord> {
        &self.failures_rx
    }

    /// Close every channel. Only valid once every producer has stopped.
    pub fn close(&self) {
        for stage in [Stage::Download, Stage::Summarize, Stage::Cleanup, Stage::Save] {
            self.sender(stage).close();
        }
        self.failures_tx.close();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        [Stage::Download, Stage::Summarize, Stage::Cleanup, Stage::Save]
            .into_iter()
            .all(|stage| self.sender(stage).is_closed())
            && self.failures_tx.is_closed()
    }
}
