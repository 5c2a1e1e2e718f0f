mod job;
mod state;

pub use job::{FailureRecord, Job, Stage};
pub use state::{JobState, MAX_FAILURES, StateMachine, Transition};
