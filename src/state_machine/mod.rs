pub(crate) mod job;
mod state;

pub use job::{DispatchMode, FailureKind, FailureReason, Job, NewJob, TranscriptSegment};
pub use state::{JobInput, JobStatus, StateMachine, Transition};
