use thiserror::Error;

use super::states::JobStatus;

/// Errors produced when a job event cannot be applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    /// The job already reached a terminal state; callers treat this as a no-op
    #[error("Job is already terminal ({state}); {event} ignored")]
    AlreadyTerminal { state: JobStatus, event: String },

    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: JobStatus, event: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
