// Job state machine
//
// Submitted → InProgress → Succeeded | Failed, with no way back out of a terminal state.

pub mod errors;
pub mod events;
pub mod job_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::JobEvent;
pub use job_state_machine::JobStateMachine;
pub use states::JobStatus;
