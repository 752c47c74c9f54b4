//! # Public Error Taxonomy
//!
//! Every error that crosses into [`crate::orchestration::Orchestrator`] is translated into one
//! of these variants. Component-level errors (`BackendError`, `StoreError`, `GatewayError`,
//! `RelayError`) never reach callers directly.

use thiserror::Error;

/// Errors returned by the orchestrator facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The user already owns a non-terminal job (one job at a time per identity)
    #[error("User {user_id} already has an active job")]
    AlreadyActive { user_id: String },

    /// No leader could be reached, or the leader's gateway session is not ready
    #[error("Gateway unavailable: {reason}")]
    GatewayUnavailable { reason: String },

    /// A bounded wait elapsed without the job reaching a terminal state
    #[error("Timed out after {waited_ms}ms waiting for job {job_id}")]
    Timeout { job_id: String, waited_ms: u64 },

    /// The action token is not among the referenced message's available actions
    #[error("Unknown action {action_token} for message {message_id}")]
    UnknownAction {
        message_id: String,
        action_token: String,
    },

    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    /// The job reached `Failed`; carries the stored reason
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// The external send failed after all retries
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl OrchestratorError {
    /// Whether a caller may retry the same request with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnavailable { .. } | Self::Timeout { .. } | Self::Network { .. }
        )
    }

    pub fn gateway_unavailable(reason: impl Into<String>) -> Self {
        Self::GatewayUnavailable {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestratorError::gateway_unavailable("no leader").is_retryable());
        assert!(OrchestratorError::Network {
            message: "reset".into()
        }
        .is_retryable());
        assert!(!OrchestratorError::AlreadyActive {
            user_id: "u1".into()
        }
        .is_retryable());
        assert!(!OrchestratorError::UnknownAction {
            message_id: "m".into(),
            action_token: "a".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display_carries_failure_reason() {
        let err = OrchestratorError::JobFailed {
            job_id: "J1".into(),
            reason: "banned prompt".into(),
        };
        assert_eq!(err.to_string(), "Job J1 failed: banned prompt");
    }
}
