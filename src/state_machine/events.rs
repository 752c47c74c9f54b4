use serde::{Deserialize, Serialize};

/// Events that can trigger job state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// The platform linked an external message to the job
    Link,
    /// A progress edit arrived for the linked message
    Progress,
    /// The final artifact is available
    Complete,
    /// The job failed with the given reason
    Fail(String),
}

impl JobEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail(_))
    }

    /// Create a failure event with the given reason
    pub fn fail_with_reason(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}
