use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializable so a leader can hand the failure back to a relaying follower
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayError {
    /// Commands need the session id captured from READY
    #[error("Gateway session is not ready")]
    NotReady,

    #[error("Gateway network error: {message}")]
    Network { message: String },

    #[error("Platform rejected request with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Gateway protocol error: {message}")]
    Protocol { message: String },

    #[error("Gateway connection closed: {reason}")]
    Closed { reason: String },

    #[error("Gateway configuration error: {message}")]
    Configuration { message: String },
}

impl GatewayError {
    /// Worth retrying the same send: connection failures, timeouts, throttling and 5xx
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                body: error.to_string(),
            },
            None => Self::Network {
                message: error.to_string(),
            },
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Network { message: "reset".into() }.is_transient());
        assert!(GatewayError::Http { status: 502, body: String::new() }.is_transient());
        assert!(GatewayError::Http { status: 429, body: String::new() }.is_transient());
        assert!(!GatewayError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!GatewayError::NotReady.is_transient());
    }
}
