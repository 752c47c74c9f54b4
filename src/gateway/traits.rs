use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::GatewayResult;
use super::message::PlatformMessage;

/// Outbound command for the external bot. The nonce is the job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayCommand {
    Imagine {
        nonce: String,
        prompt: String,
    },
    Action {
        nonce: String,
        message_id: String,
        custom_id: String,
    },
}

impl GatewayCommand {
    pub fn nonce(&self) -> &str {
        match self {
            Self::Imagine { nonce, .. } | Self::Action { nonce, .. } => nonce,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Imagine { .. } => "imagine",
            Self::Action { .. } => "action",
        }
    }
}

/// The physical gateway connection as seen by the leader coordinator and the relay.
///
/// `connect` is idempotent: it never opens a second concurrent connection.
#[async_trait]
pub trait GatewayConnection: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> GatewayResult<()>;

    /// Close the connection and stop reconnecting
    async fn disconnect(&self);

    /// A connection task is running (connected or reconnecting)
    fn is_connected(&self) -> bool;

    /// Identified and able to send commands
    fn is_ready(&self) -> bool;

    /// Send and wait for the platform's acknowledgment of receipt
    async fn send_command(&self, command: &GatewayCommand) -> GatewayResult<()>;
}

/// Recent channel messages, used to re-query events the correlator could not match
#[async_trait]
pub trait MessageHistory: Send + Sync + std::fmt::Debug {
    async fn recent_messages(&self, limit: u32) -> GatewayResult<Vec<PlatformMessage>>;
}
