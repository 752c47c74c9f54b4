//! # System Constants
//!
//! Key layout, pub/sub channel names, gateway opcodes and the default timing
//! boundaries of the relay core.

use serde::{Deserialize, Serialize};

/// Gateway frame opcodes understood by the session
pub mod opcodes {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Dispatch event names the correlator cares about
pub mod dispatch {
    pub const READY: &str = "READY";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
    pub const MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
}

/// Interaction and component type codes used by the command payloads
pub mod interaction {
    pub const APPLICATION_COMMAND: u8 = 2;
    pub const MESSAGE_COMPONENT: u8 = 3;
    pub const CHAT_INPUT: u8 = 1;
    pub const STRING_OPTION: u8 = 3;
    pub const ACTION_ROW: u8 = 1;
    pub const BUTTON: u8 = 2;
}

/// Default operating boundaries
pub mod system {
    pub const DEFAULT_KEY_PREFIX: &str = "botrelay";
    pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
    pub const DEFAULT_RENEWAL_INTERVAL_MS: u64 = 10_000;
    pub const DEFAULT_JOB_TTL_MS: u64 = 3_600_000;
    pub const DEFAULT_USER_LOCK_TTL_MS: u64 = 30_000;
    pub const DEFAULT_RELAY_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 300_000;
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
    pub const DEFAULT_RECONNECT_MIN_MS: u64 = 1_000;
    pub const DEFAULT_RECONNECT_MAX_MS: u64 = 5_000;
    pub const DEFAULT_SEND_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_SEND_BASE_DELAY_MS: u64 = 1_000;
    pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1_024;
    pub const RESUBSCRIBE_BACKOFF_MIN_MS: u64 = 100;
    pub const RESUBSCRIBE_BACKOFF_MAX_MS: u64 = 5_000;
    pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
    /// GUILDS (1) + GUILD_MESSAGES (512) + MESSAGE_CONTENT (32768)
    pub const DEFAULT_INTENTS: u64 = 33_281;
    pub const DEFAULT_BOT_ID: &str = "936929561302675456";
    pub const DEFAULT_IMAGINE_COMMAND_ID: &str = "938956540159881230";
    pub const DEFAULT_IMAGINE_COMMAND_VERSION: &str = "1166847114203123795";
    pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
    pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
}

/// Builds every backend key and channel name from one configurable prefix.
///
/// All processes in a cluster must agree on the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{job_id}", self.prefix)
    }

    /// Prefix passed to SCAN when listing job records
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    pub fn message_index(&self, message_id: &str) -> String {
        format!("{}:msg2job:{message_id}", self.prefix)
    }

    pub fn user_active(&self, user_id: &str) -> String {
        format!("{}:user:active:{user_id}", self.prefix)
    }

    pub fn user_lock(&self, user_id: &str) -> String {
        format!("{}:user:lock:{user_id}", self.prefix)
    }

    pub fn gateway_lock(&self) -> String {
        format!("{}:gateway:lock", self.prefix)
    }

    pub fn job_update_channel(&self) -> String {
        format!("{}:events:job-update", self.prefix)
    }

    pub fn job_state_channel(&self) -> String {
        format!("{}:events:job-state", self.prefix)
    }

    pub fn relay_request_channel(&self) -> String {
        format!("{}:gateway:cmd:request", self.prefix)
    }

    pub fn relay_response_channel(&self) -> String {
        format!("{}:gateway:cmd:response", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(system::DEFAULT_KEY_PREFIX)
    }
}
