//! # BotRelay Configuration System
//!
//! Layered configuration for every process in the cluster. Values come from built-in
//! defaults, an optional TOML file, and `BOTRELAY__SECTION__FIELD` environment variables,
//! in increasing order of precedence.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use botrelay_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let lock_ttl = manager.config().coordination.lock_ttl();
//! let redis_url = &manager.config().coordination.redis_url;
//! # Ok(())
//! # }
//! ```
//!
//! All timing values are expressed in milliseconds so that tests can run a whole
//! simulated cluster on sub-second leases.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{system, KeySpace};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BotRelayConfig {
    /// External gateway credentials, targets and reconnect bounds
    pub gateway: GatewayConfig,

    /// Coordination backend and leader lease settings
    pub coordination: CoordinationConfig,

    /// Shared task store TTLs
    pub store: StoreConfig,

    /// Follower-to-leader command relay
    pub relay: RelayConfig,

    /// `wait_for_task` polling loop
    pub wait: WaitConfig,

    /// External send retry policy
    pub send: SendConfig,

    /// Event correlation behaviour
    pub correlation: CorrelationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Account token used for identify and interaction calls
    pub user_token: String,
    pub guild_id: String,
    pub channel_id: String,
    /// Author id of the bot whose messages are correlated
    pub bot_id: String,
    pub gateway_url: String,
    pub api_base: String,
    pub imagine_command_id: String,
    pub imagine_command_version: String,
    /// Capability bitmask sent in the identify frame
    pub intents: u64,
    pub reconnect_backoff_min_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub event_buffer_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            user_token: String::new(),
            guild_id: String::new(),
            channel_id: String::new(),
            bot_id: system::DEFAULT_BOT_ID.to_string(),
            gateway_url: system::DEFAULT_GATEWAY_URL.to_string(),
            api_base: system::DEFAULT_API_BASE.to_string(),
            imagine_command_id: system::DEFAULT_IMAGINE_COMMAND_ID.to_string(),
            imagine_command_version: system::DEFAULT_IMAGINE_COMMAND_VERSION.to_string(),
            intents: system::DEFAULT_INTENTS,
            reconnect_backoff_min_ms: system::DEFAULT_RECONNECT_MIN_MS,
            reconnect_backoff_max_ms: system::DEFAULT_RECONNECT_MAX_MS,
            event_buffer_size: system::DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }
}

impl GatewayConfig {
    pub fn reconnect_backoff_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_min_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    /// Credentials are only needed by a process that actually opens a session
    pub fn validate_credentials(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("gateway.user_token", &self.user_token),
            ("gateway.guild_id", &self.guild_id),
            ("gateway.channel_id", &self.channel_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigurationError::missing(field, "gateway session"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub redis_url: String,
    /// Namespace shared by every key and channel of one cluster
    pub key_prefix: String,
    pub lock_ttl_ms: u64,
    /// Must be strictly shorter than `lock_ttl_ms` (≈⅓ by default)
    pub renewal_interval_ms: u64,
    pub channel_buffer_size: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: system::DEFAULT_KEY_PREFIX.to_string(),
            lock_ttl_ms: system::DEFAULT_LOCK_TTL_MS,
            renewal_interval_ms: system::DEFAULT_RENEWAL_INTERVAL_MS,
            channel_buffer_size: system::DEFAULT_CHANNEL_BUFFER_SIZE,
        }
    }
}

impl CoordinationConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_millis(self.renewal_interval_ms)
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub job_ttl_ms: u64,
    pub user_lock_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            job_ttl_ms: system::DEFAULT_JOB_TTL_MS,
            user_lock_ttl_ms: system::DEFAULT_USER_LOCK_TTL_MS,
        }
    }
}

impl StoreConfig {
    pub fn job_ttl(&self) -> Duration {
        Duration::from_millis(self.job_ttl_ms)
    }

    pub fn user_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.user_lock_ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: system::DEFAULT_RELAY_TIMEOUT_MS,
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: system::DEFAULT_WAIT_TIMEOUT_MS,
            poll_interval_ms: system::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SendConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_attempts: system::DEFAULT_SEND_MAX_ATTEMPTS,
            base_delay_ms: system::DEFAULT_SEND_BASE_DELAY_MS,
        }
    }
}

/// What the correlator does with an event it cannot match to exactly one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedEventPolicy {
    /// Log and drop the event; the job eventually times out
    #[default]
    Drop,
    /// Re-read recent channel history and apply identifier-matched messages
    Requery,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub unmatched_policy: UnmatchedEventPolicy,
    pub history_limit: u32,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            unmatched_policy: UnmatchedEventPolicy::Drop,
            history_limit: system::DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl BotRelayConfig {
    /// Validate cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        let coordination = &self.coordination;
        if coordination.lock_ttl_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "coordination.lock_ttl_ms",
                coordination.lock_ttl_ms,
                "must be greater than zero",
            ));
        }
        if coordination.renewal_interval_ms == 0
            || coordination.renewal_interval_ms >= coordination.lock_ttl_ms
        {
            return Err(ConfigurationError::invalid_value(
                "coordination.renewal_interval_ms",
                coordination.renewal_interval_ms,
                format!(
                    "must be non-zero and strictly shorter than lock_ttl_ms ({})",
                    coordination.lock_ttl_ms
                ),
            ));
        }
        if coordination.key_prefix.trim().is_empty() {
            return Err(ConfigurationError::missing(
                "coordination.key_prefix",
                "coordination",
            ));
        }
        if self.store.job_ttl_ms == 0 || self.store.user_lock_ttl_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "store",
                format!("{}/{}", self.store.job_ttl_ms, self.store.user_lock_ttl_ms),
                "job and user lock TTLs must be greater than zero",
            ));
        }
        if self.relay.timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "relay.timeout_ms",
                self.relay.timeout_ms,
                "must be greater than zero",
            ));
        }
        if self.wait.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "wait.poll_interval_ms",
                self.wait.poll_interval_ms,
                "must be greater than zero",
            ));
        }
        if self.gateway.reconnect_backoff_min_ms > self.gateway.reconnect_backoff_max_ms {
            return Err(ConfigurationError::invalid_value(
                "gateway.reconnect_backoff_min_ms",
                self.gateway.reconnect_backoff_min_ms,
                format!(
                    "must not exceed reconnect_backoff_max_ms ({})",
                    self.gateway.reconnect_backoff_max_ms
                ),
            ));
        }
        if self.gateway.event_buffer_size == 0 || coordination.channel_buffer_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "buffer sizes",
                format!(
                    "{}/{}",
                    self.gateway.event_buffer_size, coordination.channel_buffer_size
                ),
                "event and channel buffers must hold at least one message",
            ));
        }
        if self.send.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "send.max_attempts",
                self.send.max_attempts,
                "at least one attempt is required",
            ));
        }
        Ok(())
    }

    /// Copy with credentials masked, for debug logging
    pub fn sanitized(&self) -> Self {
        let mut copy = self.clone();
        if !copy.gateway.user_token.is_empty() {
            copy.gateway.user_token = "***".to_string();
        }
        copy.coordination.redis_url = crate::logging::redact_url(&copy.coordination.redis_url);
        copy
    }
}
