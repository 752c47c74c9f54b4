//! # Coordination Backend
//!
//! The only shared mutable resource of the cluster: a key-value store with TTLs,
//! compare-and-set scripts and publish/subscribe. Every mutation the relay core makes
//! across processes is a single call on this trait.
//!
//! [`RedisBackend`] is the production implementation; [`InMemoryBackend`] runs a whole
//! simulated cluster inside one process.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use memory::InMemoryBackend;
pub use self::redis::RedisBackend;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend connection error: {message}")]
    Connection { message: String },

    #[error("Backend command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("Backend unavailable")]
    Unavailable,
}

impl BackendError {
    pub fn command(command: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Command {
            command: command.into(),
            message: message.to_string(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A live channel subscription delivering raw payload strings
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: mpsc::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            forwarder: None,
        }
    }

    /// Attach the task pumping messages into this subscription; it is aborted on drop
    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backend side has gone away
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// Key-value and pub/sub primitives the cluster coordinates through
#[async_trait]
pub trait CoordinationBackend: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// Atomic set-if-not-exists with expiry; `true` when this call created the key
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool>;

    /// Extend the key's TTL only if it still holds `expected`
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BackendResult<bool>;

    /// Replace the value and reset the TTL only if the key still holds `expected`.
    /// A missing key never matches.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendResult<bool>;

    /// Delete the key only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> BackendResult<bool>;

    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// All live keys starting with `prefix`. O(n) over the keyspace.
    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<String>>;

    /// Returns the number of subscribers that received the message
    async fn publish(&self, channel: &str, payload: &str) -> BackendResult<usize>;

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription>;

    async fn ping(&self) -> BackendResult<()>;

    fn provider_name(&self) -> &'static str;
}
