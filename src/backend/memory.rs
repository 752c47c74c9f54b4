//! In-process coordination backend.
//!
//! Clones share one keyspace, so handing a clone to every simulated node gives a
//! cluster that coordinates exactly like one sharing a Redis instance. Expiry follows
//! `tokio::time`, which lets paused-clock tests advance TTLs deterministically.

use super::{BackendError, BackendResult, CoordinationBackend, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

impl State {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = self.entries.get(key).is_some_and(|entry| !entry.is_live(now));
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
    subscription_buffer: usize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(crate::constants::system::DEFAULT_CHANNEL_BUFFER_SIZE)
    }
}

impl InMemoryBackend {
    pub fn new(subscription_buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
            subscription_buffer: subscription_buffer.max(1),
        }
    }

    /// Simulate an outage: every call fails with [`BackendError::Unavailable`] until restored.
    /// Shared by all clones.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// A handle on the same keyspace with its own availability switch, so one
    /// simulated node can be cut off while the rest of the cluster carries on
    pub fn isolated_handle(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            available: Arc::new(AtomicBool::new(true)),
            subscription_buffer: self.subscription_buffer,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of live keys, for assertions in tests
    pub fn live_key_count(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Close every open subscription from the backend side, like a dropped
    /// pub/sub connection would. Shared by all clones.
    pub fn close_subscriptions(&self) {
        let dropped: usize = self
            .state
            .lock()
            .subscribers
            .drain()
            .map(|(_, senders)| senders.len())
            .sum();
        debug!(subscriptions = dropped, "🔌 BACKEND: Closed subscriptions (in-memory)");
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::Unavailable)
        }
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        Ok(state.live_value(key, now).map(|entry| entry.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        self.check_available()?;
        let expires_at = Some(Instant::now() + ttl);
        self.state.lock().entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_value(key, now).is_some() {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BackendResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_value(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_value(key, now) {
            Some(entry) if entry.value == expected => {
                entry.value = value.to_string();
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> BackendResult<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let owned = state
            .live_value(key, now)
            .is_some_and(|entry| entry.value == expected);
        if owned {
            state.entries.remove(key);
        }
        Ok(owned)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.check_available()?;
        self.state.lock().entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.entries.retain(|_, entry| entry.is_live(now));
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> BackendResult<usize> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(senders) = state.subscribers.get_mut(channel) else {
            return Ok(0);
        };

        senders.retain(|sender| !sender.is_closed());
        let mut delivered = 0;
        for sender in senders.iter() {
            match sender.try_send(payload.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel = channel, "Subscriber lagging, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        self.state
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!(channel = channel, "📡 BACKEND: Subscribed (in-memory)");
        Ok(Subscription::new(channel, rx))
    }

    async fn ping(&self) -> BackendResult<()> {
        self.check_available()
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
