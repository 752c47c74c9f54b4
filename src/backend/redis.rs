//! Redis coordination backend
//!
//! Commands go through `redis::aio::ConnectionManager` (multiplexed, reconnects on its
//! own). Each subscription gets a dedicated pub/sub connection whose messages are
//! forwarded into a bounded channel.

use super::{BackendError, BackendResult, CoordinationBackend, Subscription};
use crate::logging::redact_url;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Extend the TTL only while the caller still owns the key
const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Delete only while the caller still owns the key
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Overwrite only while the record is unchanged since the caller read it
const COMPARE_AND_SET_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    redis.call("SET", KEYS[1], ARGV[2], "PX", ARGV[3])
    return 1
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    connection_manager: redis::aio::ConnectionManager,
    compare_and_expire: redis::Script,
    compare_and_set: redis::Script,
    compare_and_delete: redis::Script,
    subscription_buffer: usize,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("connection_manager", &"ConnectionManager")
            .field("subscription_buffer", &self.subscription_buffer)
            .finish()
    }
}

impl RedisBackend {
    pub async fn connect(url: &str, subscription_buffer: usize) -> BackendResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BackendError::Connection {
            message: format!("Failed to create Redis client: {e}"),
        })?;

        let connection_manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BackendError::Connection {
                message: format!("Failed to connect to Redis: {e}"),
            })?;

        debug!(url = %redact_url(url), "🔌 BACKEND: Redis connected");

        Ok(Self {
            client,
            connection_manager,
            compare_and_expire: redis::Script::new(COMPARE_AND_EXPIRE_SCRIPT),
            compare_and_set: redis::Script::new(COMPARE_AND_SET_SCRIPT),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE_SCRIPT),
            subscription_buffer: subscription_buffer.max(1),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CoordinationBackend for RedisBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("GET", e))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BackendError::command("SET", e))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BackendResult<bool> {
        let mut conn = self.connection_manager.clone();
        // Nil reply when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("SET NX", e))?;
        Ok(reply.is_some())
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BackendResult<bool> {
        let mut conn = self.connection_manager.clone();
        let extended: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("EVALSHA compare_and_expire", e))?;
        Ok(extended == 1)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> BackendResult<bool> {
        let mut conn = self.connection_manager.clone();
        let written: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("EVALSHA compare_and_set", e))?;
        Ok(written == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> BackendResult<bool> {
        let mut conn = self.connection_manager.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("EVALSHA compare_and_delete", e))?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| BackendError::command("DEL", e))
    }

    async fn scan_prefix(&self, prefix: &str) -> BackendResult<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        // SCAN rather than KEYS so a large keyspace never blocks the server
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| BackendError::command("SCAN", e))?;

            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> BackendResult<usize> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("PUBLISH", e))
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BackendError::Connection {
                message: format!("Failed to open pub/sub connection: {e}"),
            })?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BackendError::command("SUBSCRIBE", e))?;

        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        let channel_name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Dropping non-UTF8 pub/sub payload");
                    }
                }
            }
            debug!(channel = %channel_name, "Pub/sub forwarder stopped");
        });

        debug!(channel = channel, "📡 BACKEND: Subscribed");
        Ok(Subscription::new(channel, rx).with_forwarder(forwarder))
    }

    async fn ping(&self) -> BackendResult<()> {
        let mut conn = self.connection_manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BackendError::command("PING", e))?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(BackendError::command("PING", format!("unexpected reply {pong}")))
        }
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
    }

    // Integration tests require a running Redis instance (behind test-services feature)
    #[cfg(feature = "test-services")]
    mod integration {
        use super::*;

        async fn test_backend() -> Option<RedisBackend> {
            let url =
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
            match RedisBackend::connect(&url, 16).await {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    None
                }
            }
        }

        #[tokio::test]
        async fn test_lock_primitives() {
            let Some(backend) = test_backend().await else {
                return;
            };
            let key = format!("test:lock:{}", uuid::Uuid::new_v4());
            let ttl = Duration::from_secs(5);

            assert!(backend.set_if_absent(&key, "a", ttl).await.unwrap());
            assert!(!backend.set_if_absent(&key, "b", ttl).await.unwrap());
            assert!(backend.compare_and_expire(&key, "a", ttl).await.unwrap());
            assert!(!backend.compare_and_expire(&key, "b", ttl).await.unwrap());
            assert!(!backend.compare_and_delete(&key, "b").await.unwrap());
            assert!(backend.compare_and_delete(&key, "a").await.unwrap());
            assert_eq!(backend.get(&key).await.unwrap(), None);
        }

        #[tokio::test]
        async fn test_compare_and_set() {
            let Some(backend) = test_backend().await else {
                return;
            };
            let key = format!("test:job:{}", uuid::Uuid::new_v4());
            let ttl = Duration::from_secs(5);

            assert!(!backend.compare_and_set(&key, "v1", "v2", ttl).await.unwrap());
            backend.set_with_ttl(&key, "v1", ttl).await.unwrap();
            assert!(!backend.compare_and_set(&key, "stale", "v2", ttl).await.unwrap());
            assert!(backend.compare_and_set(&key, "v1", "v2", ttl).await.unwrap());
            assert_eq!(backend.get(&key).await.unwrap().as_deref(), Some("v2"));
        }

        #[tokio::test]
        async fn test_publish_subscribe() {
            let Some(backend) = test_backend().await else {
                return;
            };
            let channel = format!("test:channel:{}", uuid::Uuid::new_v4());
            let mut subscription = backend.subscribe(&channel).await.unwrap();

            let receivers = backend.publish(&channel, "hello").await.unwrap();
            assert_eq!(receivers, 1);
            let payload = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
                .await
                .unwrap();
            assert_eq!(payload.as_deref(), Some("hello"));
        }

        #[tokio::test]
        async fn test_scan_prefix() {
            let Some(backend) = test_backend().await else {
                return;
            };
            let prefix = format!("test:scan:{}:", uuid::Uuid::new_v4());
            for i in 0..3 {
                backend
                    .set_with_ttl(&format!("{prefix}{i}"), "v", Duration::from_secs(5))
                    .await
                    .unwrap();
            }
            assert_eq!(backend.scan_prefix(&prefix).await.unwrap().len(), 3);
        }
    }
}
