//! # Event Bus
//!
//! Typed JSON publish/subscribe over the coordination backend. Used for task-update
//! and state-change broadcasts and as the transport for relayed gateway commands.
//!
//! A [`TypedSubscription`] outlives the backend subscription under it: when the
//! backend side closes (a dropped Redis pub/sub connection, say) it resubscribes
//! with exponential backoff. Messages published while it was away are lost.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{JobStateChanged, TaskUpdateEvent};
use crate::backend::{BackendError, CoordinationBackend, Subscription};
use crate::constants::{system, KeySpace};
use crate::resilience::ExponentialBackoff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBusError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Failed to encode event for {channel}: {message}")]
    Serialization { channel: String, message: String },
}

pub type EventBusResult<T> = Result<T, EventBusError>;

#[derive(Debug, Clone)]
pub struct EventBus {
    backend: Arc<dyn CoordinationBackend>,
    keys: KeySpace,
}

impl EventBus {
    pub fn new(backend: Arc<dyn CoordinationBackend>, keys: KeySpace) -> Self {
        Self { backend, keys }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Publish `event` as JSON; returns the number of receiving subscribers
    pub async fn publish<T: Serialize>(&self, channel: &str, event: &T) -> EventBusResult<usize> {
        let payload =
            serde_json::to_string(event).map_err(|e| EventBusError::Serialization {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;
        let receivers = self.backend.publish(channel, &payload).await?;
        debug!(channel = channel, receivers = receivers, "📣 EVENT_BUS: Published");
        Ok(receivers)
    }

    pub async fn subscribe<T: DeserializeOwned>(
        &self,
        channel: &str,
    ) -> EventBusResult<TypedSubscription<T>> {
        let inner = self.backend.subscribe(channel).await?;
        Ok(TypedSubscription {
            backend: Arc::clone(&self.backend),
            inner,
            _marker: PhantomData,
        })
    }

    pub async fn publish_task_update(&self, event: &TaskUpdateEvent) -> EventBusResult<usize> {
        self.publish(&self.keys.job_update_channel(), event).await
    }

    pub async fn subscribe_task_updates(
        &self,
    ) -> EventBusResult<TypedSubscription<TaskUpdateEvent>> {
        self.subscribe(&self.keys.job_update_channel()).await
    }

    pub async fn publish_state_changed(&self, event: &JobStateChanged) -> EventBusResult<usize> {
        self.publish(&self.keys.job_state_channel(), event).await
    }

    pub async fn subscribe_state_changes(
        &self,
    ) -> EventBusResult<TypedSubscription<JobStateChanged>> {
        self.subscribe(&self.keys.job_state_channel()).await
    }
}

/// Subscription decoding each payload as `T`; malformed payloads are logged and skipped
pub struct TypedSubscription<T> {
    backend: Arc<dyn CoordinationBackend>,
    inner: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedSubscription<T> {
    pub fn channel(&self) -> &str {
        self.inner.channel()
    }

    /// Next decodable event. Never ends: a closed backend subscription is replaced.
    pub async fn recv(&mut self) -> T {
        loop {
            let Some(payload) = self.inner.recv().await else {
                self.resubscribe().await;
                continue;
            };
            match serde_json::from_str(&payload) {
                Ok(event) => return event,
                Err(e) => {
                    warn!(
                        channel = self.inner.channel(),
                        error = %e,
                        "⚠️ EVENT_BUS: Dropping malformed payload"
                    );
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        let channel = self.inner.channel().to_string();
        warn!(channel = %channel, "⚠️ EVENT_BUS: Subscription lost, resubscribing");

        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(system::RESUBSCRIBE_BACKOFF_MIN_MS),
            Duration::from_millis(system::RESUBSCRIBE_BACKOFF_MAX_MS),
        );
        loop {
            tokio::time::sleep(backoff.next_delay()).await;
            match self.backend.subscribe(&channel).await {
                Ok(inner) => {
                    self.inner = inner;
                    info!(channel = %channel, attempts = backoff.attempt(), "✅ EVENT_BUS: Resubscribed");
                    return;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "⚠️ EVENT_BUS: Resubscribe failed");
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for TypedSubscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedSubscription")
            .field("channel", &self.inner.channel())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::events::types::TaskUpdateKind;

    fn bus(backend: &InMemoryBackend) -> EventBus {
        EventBus::new(Arc::new(backend.clone()), KeySpace::new("test"))
    }

    #[tokio::test]
    async fn test_cross_node_delivery() {
        let backend = InMemoryBackend::default();
        let node_a = bus(&backend);
        let node_b = bus(&backend);

        let mut updates = node_b.subscribe_task_updates().await.unwrap();
        let event = TaskUpdateEvent::new(TaskUpdateKind::Delete, "J1", None);
        assert_eq!(node_a.publish_task_update(&event).await.unwrap(), 1);
        assert_eq!(updates.recv().await, event);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let backend = InMemoryBackend::default();
        let node = bus(&backend);
        let channel = node.keys().job_update_channel();
        let mut updates = node.subscribe_task_updates().await.unwrap();

        backend.publish(&channel, "not json").await.unwrap();
        let event = TaskUpdateEvent::new(TaskUpdateKind::Delete, "J2", None);
        node.publish_task_update(&event).await.unwrap();

        assert_eq!(updates.recv().await.job_id, "J2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_survives_backend_drop() {
        let backend = InMemoryBackend::default();
        let node = bus(&backend);
        let mut updates = node.subscribe_task_updates().await.unwrap();

        backend.close_subscriptions();
        backend.set_available(false);
        let publisher = node.clone();
        let outage = backend.clone();
        tokio::spawn(async move {
            // Republish until the replacement subscription is listening
            tokio::time::sleep(Duration::from_millis(300)).await;
            outage.set_available(true);
            let event = TaskUpdateEvent::new(TaskUpdateKind::Delete, "J3", None);
            while publisher.publish_task_update(&event).await.unwrap_or(0) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        assert_eq!(updates.recv().await.job_id, "J3");
    }
}
