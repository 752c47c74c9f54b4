//! # Command Relay
//!
//! Makes command dispatch location-transparent. The leader sends straight through its
//! gateway session; a follower publishes a [`RelayRequest`] tagged with a fresh id and
//! waits, bounded by the relay timeout, for the matching [`RelayResponse`].
//!
//! Outstanding requests live in an arena keyed by request id. Each waiter removes its
//! own entry when it completes, times out or is dropped, so nothing leaks per request.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::coordinator::LeaderCoordinator;
use crate::events::{EventBus, EventBusError, TypedSubscription};
use crate::gateway::{GatewayCommand, GatewayConnection, GatewayError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub request_id: Uuid,
    /// Holder id of the requesting process
    pub origin: String,
    pub command: GatewayCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub request_id: Uuid,
    pub result: Result<(), GatewayError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("No relay response within {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// Reported back by the leader
    #[error("Leader failed to send command: {0}")]
    Remote(GatewayError),

    /// Local gateway failure while this process is leader
    #[error("Gateway send failed: {0}")]
    Gateway(GatewayError),

    #[error("Relay transport error: {0}")]
    Backend(#[from] EventBusError),

    #[error("Command relay is shut down")]
    Closed,
}

impl RelayError {
    /// The gateway error behind this failure, wherever it happened
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            Self::Remote(e) | Self::Gateway(e) => Some(e),
            _ => None,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

type PendingArena = DashMap<Uuid, oneshot::Sender<Result<(), GatewayError>>>;

/// Removes the arena entry however the waiting future ends
struct PendingGuard<'a> {
    arena: &'a PendingArena,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.arena.remove(&self.request_id);
    }
}

#[derive(Debug)]
pub struct CommandRelay {
    bus: EventBus,
    coordinator: Arc<LeaderCoordinator>,
    gateway: Arc<dyn GatewayConnection>,
    timeout: Duration,
    pending: Arc<PendingArena>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandRelay {
    pub fn new(
        bus: EventBus,
        coordinator: Arc<LeaderCoordinator>,
        gateway: Arc<dyn GatewayConnection>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            coordinator,
            gateway,
            timeout,
            pending: Arc::new(DashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to both relay channels and start serving them.
    ///
    /// Every process runs the request listener; only the current leader acts on requests.
    pub async fn start(self: &Arc<Self>) -> RelayResult<()> {
        let keys = self.bus.keys().clone();
        let requests: TypedSubscription<RelayRequest> =
            self.bus.subscribe(&keys.relay_request_channel()).await?;
        let responses: TypedSubscription<RelayResponse> =
            self.bus.subscribe(&keys.relay_response_channel()).await?;

        let mut listeners = self.listeners.lock().await;
        listeners.push(tokio::spawn(Arc::clone(self).serve_requests(requests)));
        listeners.push(tokio::spawn(Arc::clone(self).collect_responses(responses)));

        info!(timeout_ms = self.timeout.as_millis() as u64, "📡 RELAY: Listening");
        Ok(())
    }

    /// Send `command` through whichever process owns the gateway
    #[instrument(skip(self, command), fields(command = command.name(), nonce = command.nonce()))]
    pub async fn dispatch(&self, command: &GatewayCommand) -> RelayResult<()> {
        if self.coordinator.is_leader() {
            return self
                .gateway
                .send_command(command)
                .await
                .map_err(RelayError::Gateway);
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        let _guard = PendingGuard {
            arena: &self.pending,
            request_id,
        };

        let request = RelayRequest {
            request_id,
            origin: self.coordinator.holder_id().to_string(),
            command: command.clone(),
        };
        self.bus
            .publish(&self.bus.keys().relay_request_channel(), &request)
            .await?;
        debug!(request_id = %request_id, "RELAY: Forwarded to leader");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result.map_err(RelayError::Remote),
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                warn!(request_id = %request_id, "⏱️ RELAY: No response from leader");
                Err(RelayError::Timeout {
                    waited_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Runs until aborted by [`CommandRelay::shutdown`]
    async fn serve_requests(self: Arc<Self>, mut requests: TypedSubscription<RelayRequest>) {
        loop {
            let request = requests.recv().await;
            if !self.coordinator.is_leader() {
                continue;
            }
            let relay = Arc::clone(&self);
            // Sends may retry for seconds; keep the listener free
            tokio::spawn(async move { relay.execute_request(request).await });
        }
    }

    async fn execute_request(&self, request: RelayRequest) {
        debug!(request_id = %request.request_id, origin = %request.origin, "RELAY: Executing for follower");
        let result = self.gateway.send_command(&request.command).await;
        if let Err(e) = &result {
            warn!(request_id = %request.request_id, error = %e, "⚠️ RELAY: Relayed command failed");
        }

        let response = RelayResponse {
            request_id: request.request_id,
            result,
        };
        if let Err(e) = self
            .bus
            .publish(&self.bus.keys().relay_response_channel(), &response)
            .await
        {
            warn!(request_id = %request.request_id, error = %e, "⚠️ RELAY: Failed to publish response");
        }
    }

    async fn collect_responses(self: Arc<Self>, mut responses: TypedSubscription<RelayResponse>) {
        loop {
            let response = responses.recv().await;
            // Responses to other processes' requests are not in our arena
            if let Some((_, waiter)) = self.pending.remove(&response.request_id) {
                let _ = waiter.send(response.result);
            }
        }
    }

    /// Stop both listeners and fail every outstanding request
    pub async fn shutdown(&self) {
        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }
        self.pending.clear();
        info!("🛑 RELAY: Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CoordinationBackend, InMemoryBackend};
    use crate::constants::KeySpace;
    use crate::coordinator::BackendLeaderElector;
    use crate::gateway::GatewayResult;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct RecordingGateway {
        connected: AtomicBool,
        sent: SyncMutex<Vec<GatewayCommand>>,
        failure: SyncMutex<Option<GatewayError>>,
    }

    #[async_trait]
    impl GatewayConnection for RecordingGateway {
        async fn connect(&self) -> GatewayResult<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn is_ready(&self) -> bool {
            self.is_connected()
        }
        async fn send_command(&self, command: &GatewayCommand) -> GatewayResult<()> {
            if let Some(error) = self.failure.lock().clone() {
                return Err(error);
            }
            self.sent.lock().push(command.clone());
            Ok(())
        }
    }

    struct Node {
        relay: Arc<CommandRelay>,
        coordinator: Arc<LeaderCoordinator>,
        gateway: Arc<RecordingGateway>,
    }

    async fn node(backend: &InMemoryBackend, holder: &str) -> Node {
        let shared: Arc<dyn CoordinationBackend> = Arc::new(backend.clone());
        let keys = KeySpace::new("test");
        let gateway = Arc::new(RecordingGateway::default());
        let elector = Arc::new(BackendLeaderElector::new(
            shared.clone(),
            keys.gateway_lock(),
            Duration::from_millis(300),
        ));
        let coordinator = LeaderCoordinator::new(
            holder,
            elector,
            gateway.clone(),
            Duration::from_millis(300),
            Duration::from_millis(100),
        );
        let relay = CommandRelay::new(
            EventBus::new(shared, keys),
            coordinator.clone(),
            gateway.clone(),
            Duration::from_secs(1),
        );
        relay.start().await.unwrap();
        coordinator.tick().await;
        Node {
            relay,
            coordinator,
            gateway,
        }
    }

    fn imagine(nonce: &str) -> GatewayCommand {
        GatewayCommand::Imagine {
            nonce: nonce.into(),
            prompt: "a red fox".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_command_is_sent_by_leader() {
        let backend = InMemoryBackend::default();
        let leader = node(&backend, "leader").await;
        let follower = node(&backend, "follower").await;
        assert!(leader.coordinator.is_leader());
        assert!(!follower.coordinator.is_leader());

        follower.relay.dispatch(&imagine("J1")).await.unwrap();
        leader.relay.dispatch(&imagine("J2")).await.unwrap();

        assert_eq!(*leader.gateway.sent.lock(), vec![imagine("J1"), imagine("J2")]);
        assert!(follower.gateway.sent.lock().is_empty());
        assert_eq!(follower.relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_failure_is_reported_to_follower() {
        let backend = InMemoryBackend::default();
        let leader = node(&backend, "leader").await;
        let follower = node(&backend, "follower").await;
        let failure = GatewayError::Network {
            message: "connection reset".into(),
        };
        *leader.gateway.failure.lock() = Some(failure.clone());

        let err = follower.relay.dispatch(&imagine("J1")).await.unwrap_err();
        assert_eq!(err, RelayError::Remote(failure.clone()));
        assert_eq!(err.gateway_error(), Some(&failure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_leader_leaves_no_pending_entry() {
        let backend = InMemoryBackend::default();
        let shared: Arc<dyn CoordinationBackend> = Arc::new(backend.clone());
        shared
            .set_with_ttl("test:gateway:lock", "ghost", Duration::from_secs(60))
            .await
            .unwrap();
        let follower = node(&backend, "follower").await;
        assert!(!follower.coordinator.is_leader());

        let started = tokio::time::Instant::now();
        let err = follower.relay.dispatch(&imagine("J1")).await.unwrap_err();
        assert_eq!(err, RelayError::Timeout { waited_ms: 1_000 });
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(follower.relay.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_serving_requests() {
        let backend = InMemoryBackend::default();
        let leader = node(&backend, "leader").await;
        let follower = node(&backend, "follower").await;
        leader.relay.shutdown().await;

        let err = follower.relay.dispatch(&imagine("J1")).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout { .. }));
        assert!(leader.gateway.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listeners_resubscribe_after_backend_drop() {
        let backend = InMemoryBackend::default();
        let leader = node(&backend, "leader").await;
        let follower = node(&backend, "follower").await;

        backend.close_subscriptions();
        // First resubscribe attempt fires after the minimum backoff, inside the lease
        tokio::time::sleep(Duration::from_millis(150)).await;

        follower.relay.dispatch(&imagine("J1")).await.unwrap();
        assert_eq!(*leader.gateway.sent.lock(), vec![imagine("J1")]);
        assert_eq!(follower.relay.pending_count(), 0);
    }
}
