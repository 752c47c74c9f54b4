//! # Leader Coordinator
//!
//! Decides which single process in the cluster owns the gateway connection.
//!
//! Every renewal tick:
//! - a follower tries to acquire the lease and, on success, connects the gateway;
//! - a leader renews. A lost lease disconnects the gateway immediately. When renewal
//!   fails because the backend is unreachable, the leader keeps its session only while
//!   `now - last_renewal < lock_ttl - renewal_interval`, then drops it before the lease
//!   can expire under it.
//!
//! Gateway disconnects do not give up leadership; the session reconnects on its own.

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::elector::{LeaderElector, LeadershipResult, RenewalResult};
use crate::gateway::GatewayConnection;
use crate::logging::log_gateway_operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Follower,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

/// The cluster-wide gateway lease as held by this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLease {
    pub holder_id: String,
    pub acquired_at: Instant,
    pub last_renewed: Instant,
    pub ttl: Duration,
}

impl GatewayLease {
    pub fn expires_at(&self) -> Instant {
        self.last_renewed + self.ttl
    }
}

/// Unique per process instance: pid, start time and a random suffix
pub fn generate_holder_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

#[derive(Debug)]
pub struct LeaderCoordinator {
    holder_id: String,
    elector: Arc<dyn LeaderElector>,
    gateway: Arc<dyn GatewayConnection>,
    lock_ttl: Duration,
    renewal_interval: Duration,
    role_tx: watch::Sender<NodeRole>,
    lease: SyncMutex<Option<GatewayLease>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderCoordinator {
    pub fn new(
        holder_id: impl Into<String>,
        elector: Arc<dyn LeaderElector>,
        gateway: Arc<dyn GatewayConnection>,
        lock_ttl: Duration,
        renewal_interval: Duration,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(NodeRole::Follower);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            holder_id: holder_id.into(),
            elector,
            gateway,
            lock_ttl,
            renewal_interval,
            role_tx,
            lease: SyncMutex::new(None),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn role(&self) -> NodeRole {
        *self.role_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == NodeRole::Leader
    }

    pub fn lease(&self) -> Option<GatewayLease> {
        self.lease.lock().clone()
    }

    /// Make the first acquisition attempt, then keep renewing in the background
    #[instrument(skip(self), fields(holder_id = %self.holder_id))]
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        self.tick().await;

        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let period = coordinator.renewal_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    // The watch guard must not live across the tick arm
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = ticker.tick() => coordinator.tick().await,
                }
            }
            debug!("LEADER: Renewal loop stopped");
        }));

        info!(
            role = %self.role(),
            lock_ttl_ms = self.lock_ttl.as_millis() as u64,
            renewal_interval_ms = self.renewal_interval.as_millis() as u64,
            "🚀 LEADER: Coordinator started"
        );
    }

    /// One acquisition or renewal round
    pub async fn tick(&self) {
        match self.role() {
            NodeRole::Follower => self.try_become_leader().await,
            NodeRole::Leader => self.renew_or_demote().await,
        }
    }

    async fn try_become_leader(&self) {
        match self.elector.try_acquire(&self.holder_id).await {
            Ok(LeadershipResult::Acquired { lease_duration }) => {
                let now = Instant::now();
                *self.lease.lock() = Some(GatewayLease {
                    holder_id: self.holder_id.clone(),
                    acquired_at: now,
                    last_renewed: now,
                    ttl: lease_duration,
                });

                if let Err(e) = self.gateway.connect().await {
                    error!(error = %e, "❌ LEADER: Won the lease but could not start the gateway");
                    *self.lease.lock() = None;
                    if let Err(release_err) = self.elector.release(&self.holder_id).await {
                        warn!(error = %release_err, "⚠️ LEADER: Failed to hand the lease back");
                    }
                    return;
                }

                self.role_tx.send_replace(NodeRole::Leader);
                log_gateway_operation("acquire", &self.holder_id, "leader", None);
            }
            Ok(LeadershipResult::NotLeader { current_leader }) => {
                debug!(current_leader = ?current_leader, "LEADER: Remaining follower");
            }
            Err(e) => {
                warn!(error = %e, "⚠️ LEADER: Acquisition attempt failed");
            }
        }
    }

    async fn renew_or_demote(&self) {
        match self.elector.renew(&self.holder_id).await {
            Ok(RenewalResult::Renewed { .. }) => {
                if let Some(lease) = self.lease.lock().as_mut() {
                    lease.last_renewed = Instant::now();
                }
                debug!("🔒 LEADER: Lease renewed");
            }
            Ok(RenewalResult::Lost) => {
                warn!("⚠️ LEADER: Lease taken by another process, dropping gateway");
                self.demote("lease lost").await;
            }
            Err(e) => {
                let since_renewal = self
                    .lease
                    .lock()
                    .as_ref()
                    .map(|lease| lease.last_renewed.elapsed())
                    .unwrap_or(Duration::MAX);
                let grace = self.lock_ttl.saturating_sub(self.renewal_interval);

                if since_renewal >= grace {
                    error!(
                        error = %e,
                        since_renewal_ms = since_renewal.as_millis() as u64,
                        "❌ LEADER: Lease not renewable, dropping gateway before it expires"
                    );
                    self.demote("lease not renewable").await;
                } else {
                    warn!(
                        error = %e,
                        since_renewal_ms = since_renewal.as_millis() as u64,
                        "⚠️ LEADER: Renewal failed, keeping session for now"
                    );
                }
            }
        }
    }

    async fn demote(&self, reason: &str) {
        *self.lease.lock() = None;
        self.role_tx.send_replace(NodeRole::Follower);
        self.gateway.disconnect().await;
        log_gateway_operation("demote", &self.holder_id, "follower", Some(reason));
    }

    /// Stop renewing, disconnect the gateway and release the lease if still ours
    #[instrument(skip(self), fields(holder_id = %self.holder_id))]
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "⚠️ LEADER: Renewal task ended abnormally");
            }
        }

        if self.is_leader() {
            self.gateway.disconnect().await;
            match self.elector.release(&self.holder_id).await {
                Ok(released) => debug!(released = released, "LEADER: Lease released"),
                Err(e) => warn!(error = %e, "⚠️ LEADER: Release failed, lease will expire"),
            }
            *self.lease.lock() = None;
            self.role_tx.send_replace(NodeRole::Follower);
            log_gateway_operation("release", &self.holder_id, "stopped", None);
        }
        info!("🛑 LEADER: Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::backend::CoordinationBackend;
    use crate::coordinator::BackendLeaderElector;
    use crate::gateway::{GatewayCommand, GatewayResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct StubGateway {
        connected: AtomicBool,
    }

    #[async_trait]
    impl GatewayConnection for StubGateway {
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
        async fn send_command(&self, _command: &GatewayCommand) -> GatewayResult<()> {
            Ok(())
        }
    }

    fn node(backend: &InMemoryBackend, holder: &str) -> (Arc<LeaderCoordinator>, Arc<StubGateway>) {
        let gateway = Arc::new(StubGateway::default());
        let elector = Arc::new(BackendLeaderElector::new(
            Arc::new(backend.clone()),
            "test:gateway:lock",
            Duration::from_millis(300),
        ));
        let coordinator = LeaderCoordinator::new(
            holder,
            elector,
            gateway.clone(),
            Duration::from_millis(300),
            Duration::from_millis(100),
        );
        (coordinator, gateway)
    }

    #[test]
    fn test_holder_ids_are_unique() {
        assert_ne!(generate_holder_id(), generate_holder_id());
    }

    #[tokio::test]
    async fn test_first_node_leads_second_follows() {
        let backend = InMemoryBackend::default();
        let (a, gateway_a) = node(&backend, "a");
        let (b, gateway_b) = node(&backend, "b");

        a.tick().await;
        b.tick().await;
        assert!(a.is_leader() && gateway_a.is_connected());
        assert!(!b.is_leader() && !gateway_b.is_connected());
        assert!(a.lease().is_some());
    }

    #[tokio::test]
    async fn test_lost_lease_demotes_immediately() {
        let backend = InMemoryBackend::default();
        let (a, gateway_a) = node(&backend, "a");
        a.tick().await;

        // Another holder took the key after ours lapsed
        backend.delete("test:gateway:lock").await.unwrap();
        backend
            .set_with_ttl("test:gateway:lock", "b", Duration::from_secs(1))
            .await
            .unwrap();

        a.tick().await;
        assert_eq!(a.role(), NodeRole::Follower);
        assert!(!gateway_a.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_backend_drops_session_within_grace() {
        let backend = InMemoryBackend::default();
        let (a, gateway_a) = node(&backend, "a");
        a.tick().await;
        backend.set_available(false);

        tokio::time::advance(Duration::from_millis(100)).await;
        a.tick().await;
        assert!(a.is_leader(), "one failed renewal is tolerated");

        tokio::time::advance(Duration::from_millis(100)).await;
        a.tick().await;
        assert!(!a.is_leader());
        assert!(!gateway_a.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_releases_lease_for_follower() {
        let backend = InMemoryBackend::default();
        let (a, _) = node(&backend, "a");
        let (b, gateway_b) = node(&backend, "b");
        a.start().await;
        b.tick().await;
        assert!(!b.is_leader());

        a.shutdown().await;
        b.tick().await;
        assert!(b.is_leader());
        assert!(gateway_b.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_loop_holds_lease_until_shutdown() {
        let backend = InMemoryBackend::default();
        let (a, gateway_a) = node(&backend, "a");
        let (b, _) = node(&backend, "b");
        a.start().await;

        // Several lease lifetimes pass on the renewal task alone
        tokio::time::sleep(Duration::from_secs(1)).await;
        b.tick().await;
        assert!(a.is_leader() && gateway_a.is_connected());
        assert!(!b.is_leader());

        a.shutdown().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!a.is_leader());
        b.tick().await;
        assert!(b.is_leader());
    }
}
