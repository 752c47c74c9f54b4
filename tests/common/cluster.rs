//! In-memory relay cluster.
//!
//! Every node gets its own orchestrator and fake gateway over one shared
//! [`InMemoryBackend`] keyspace. Nodes use isolated backend handles so a single node
//! can be partitioned from coordination while the others keep running.

use std::sync::Arc;
use std::time::Duration;

use botrelay_core::backend::{CoordinationBackend, InMemoryBackend};
use botrelay_core::config::BotRelayConfig;
use botrelay_core::orchestration::Orchestrator;

use super::fake_gateway::{ConnectionTracker, FakeGateway};
use super::messages::{BOT_ID, CHANNEL_ID};

pub const LOCK_TTL_MS: u64 = 300;
pub const RENEWAL_INTERVAL_MS: u64 = 100;

/// Short timings so failover happens within a few hundred milliseconds
pub fn test_config() -> BotRelayConfig {
    let mut config = BotRelayConfig::default();
    config.coordination.key_prefix = "test".into();
    config.coordination.lock_ttl_ms = LOCK_TTL_MS;
    config.coordination.renewal_interval_ms = RENEWAL_INTERVAL_MS;
    config.relay.timeout_ms = 1_000;
    config.wait.poll_interval_ms = 20;
    config.wait.timeout_ms = 2_000;
    config.gateway.channel_id = CHANNEL_ID.into();
    config.gateway.bot_id = BOT_ID.into();
    config
}

pub struct TestNode {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<FakeGateway>,
    pub backend: InMemoryBackend,
}

impl TestNode {
    pub fn is_leader(&self) -> bool {
        self.orchestrator.is_leader()
    }

    /// Cut this node off from coordination (or restore it)
    pub fn set_partitioned(&self, partitioned: bool) {
        self.backend.set_available(!partitioned);
    }
}

pub struct TestCluster {
    pub backend: InMemoryBackend,
    pub tracker: Arc<ConnectionTracker>,
    pub nodes: Vec<TestNode>,
    config: BotRelayConfig,
}

impl TestCluster {
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, test_config()).await
    }

    /// Nodes start in order, so node 0 wins the lease when it is free
    pub async fn start_with(size: usize, config: BotRelayConfig) -> Self {
        let mut cluster = Self {
            backend: InMemoryBackend::default(),
            tracker: Arc::new(ConnectionTracker::default()),
            nodes: Vec::with_capacity(size),
            config,
        };
        for _ in 0..size {
            cluster.add_node().await;
        }
        cluster
    }

    pub async fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let name = format!("node-{index}");
        let backend = self.backend.isolated_handle();
        let (gateway, events) = FakeGateway::new(name.clone(), self.tracker.clone());

        let shared: Arc<dyn CoordinationBackend> = Arc::new(backend.clone());
        let orchestrator = Orchestrator::builder(self.config.clone(), shared, gateway.clone(), events)
            .holder_id(name)
            .start()
            .await
            .expect("node should start");

        self.nodes.push(TestNode {
            orchestrator,
            gateway,
            backend,
        });
        index
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn leaders(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leader())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn leader(&self) -> &TestNode {
        let leaders = self.leaders();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {leaders:?}");
        &self.nodes[leaders[0]]
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.orchestrator.shutdown().await;
        }
    }
}

/// Poll `condition` every 10ms until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
