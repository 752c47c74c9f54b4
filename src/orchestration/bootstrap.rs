//! # Node Bootstrap
//!
//! Builds a production node from configuration: Redis coordination backend, the real
//! gateway session and its interaction client as history source, and the orchestrator
//! on top. Tests wire [`Orchestrator::builder`] by hand with in-memory parts instead.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use super::orchestrator::Orchestrator;
use crate::backend::{BackendError, CoordinationBackend, RedisBackend};
use crate::config::ConfigManager;
use crate::coordinator::NodeRole;
use crate::error::OrchestratorError;
use crate::gateway::{GatewayConnection, GatewayError, GatewaySession, MessageHistory};
use crate::logging::redact_url;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Coordination backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error("Gateway session could not be created: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Orchestrator failed to start: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Running node: the orchestrator plus the session it owns when leader
#[derive(Debug)]
pub struct NodeHandle {
    pub orchestrator: Arc<Orchestrator>,
    pub session: Arc<GatewaySession>,
    config_manager: Arc<ConfigManager>,
}

/// Point-in-time view of a node for health endpoints and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub holder_id: String,
    pub role: NodeRole,
    pub gateway_connected: bool,
    pub gateway_ready: bool,
    pub environment: String,
}

impl NodeHandle {
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            holder_id: self.orchestrator.holder_id().to_string(),
            role: self.orchestrator.role(),
            gateway_connected: self.session.is_connected(),
            gateway_ready: self.session.is_ready(),
            environment: self.config_manager.environment().to_string(),
        }
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

/// Connect to Redis, create the gateway session and start the orchestrator
pub async fn bootstrap_node(config_manager: Arc<ConfigManager>) -> Result<NodeHandle, BootstrapError> {
    let config = config_manager.config();
    info!(
        environment = %config_manager.environment(),
        redis_url = %redact_url(&config.coordination.redis_url),
        "🚀 BOOTSTRAP: Starting relay node"
    );

    let backend: Arc<dyn CoordinationBackend> = Arc::new(
        RedisBackend::connect(
            &config.coordination.redis_url,
            config.coordination.channel_buffer_size,
        )
        .await?,
    );

    let (events_tx, events_rx) = mpsc::channel(config.gateway.event_buffer_size);
    let session = Arc::new(GatewaySession::new(&config.gateway, &config.send, events_tx)?);
    let history: Arc<dyn MessageHistory> = Arc::new(session.interactions().clone());
    let gateway: Arc<dyn GatewayConnection> = session.clone();

    let orchestrator = Orchestrator::builder(config.clone(), backend, gateway, events_rx)
        .history(history)
        .start()
        .await?;

    info!(
        holder_id = %orchestrator.holder_id(),
        role = %orchestrator.role(),
        "✅ BOOTSTRAP: Relay node running"
    );

    Ok(NodeHandle {
        orchestrator,
        session,
        config_manager,
    })
}
