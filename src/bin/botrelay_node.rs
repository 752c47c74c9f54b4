//! BotRelay Node Binary
//!
//! Runs one relay process: joins the cluster through Redis, competes for the gateway
//! lease, and logs terminal job transitions until Ctrl-C.

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use botrelay_core::config::ConfigManager;
use botrelay_core::logging::init_structured_logging;
use botrelay_core::orchestration::bootstrap_node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_structured_logging();

    let config_manager = ConfigManager::load().context("failed to load configuration")?;
    info!(
        environment = %config_manager.environment(),
        config_file = ?config_manager.source_file(),
        "Starting botrelay node"
    );

    let node = bootstrap_node(config_manager)
        .await
        .context("failed to bootstrap relay node")?;

    let mut state_changes = node
        .orchestrator
        .subscribe_state_changes()
        .await
        .context("failed to subscribe to job state changes")?;
    let watcher = tokio::spawn(async move {
        loop {
            let change = state_changes.recv().await;
            info!(
                job_id = %change.job_id,
                user_id = %change.user_id,
                status = %change.status,
                result_ref = ?change.result_ref,
                fail_reason = ?change.fail_reason,
                "📣 Job finished"
            );
        }
    });

    let status = node.status();
    info!(
        holder_id = %status.holder_id,
        role = %status.role,
        "Ready; press Ctrl-C to stop"
    );

    signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    node.shutdown().await;
    watcher.abort();
    info!("Relay node stopped");

    Ok(())
}
