//! # Orchestrator
//!
//! The facade an API layer calls. Jobs are created in the calling process under the
//! per-user lock, then the command goes out through the [`CommandRelay`], either over
//! the local gateway session (leader) or through the leader (follower). Results arrive
//! asynchronously through the correlator on whichever process holds the gateway and
//! are read back from the shared store by any process.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::CoordinationBackend;
use crate::config::{BotRelayConfig, WaitConfig};
use crate::coordinator::{generate_holder_id, BackendLeaderElector, LeaderCoordinator, NodeRole};
use crate::correlation::EventCorrelator;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, JobStateChanged, TypedSubscription};
use crate::gateway::{GatewayCommand, GatewayConnection, GatewayError, MessageHistory, SessionEvent};
use crate::logging::{log_error, log_job_operation};
use crate::models::{Job, JobPatch};
use crate::relay::{CommandRelay, RelayError};
use crate::resilience::{retry_with_backoff, RetryPolicy};
use crate::state_machine::JobStatus;
use crate::store::{SharedTaskStore, StoreError, UpdateOutcome};

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RELAY_TIMEOUT_REASON: &str = "gateway relay timed out";
const CANCELLED_REASON: &str = "cancelled";

/// Ask for a new image from a text prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub user_id: String,
    /// Opaque caller context, passed through untouched
    pub workflow_ref: Option<String>,
    pub prompt: String,
    /// Caller-assigned id; generated when absent
    pub job_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            workflow_ref: None,
            prompt: prompt.into(),
            job_id: None,
        }
    }

    pub fn with_workflow_ref(mut self, workflow_ref: impl Into<String>) -> Self {
        self.workflow_ref = Some(workflow_ref.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("user_id", &self.user_id)?;
        require_non_empty("prompt", &self.prompt)?;
        if let Some(job_id) = &self.job_id {
            require_non_empty("job_id", job_id)?;
        }
        Ok(())
    }
}

/// Press one of the buttons on a previous result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActRequest {
    pub user_id: String,
    pub workflow_ref: Option<String>,
    /// Platform message carrying the button
    pub message_id: String,
    /// The button's custom id
    pub action_token: String,
    pub job_id: Option<String>,
}

impl ActRequest {
    pub fn new(
        user_id: impl Into<String>,
        message_id: impl Into<String>,
        action_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            workflow_ref: None,
            message_id: message_id.into(),
            action_token: action_token.into(),
            job_id: None,
        }
    }

    pub fn with_workflow_ref(mut self, workflow_ref: impl Into<String>) -> Self {
        self.workflow_ref = Some(workflow_ref.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("user_id", &self.user_id)?;
        require_non_empty("message_id", &self.message_id)?;
        require_non_empty("action_token", &self.action_token)?;
        if let Some(job_id) = &self.job_id {
            require_non_empty("job_id", job_id)?;
        }
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest {
            message: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

/// Millisecond timestamp plus a random suffix, unique enough to double as a nonce
pub fn generate_job_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Wires the orchestrator's components together
pub struct OrchestratorBuilder {
    config: BotRelayConfig,
    backend: Arc<dyn CoordinationBackend>,
    gateway: Arc<dyn GatewayConnection>,
    session_events: mpsc::Receiver<SessionEvent>,
    history: Option<Arc<dyn MessageHistory>>,
    holder_id: Option<String>,
}

impl OrchestratorBuilder {
    pub fn holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = Some(holder_id.into());
        self
    }

    /// Channel history for the requery correlation policy
    pub fn history(mut self, history: Arc<dyn MessageHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// Start relay listeners and the event pump, then make the first leadership attempt
    pub async fn start(self) -> Result<Arc<Orchestrator>> {
        self.config
            .validate()
            .map_err(|e| OrchestratorError::InvalidRequest {
                message: e.to_string(),
            })?;

        let config = self.config;
        let keys = config.coordination.key_space();
        let holder_id = self.holder_id.unwrap_or_else(generate_holder_id);

        let bus = EventBus::new(self.backend.clone(), keys.clone());
        let store = SharedTaskStore::new(self.backend.clone(), bus.clone(), keys.clone(), &config.store);

        let elector = Arc::new(BackendLeaderElector::new(
            self.backend.clone(),
            keys.gateway_lock(),
            config.coordination.lock_ttl(),
        ));
        let coordinator = LeaderCoordinator::new(
            holder_id.clone(),
            elector,
            self.gateway.clone(),
            config.coordination.lock_ttl(),
            config.coordination.renewal_interval(),
        );
        let relay = CommandRelay::new(
            bus.clone(),
            coordinator.clone(),
            self.gateway.clone(),
            config.relay.timeout(),
        );

        let mut correlator = EventCorrelator::new(store.clone(), &config.gateway, &config.correlation);
        if let Some(history) = self.history {
            correlator = correlator.with_history(history);
        }

        // Listen for relay traffic before this process can become leader
        relay.start().await.map_err(|e| {
            OrchestratorError::gateway_unavailable(format!("relay channels unavailable: {e}"))
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(pump_session_events(correlator, self.session_events, shutdown_rx));

        coordinator.start().await;

        info!(
            holder_id = %holder_id,
            role = %coordinator.role(),
            key_prefix = %keys.prefix(),
            "🚀 ORCHESTRATOR: Started"
        );

        Ok(Arc::new(Orchestrator {
            holder_id,
            store,
            bus,
            coordinator,
            relay,
            wait: config.wait,
            store_retry: RetryPolicy::exponential(STORE_RETRY_ATTEMPTS, STORE_RETRY_BASE_DELAY),
            shutdown_tx,
            pump: Mutex::new(Some(pump)),
        }))
    }
}

#[derive(Debug)]
pub struct Orchestrator {
    holder_id: String,
    store: SharedTaskStore,
    bus: EventBus,
    coordinator: Arc<LeaderCoordinator>,
    relay: Arc<CommandRelay>,
    wait: WaitConfig,
    store_retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// `session_events` must be the receiving end of the channel `gateway` reports on
    pub fn builder(
        config: BotRelayConfig,
        backend: Arc<dyn CoordinationBackend>,
        gateway: Arc<dyn GatewayConnection>,
        session_events: mpsc::Receiver<SessionEvent>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            backend,
            gateway,
            session_events,
            history: None,
            holder_id: None,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn role(&self) -> NodeRole {
        self.coordinator.role()
    }

    pub fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    pub fn store(&self) -> &SharedTaskStore {
        &self.store
    }

    /// Create a job for `request.prompt` and send it; returns the job id.
    ///
    /// The returned id only means the platform accepted the command. Use
    /// [`wait_for_task`](Self::wait_for_task) or [`get_task`](Self::get_task) for results.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<String> {
        request.validate()?;
        let job_id = request.job_id.unwrap_or_else(generate_job_id);
        let job = Job::new_create(
            job_id.clone(),
            request.user_id,
            request.workflow_ref,
            request.prompt.clone(),
        );

        self.create_job(&job).await?;
        let command = GatewayCommand::Imagine {
            nonce: job_id.clone(),
            prompt: request.prompt,
        };
        self.dispatch_for(&job, &command).await?;
        Ok(job_id)
    }

    /// Press `action_token` on a previous result message; returns the new job id
    #[instrument(skip(self, request), fields(user_id = %request.user_id, message_id = %request.message_id))]
    pub async fn act(&self, request: ActRequest) -> Result<String> {
        request.validate()?;
        let unknown = || OrchestratorError::UnknownAction {
            message_id: request.message_id.clone(),
            action_token: request.action_token.clone(),
        };

        let source_job_id = self
            .with_store_retry("lookup_message", || self.store.job_id_for_message(&request.message_id))
            .await?
            .ok_or_else(unknown)?;
        let source = self
            .with_store_retry("get_job", || self.store.get(&source_job_id))
            .await?
            .ok_or_else(unknown)?;
        if !source.has_action(&request.action_token) {
            debug!(source_job_id = %source.job_id, "ORCHESTRATOR: Action not offered by message");
            return Err(unknown());
        }

        let job_id = request.job_id.clone().unwrap_or_else(generate_job_id);
        let job = Job::new_act(
            job_id.clone(),
            request.user_id.clone(),
            request.workflow_ref.clone(),
            &source,
            request.message_id.clone(),
            request.action_token.clone(),
        );

        self.create_job(&job).await?;
        let command = GatewayCommand::Action {
            nonce: job_id.clone(),
            message_id: request.message_id.clone(),
            custom_id: request.action_token.clone(),
        };
        self.dispatch_for(&job, &command).await?;
        Ok(job_id)
    }

    pub async fn get_task(&self, job_id: &str) -> Result<Job> {
        self.with_store_retry("get_job", || self.store.get(job_id))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Poll until the job is terminal or `timeout` (default: configured wait timeout) elapses.
    ///
    /// `Succeeded` returns the job; `Failed` is returned as [`OrchestratorError::JobFailed`].
    #[instrument(skip(self))]
    pub async fn wait_for_task(&self, job_id: &str, timeout: Option<Duration>) -> Result<Job> {
        let timeout = timeout.unwrap_or_else(|| self.wait.timeout());
        let poll_interval = self.wait.poll_interval();
        let started = Instant::now();

        loop {
            let job = self.get_task(job_id).await?;
            match job.status {
                JobStatus::Succeeded => return Ok(job),
                JobStatus::Failed => {
                    return Err(OrchestratorError::JobFailed {
                        job_id: job.job_id,
                        reason: job
                            .fail_reason
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    })
                }
                JobStatus::Submitted | JobStatus::InProgress => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!(waited_ms = elapsed.as_millis() as u64, "⏱️ ORCHESTRATOR: Wait timed out");
                return Err(OrchestratorError::Timeout {
                    job_id: job_id.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Mark the job failed locally and free the user's slot.
    ///
    /// The platform cannot cancel a render; if it completes, its events are ignored.
    /// Cancelling a terminal job returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<Job> {
        let patch = JobPatch::fail(CANCELLED_REASON);
        match self
            .with_store_retry("cancel_job", || self.store.update(job_id, &patch))
            .await?
        {
            UpdateOutcome::Applied(job) | UpdateOutcome::Unchanged(job) => Ok(job),
            UpdateOutcome::Missing => Err(OrchestratorError::NotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Point the job at a durable copy of its artifact
    pub async fn replace_result_ref(&self, job_id: &str, result_ref: &str) -> Result<Job> {
        if result_ref.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest {
                message: "result_ref must not be empty".to_string(),
            });
        }
        self.with_store_retry("replace_result_ref", || {
            self.store.replace_result_ref(job_id, result_ref)
        })
        .await?
        .ok_or_else(|| OrchestratorError::NotFound {
            job_id: job_id.to_string(),
        })
    }

    /// The user's non-terminal job, if any
    pub async fn active_job(&self, user_id: &str) -> Result<Option<Job>> {
        self.with_store_retry("active_job", || self.store.active_job(user_id))
            .await
    }

    /// Terminal transitions from every process in the cluster
    pub async fn subscribe_state_changes(&self) -> Result<TypedSubscription<JobStateChanged>> {
        self.bus.subscribe_state_changes().await.map_err(|e| {
            OrchestratorError::gateway_unavailable(format!("event bus unavailable: {e}"))
        })
    }

    /// Stop relay listeners, hand back leadership (disconnecting the gateway), stop the pump
    pub async fn shutdown(&self) {
        info!(holder_id = %self.holder_id, "🛑 ORCHESTRATOR: Shutting down");
        self.relay.shutdown().await;
        self.coordinator.shutdown().await;

        self.shutdown_tx.send_replace(true);
        if let Some(pump) = self.pump.lock().await.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "⚠️ ORCHESTRATOR: Event pump ended abnormally");
            }
        }
        info!(holder_id = %self.holder_id, "✅ ORCHESTRATOR: Stopped");
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        self.with_store_retry("create_job", || self.store.try_acquire_and_create(job))
            .await
    }

    async fn dispatch_for(&self, job: &Job, command: &GatewayCommand) -> Result<()> {
        match self.relay.dispatch(command).await {
            Ok(()) => {
                log_job_operation(
                    "dispatch",
                    &job.job_id,
                    Some(&job.user_id),
                    &job.status.to_string(),
                    Some(command.name()),
                );
                Ok(())
            }
            Err(e) => {
                let (reason, error) = map_relay_error(&e);
                log_error("orchestrator", "dispatch", &e.to_string(), Some(&job.job_id));
                self.fail_job(&job.job_id, &reason).await;
                Err(error)
            }
        }
    }

    /// Best effort: a job we cannot mark failed still expires with its TTL
    async fn fail_job(&self, job_id: &str, reason: &str) {
        let patch = JobPatch::fail(reason);
        if let Err(e) = self
            .with_store_retry("fail_job", || self.store.update(job_id, &patch))
            .await
        {
            warn!(job_id = job_id, error = %e, "⚠️ ORCHESTRATOR: Could not mark job failed");
        }
    }

    /// Retry transient store errors, then translate into the public taxonomy
    async fn with_store_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        retry_with_backoff(&self.store_retry, operation, StoreError::is_transient, op)
            .await
            .map_err(map_store_error)
    }
}

fn map_store_error(error: StoreError) -> OrchestratorError {
    match error {
        StoreError::AlreadyActive { user_id } => OrchestratorError::AlreadyActive { user_id },
        other => OrchestratorError::gateway_unavailable(format!("task store unavailable: {other}")),
    }
}

fn map_gateway_error(error: &GatewayError) -> OrchestratorError {
    match error {
        GatewayError::NotReady | GatewayError::Closed { .. } | GatewayError::Configuration { .. } => {
            OrchestratorError::gateway_unavailable(error.to_string())
        }
        GatewayError::Network { .. } | GatewayError::Http { .. } | GatewayError::Protocol { .. } => {
            OrchestratorError::Network {
                message: error.to_string(),
            }
        }
    }
}

/// Failure reason to store on the job, and the error for the caller
fn map_relay_error(error: &RelayError) -> (String, OrchestratorError) {
    match error {
        RelayError::Timeout { waited_ms } => (
            RELAY_TIMEOUT_REASON.to_string(),
            OrchestratorError::gateway_unavailable(format!(
                "no response from the gateway leader within {waited_ms}ms"
            )),
        ),
        RelayError::Remote(e) | RelayError::Gateway(e) => (e.to_string(), map_gateway_error(e)),
        RelayError::Backend(e) => (
            format!("relay transport failed: {e}"),
            OrchestratorError::gateway_unavailable(e.to_string()),
        ),
        RelayError::Closed => (
            "command relay closed".to_string(),
            OrchestratorError::gateway_unavailable("command relay closed"),
        ),
    }
}

/// Feed gateway session events to the correlator until shutdown or the session goes away
async fn pump_session_events(
    correlator: EventCorrelator,
    mut events: mpsc::Receiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    SessionEvent::SessionReady(identity) => {
                        info!(session_id = %identity.session_id, "✅ ORCHESTRATOR: Gateway session ready");
                    }
                    SessionEvent::Disconnected { reason } => {
                        warn!(reason = %reason, "🔌 ORCHESTRATOR: Gateway disconnected, session will reconnect");
                    }
                    SessionEvent::Raw(_) => {
                        if let Err(e) = correlator.handle_session_event(&event).await {
                            warn!(error = %e, "⚠️ ORCHESTRATOR: Event correlation failed, event lost");
                        }
                    }
                }
            }
        }
    }
    debug!("ORCHESTRATOR: Event pump stopped");
}
