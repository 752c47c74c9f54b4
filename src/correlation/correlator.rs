//! Maps gateway message events onto jobs in the shared store.
//!
//! Runs only on the node that owns the gateway session. Applying the same event twice
//! is harmless: the store ignores patches for terminal jobs and link/progress updates
//! carry the same data every time.

use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

use super::matchers::{run_chain, CandidateSet, MatchResult, MatchRule, EXACT_MATCHERS, MATCHER_CHAIN};
use crate::config::{CorrelationConfig, GatewayConfig, UnmatchedEventPolicy};
use crate::gateway::{MessageHistory, PlatformMessage, RawEvent, SessionEvent};
use crate::models::{Job, JobPatch};
use crate::state_machine::{JobEvent, JobStatus};
use crate::store::{SharedTaskStore, StoreResult, UpdateOutcome};

/// What happened to one inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelationOutcome {
    /// A job was patched
    Applied {
        job_id: String,
        rule: MatchRule,
        status: JobStatus,
    },
    /// Matched a job that is already terminal, or the patch was not a legal transition
    Unchanged { job_id: String, rule: MatchRule },
    /// Several jobs fit; the event was dropped
    Ambiguous { rule: MatchRule, candidates: usize },
    /// No job fits
    Unmatched,
    /// Wrong channel, wrong author, or not a message event
    Ignored,
}

impl CorrelationOutcome {
    pub fn applied_job_id(&self) -> Option<&str> {
        match self {
            Self::Applied { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

/// Translate a bot message into the patch it implies for `job`
pub fn derive_patch(message: &PlatformMessage, job: &Job) -> JobPatch {
    if message.is_final_result() {
        let mut patch = JobPatch::with_event(JobEvent::Complete)
            .external_message_id(message.id.clone())
            .available_actions(message.buttons());
        if let Some(url) = message.first_attachment_url() {
            patch = patch.result_ref(url);
        }
        if let Some(hash) = message.message_hash() {
            patch = patch.message_hash(hash);
        }
        return patch;
    }

    let event = if job.status == JobStatus::Submitted {
        JobEvent::Link
    } else {
        JobEvent::Progress
    };
    let mut patch = JobPatch::with_event(event).external_message_id(message.id.clone());
    if let Some(progress) = message.progress() {
        patch = patch.progress_hint(progress);
    }
    patch
}

#[derive(Debug, Clone)]
pub struct EventCorrelator {
    store: SharedTaskStore,
    channel_id: String,
    bot_id: String,
    policy: UnmatchedEventPolicy,
    history_limit: u32,
    history: Option<Arc<dyn MessageHistory>>,
}

impl EventCorrelator {
    pub fn new(store: SharedTaskStore, gateway: &GatewayConfig, correlation: &CorrelationConfig) -> Self {
        Self {
            store,
            channel_id: gateway.channel_id.clone(),
            bot_id: gateway.bot_id.clone(),
            policy: correlation.unmatched_policy,
            history_limit: correlation.history_limit,
            history: None,
        }
    }

    /// Attach the history source used by [`UnmatchedEventPolicy::Requery`]
    pub fn with_history(mut self, history: Arc<dyn MessageHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub async fn handle_session_event(&self, event: &SessionEvent) -> StoreResult<CorrelationOutcome> {
        match event {
            SessionEvent::Raw(raw) => self.handle_event(raw).await,
            SessionEvent::SessionReady(_) | SessionEvent::Disconnected { .. } => {
                Ok(CorrelationOutcome::Ignored)
            }
        }
    }

    pub async fn handle_event(&self, event: &RawEvent) -> StoreResult<CorrelationOutcome> {
        let outcome = match event {
            RawEvent::MessageCreate(message) => self.handle_message(message, true).await?,
            RawEvent::MessageUpdate(message) => self.handle_message(message, false).await?,
            RawEvent::Ready(_) | RawEvent::Other { .. } => return Ok(CorrelationOutcome::Ignored),
        };

        if matches!(
            outcome,
            CorrelationOutcome::Unmatched | CorrelationOutcome::Ambiguous { .. }
        ) && self.policy == UnmatchedEventPolicy::Requery
        {
            if let Err(e) = self.requery().await {
                warn!(error = %e, "⚠️ CORRELATOR: History requery failed");
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id, create = is_create))]
    async fn handle_message(&self, message: &PlatformMessage, is_create: bool) -> StoreResult<CorrelationOutcome> {
        if !self.accepts(message, is_create) {
            trace!("CORRELATOR: Message filtered");
            return Ok(CorrelationOutcome::Ignored);
        }

        let candidates = self.candidates_for(message, true).await?;
        match run_chain(&MATCHER_CHAIN, message, &candidates) {
            MatchResult::Matched { job, rule } => self.apply(message, &job, rule).await,
            MatchResult::Ambiguous { rule, candidates } => {
                warn!(
                    rule = %rule,
                    candidates = candidates,
                    "⚠️ CORRELATOR: Ambiguous event dropped"
                );
                Ok(CorrelationOutcome::Ambiguous { rule, candidates })
            }
            MatchResult::NoMatch => {
                debug!(pending = candidates.pending.len(), "CORRELATOR: No job matched");
                Ok(CorrelationOutcome::Unmatched)
            }
        }
    }

    /// Re-read recent channel history and apply messages that identify their job exactly.
    /// Returns how many jobs were patched.
    pub async fn requery(&self) -> StoreResult<usize> {
        let Some(history) = &self.history else {
            return Ok(0);
        };
        let messages = match history.recent_messages(self.history_limit).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "⚠️ CORRELATOR: Could not fetch channel history");
                return Ok(0);
            }
        };

        let mut applied = 0;
        // Oldest first so a final render lands after the progress edits before it
        for message in messages.iter().rev() {
            if !self.accepts(message, false) {
                continue;
            }
            let candidates = self.candidates_for(message, false).await?;
            if let MatchResult::Matched { job, rule } = run_chain(&EXACT_MATCHERS, message, &candidates) {
                if job.is_terminal() {
                    continue;
                }
                if self.apply(message, &job, rule).await?.applied_job_id().is_some() {
                    applied += 1;
                }
            }
        }

        if applied > 0 {
            info!(applied = applied, "🔁 CORRELATOR: Recovered jobs from history");
        }
        Ok(applied)
    }

    fn accepts(&self, message: &PlatformMessage, is_create: bool) -> bool {
        if !self.channel_id.is_empty() {
            if let Some(channel) = message.channel_id.as_deref() {
                if channel != self.channel_id {
                    return false;
                }
            }
        }
        // Updates may omit the author; creates always carry one
        match message.author_id() {
            Some(author) => self.bot_id.is_empty() || author == self.bot_id,
            None => !is_create,
        }
    }

    /// Exact lookups first; the pending scan only runs when both miss
    async fn candidates_for(&self, message: &PlatformMessage, load_pending: bool) -> StoreResult<CandidateSet> {
        let nonce_job = match message.effective_nonce() {
            Some(nonce) => self.store.get(nonce).await?,
            None => None,
        };
        let indexed_job = match self.store.job_id_for_message(&message.id).await? {
            Some(job_id) => self.store.get(&job_id).await?,
            None => None,
        };
        let pending = if load_pending && nonce_job.is_none() && indexed_job.is_none() {
            self.store.list_pending().await?
        } else {
            Vec::new()
        };
        Ok(CandidateSet {
            nonce_job,
            indexed_job,
            pending,
        })
    }

    async fn apply(&self, message: &PlatformMessage, job: &Job, rule: MatchRule) -> StoreResult<CorrelationOutcome> {
        let patch = derive_patch(message, job);
        match self.store.update(&job.job_id, &patch).await? {
            UpdateOutcome::Applied(updated) => {
                self.store.map_message_to_job(&message.id, &updated.job_id).await?;
                if !rule.is_exact() {
                    info!(job_id = %updated.job_id, rule = %rule, "🔍 CORRELATOR: Matched without an identifier");
                }
                debug!(
                    job_id = %updated.job_id,
                    rule = %rule,
                    status = %updated.status,
                    "🔗 CORRELATOR: Event applied"
                );
                Ok(CorrelationOutcome::Applied {
                    job_id: updated.job_id,
                    rule,
                    status: updated.status,
                })
            }
            UpdateOutcome::Unchanged(_) | UpdateOutcome::Missing => Ok(CorrelationOutcome::Unchanged {
                job_id: job.job_id.clone(),
                rule,
            }),
        }
    }
}
