//! # Job Model
//!
//! The unit of work submitted to the external bot. Jobs are serialized as JSON into the
//! shared store and expire with it; the store is not a system of record.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state_machine::{JobEvent, JobStateMachine, JobStatus, StateMachineResult};

/// What the job asks the platform to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fresh generation from a prompt
    Create,
    /// Follow-up action (upscale, variation, re-roll) on a prior result message
    Act,
}

/// A follow-up action exposed by a platform message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub custom_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    /// Platform component type (2 for buttons)
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Doubles as the nonce of the initial command
    pub job_id: String,
    pub user_id: String,
    /// Opaque caller context, passed through untouched
    #[serde(default)]
    pub workflow_ref: Option<String>,
    pub kind: JobKind,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Act jobs: the result message the action was taken on
    #[serde(default)]
    pub source_message_id: Option<String>,
    #[serde(default)]
    pub action_token: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub external_message_id: Option<String>,
    #[serde(default)]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub progress_hint: Option<String>,
    #[serde(default)]
    pub available_actions: Vec<ActionButton>,
    #[serde(default)]
    pub message_hash: Option<String>,
    #[serde(default)]
    pub fail_reason: Option<String>,
    /// Epoch milliseconds
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    pub fn new_create(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        workflow_ref: Option<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            job_id: job_id.into(),
            user_id: user_id.into(),
            workflow_ref,
            kind: JobKind::Create,
            prompt: Some(prompt.into()),
            source_message_id: None,
            action_token: None,
            status: JobStatus::Submitted,
            external_message_id: None,
            result_ref: None,
            progress_hint: None,
            available_actions: Vec::new(),
            message_hash: None,
            fail_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An action job inherits the prompt of the job whose message it acts on
    pub fn new_act(
        job_id: impl Into<String>,
        user_id: impl Into<String>,
        workflow_ref: Option<String>,
        source: &Job,
        source_message_id: impl Into<String>,
        action_token: impl Into<String>,
    ) -> Self {
        let mut job = Self::new_create(job_id, user_id, workflow_ref, String::new());
        job.kind = JobKind::Act;
        job.prompt = source.prompt.clone();
        job.source_message_id = Some(source_message_id.into());
        job.action_token = Some(action_token.into());
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_action(&self, custom_id: &str) -> bool {
        self.available_actions
            .iter()
            .any(|action| action.custom_id == custom_id)
    }

    /// Merge a patch into the job, returning the resulting status.
    ///
    /// Fails without touching the job when the patch's event is not a legal transition.
    /// Field-only patches on a terminal job are rejected the same way.
    pub fn apply_patch(&mut self, patch: &JobPatch) -> StateMachineResult<JobStatus> {
        let event = patch.event.clone().unwrap_or(JobEvent::Progress);
        let target = JobStateMachine::determine_target_state(self.status, &event)?;
        let target = if patch.event.is_some() {
            target
        } else {
            self.status
        };

        if self.external_message_id.is_none() {
            if let Some(message_id) = &patch.external_message_id {
                self.external_message_id = Some(message_id.clone());
            }
        }
        if let Some(result_ref) = &patch.result_ref {
            self.result_ref = Some(result_ref.clone());
        }
        if let Some(progress) = &patch.progress_hint {
            self.progress_hint = Some(progress.clone());
        }
        if let Some(actions) = &patch.available_actions {
            self.available_actions = actions.clone();
        }
        if let Some(hash) = &patch.message_hash {
            self.message_hash = Some(hash.clone());
        }
        if let Some(reason) = event.error_message() {
            self.fail_reason = Some(reason.to_string());
        }
        if target == JobStatus::Succeeded {
            self.progress_hint = Some("100%".to_string());
        }

        self.status = target;
        self.updated_at = Utc::now().timestamp_millis();
        Ok(target)
    }
}

/// Partial update applied by the correlator or by the owning process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPatch {
    pub event: Option<JobEvent>,
    pub external_message_id: Option<String>,
    pub result_ref: Option<String>,
    pub progress_hint: Option<String>,
    pub available_actions: Option<Vec<ActionButton>>,
    pub message_hash: Option<String>,
}

impl JobPatch {
    pub fn with_event(event: JobEvent) -> Self {
        Self {
            event: Some(event),
            ..Default::default()
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::with_event(JobEvent::fail_with_reason(reason))
    }

    pub fn external_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.external_message_id = Some(message_id.into());
        self
    }

    pub fn progress_hint(mut self, progress: impl Into<String>) -> Self {
        self.progress_hint = Some(progress.into());
        self
    }

    pub fn result_ref(mut self, url: impl Into<String>) -> Self {
        self.result_ref = Some(url.into());
        self
    }

    pub fn available_actions(mut self, actions: Vec<ActionButton>) -> Self {
        self.available_actions = Some(actions);
        self
    }

    pub fn message_hash(mut self, hash: impl Into<String>) -> Self {
        self.message_hash = Some(hash.into());
        self
    }

    /// Whether applying this patch ends the job
    pub fn is_terminal(&self) -> bool {
        self.event.as_ref().is_some_and(JobEvent::is_terminal)
    }
}
