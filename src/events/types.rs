//! Event payloads broadcast between processes.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::Job;
use crate::state_machine::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskUpdateKind {
    Create,
    Update,
    Delete,
}

/// Emitted on every successful write to the task store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdateEvent {
    pub kind: TaskUpdateKind,
    pub job_id: String,
    /// Snapshot after the write; absent for deletions
    #[serde(default)]
    pub job: Option<Job>,
    pub emitted_at: i64,
}

impl TaskUpdateEvent {
    pub fn new(kind: TaskUpdateKind, job_id: impl Into<String>, job: Option<Job>) -> Self {
        Self {
            kind,
            job_id: job_id.into(),
            job,
            emitted_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Emitted on every terminal transition so results can be copied out before the TTL lapses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStateChanged {
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub fail_reason: Option<String>,
    #[serde(default)]
    pub workflow_ref: Option<String>,
}

impl From<&Job> for JobStateChanged {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            user_id: job.user_id.clone(),
            status: job.status,
            result_ref: job.result_ref.clone(),
            fail_reason: job.fail_reason.clone(),
            workflow_ref: job.workflow_ref.clone(),
        }
    }
}
