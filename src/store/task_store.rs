//! Shared task store.
//!
//! Key layout (under the configured prefix):
//! - `job:{jobId}`: JSON job record, job TTL
//! - `msg2job:{messageId}`: platform message id to job id, job TTL
//! - `user:active:{userId}`: id of the user's non-terminal job, job TTL
//! - `user:lock:{userId}`: submission lock, short TTL
//!
//! Job creation is "acquire lock, recheck, create, else release" rather than one script.
//! Two processes may both pass a plain acquire when a lock expires between them; the
//! recheck against the active marker makes the loser back out with `AlreadyActive`.
//!
//! Updates are read-merge-compare-and-set: the write only lands if the record is still
//! byte-for-byte what was read, otherwise the merge is redone against the fresh record.
//! A terminal status therefore can never be overwritten by a slower concurrent writer.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::errors::{StoreError, StoreResult};
use crate::backend::CoordinationBackend;
use crate::config::StoreConfig;
use crate::constants::KeySpace;
use crate::events::{EventBus, JobStateChanged, TaskUpdateEvent, TaskUpdateKind};
use crate::logging::log_job_operation;
use crate::models::{Job, JobPatch};
use crate::state_machine::{JobStatus, StateMachineResult};

/// Read-merge-write rounds before an update gives up with [`StoreError::Contended`]
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Result of [`SharedTaskStore::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The patch was merged and persisted
    Applied(Job),
    /// The job is terminal or the transition is not allowed; nothing was written
    Unchanged(Job),
    /// No live record (expired or deleted)
    Missing,
}

impl UpdateOutcome {
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Applied(job) | Self::Unchanged(job) => Some(job),
            Self::Missing => None,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

#[derive(Debug, Clone)]
pub struct SharedTaskStore {
    backend: Arc<dyn CoordinationBackend>,
    bus: EventBus,
    keys: KeySpace,
    job_ttl: Duration,
    user_lock_ttl: Duration,
}

impl SharedTaskStore {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        bus: EventBus,
        keys: KeySpace,
        config: &StoreConfig,
    ) -> Self {
        Self {
            backend,
            bus,
            keys,
            job_ttl: config.job_ttl(),
            user_lock_ttl: config.user_lock_ttl(),
        }
    }

    /// Atomically claim the user's single job slot and persist `job`
    #[instrument(skip(self, job), fields(job_id = %job.job_id, user_id = %job.user_id))]
    pub async fn try_acquire_and_create(&self, job: &Job) -> StoreResult<Job> {
        let lock_key = self.keys.user_lock(&job.user_id);
        let lock_value = format!("{}-{}", job.job_id, Utc::now().timestamp_millis());

        let acquired = self
            .backend
            .set_if_absent(&lock_key, &lock_value, self.user_lock_ttl)
            .await?;
        if !acquired {
            debug!("🔒 TASK_STORE: User lock held by another submission");
            return Err(StoreError::AlreadyActive {
                user_id: job.user_id.clone(),
            });
        }

        match self.create_under_lock(job).await {
            Ok(created) => Ok(created),
            Err(e) => {
                // Best effort: the lock TTL bounds the damage if this also fails
                if let Err(release_err) = self.backend.compare_and_delete(&lock_key, &lock_value).await {
                    warn!(error = %release_err, "⚠️ TASK_STORE: Failed to release user lock");
                }
                Err(e)
            }
        }
    }

    async fn create_under_lock(&self, job: &Job) -> StoreResult<Job> {
        if self.has_active_job(&job.user_id).await? {
            debug!("🔒 TASK_STORE: Recheck found an active job, backing out");
            return Err(StoreError::AlreadyActive {
                user_id: job.user_id.clone(),
            });
        }

        if let Err(e) = self.persist_new_job(job).await {
            // A record without its marker would linger in list_pending until the TTL
            if let Err(cleanup_err) = self.backend.delete(&self.keys.job(&job.job_id)).await {
                warn!(error = %cleanup_err, "⚠️ TASK_STORE: Failed to remove partially created job");
            }
            return Err(e);
        }

        log_job_operation("create", &job.job_id, Some(&job.user_id), &job.status.to_string(), None);
        self.broadcast_update(TaskUpdateKind::Create, &job.job_id, Some(job.clone()))
            .await;
        Ok(job.clone())
    }

    async fn persist_new_job(&self, job: &Job) -> StoreResult<()> {
        self.write_job(job).await?;
        self.backend
            .set_with_ttl(&self.keys.user_active(&job.user_id), &job.job_id, self.job_ttl)
            .await?;
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> StoreResult<Option<Job>> {
        Ok(self.read_job(job_id).await?.map(|(_, job)| job))
    }

    /// The stored record together with its raw form, for compare-and-set
    async fn read_job(&self, job_id: &str) -> StoreResult<Option<(String, Job)>> {
        let key = self.keys.job(job_id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };
        let job = serde_json::from_str(&raw).map_err(|e| StoreError::Serialization {
            key,
            message: e.to_string(),
        })?;
        Ok(Some((raw, job)))
    }

    /// Merge `patch` into the job. Terminal jobs and illegal transitions are left untouched.
    ///
    /// A terminal result clears the user's active marker, releases the submission lock and
    /// broadcasts [`JobStateChanged`].
    #[instrument(skip(self, patch), fields(event = ?patch.event.as_ref().map(|e| e.event_type())))]
    pub async fn update(&self, job_id: &str, patch: &JobPatch) -> StoreResult<UpdateOutcome> {
        let (previous, job) = match self.modify_job(job_id, |job| job.apply_patch(patch)).await? {
            Modification::Written { previous, job } => (previous, job),
            Modification::Rejected(job) => return Ok(UpdateOutcome::Unchanged(job)),
            Modification::Missing => {
                debug!("TASK_STORE: Update for missing job ignored");
                return Ok(UpdateOutcome::Missing);
            }
        };

        if job.is_terminal() {
            self.release_user_slot(&job).await?;
            log_job_operation(
                "finish",
                &job.job_id,
                Some(&job.user_id),
                &job.status.to_string(),
                job.fail_reason.as_deref(),
            );
            if let Err(e) = self
                .bus
                .publish_state_changed(&JobStateChanged::from(&job))
                .await
            {
                warn!(job_id = %job.job_id, error = %e, "⚠️ TASK_STORE: Failed to broadcast state change");
            }
        } else if previous != job.status {
            info!(job_id = %job.job_id, from = %previous, to = %job.status, "📋 TASK_STORE: Job transitioned");
        }

        self.broadcast_update(TaskUpdateKind::Update, &job.job_id, Some(job.clone()))
            .await;
        Ok(UpdateOutcome::Applied(job))
    }

    /// Swap the stored result reference, e.g. for a durable copy of the artifact.
    /// Allowed on terminal jobs.
    pub async fn replace_result_ref(&self, job_id: &str, result_ref: &str) -> StoreResult<Option<Job>> {
        let modification = self
            .modify_job(job_id, |job| {
                job.result_ref = Some(result_ref.to_string());
                job.updated_at = Utc::now().timestamp_millis();
                Ok(job.status)
            })
            .await?;
        match modification {
            Modification::Written { job, .. } => {
                self.broadcast_update(TaskUpdateKind::Update, &job.job_id, Some(job.clone()))
                    .await;
                Ok(Some(job))
            }
            Modification::Rejected(job) => Ok(Some(job)),
            Modification::Missing => Ok(None),
        }
    }

    /// Apply `change` to the stored record and write it back only if nobody wrote in
    /// between; on a lost race the change is redone against the fresh record.
    async fn modify_job<F>(&self, job_id: &str, mut change: F) -> StoreResult<Modification>
    where
        F: FnMut(&mut Job) -> StateMachineResult<JobStatus>,
    {
        let key = self.keys.job(job_id);
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some((raw, mut job)) = self.read_job(job_id).await? else {
                return Ok(Modification::Missing);
            };

            let previous = job.status;
            if let Err(e) = change(&mut job) {
                debug!(error = %e, "TASK_STORE: Update ignored");
                return Ok(Modification::Rejected(job));
            }

            let payload = encode_job(&key, &job)?;
            if self
                .backend
                .compare_and_set(&key, &raw, &payload, self.job_ttl)
                .await?
            {
                return Ok(Modification::Written { previous, job });
            }
            debug!(attempt = attempt, "TASK_STORE: Job changed during update, merging again");
        }

        warn!(job_id = job_id, "⚠️ TASK_STORE: Giving up on contended job update");
        Err(StoreError::Contended {
            job_id: job_id.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Index a platform message id to its job, with the job's TTL
    pub async fn map_message_to_job(&self, message_id: &str, job_id: &str) -> StoreResult<()> {
        self.backend
            .set_with_ttl(&self.keys.message_index(message_id), job_id, self.job_ttl)
            .await?;
        Ok(())
    }

    pub async fn job_id_for_message(&self, message_id: &str) -> StoreResult<Option<String>> {
        Ok(self.backend.get(&self.keys.message_index(message_id)).await?)
    }

    /// Every non-terminal job, oldest first.
    ///
    /// Scans the whole job keyspace; only the correlation fallback calls this.
    pub async fn list_pending(&self) -> StoreResult<Vec<Job>> {
        let mut pending = Vec::new();
        for key in self.backend.scan_prefix(&self.keys.job_prefix()).await? {
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Job>(&raw) {
                Ok(job) if !job.is_terminal() => pending.push(job),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "⚠️ TASK_STORE: Skipping corrupt job record"),
            }
        }
        pending.sort_by_key(|job| job.created_at);
        Ok(pending)
    }

    /// Whether the user holds a non-terminal job. A marker pointing at a vanished or
    /// terminal job is cleared on the way.
    pub async fn has_active_job(&self, user_id: &str) -> StoreResult<bool> {
        Ok(self.active_job(user_id).await?.is_some())
    }

    pub async fn active_job(&self, user_id: &str) -> StoreResult<Option<Job>> {
        let marker_key = self.keys.user_active(user_id);
        let Some(job_id) = self.backend.get(&marker_key).await? else {
            return Ok(None);
        };

        match self.get(&job_id).await? {
            Some(job) if !job.is_terminal() => Ok(Some(job)),
            _ => {
                debug!(user_id = user_id, job_id = %job_id, "TASK_STORE: Clearing stale active marker");
                self.backend.compare_and_delete(&marker_key, &job_id).await?;
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, job_id: &str) -> StoreResult<()> {
        if let Some(job) = self.get(job_id).await? {
            self.backend
                .compare_and_delete(&self.keys.user_active(&job.user_id), job_id)
                .await?;
        }
        self.backend.delete(&self.keys.job(job_id)).await?;
        self.broadcast_update(TaskUpdateKind::Delete, job_id, None).await;
        Ok(())
    }

    pub async fn release_user_lock(&self, user_id: &str) -> StoreResult<()> {
        self.backend.delete(&self.keys.user_lock(user_id)).await?;
        Ok(())
    }

    /// Delete job records older than `max_age`; returns how many were removed.
    ///
    /// TTL expiry is the primary cleanup; this sweep is for operators.
    pub async fn cleanup_expired(&self, max_age: Duration) -> StoreResult<usize> {
        let cutoff = Utc::now().timestamp_millis()
            - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let mut removed = 0;

        for key in self.backend.scan_prefix(&self.keys.job_prefix()).await? {
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            let Ok(job) = serde_json::from_str::<Job>(&raw) else {
                self.backend.delete(&key).await?;
                removed += 1;
                continue;
            };
            if job.created_at < cutoff {
                self.delete(&job.job_id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed = removed, "🧹 TASK_STORE: Swept expired jobs");
        }
        Ok(removed)
    }

    async fn write_job(&self, job: &Job) -> StoreResult<()> {
        let key = self.keys.job(&job.job_id);
        let payload = encode_job(&key, job)?;
        self.backend.set_with_ttl(&key, &payload, self.job_ttl).await?;
        Ok(())
    }

    async fn release_user_slot(&self, job: &Job) -> StoreResult<()> {
        self.backend
            .compare_and_delete(&self.keys.user_active(&job.user_id), &job.job_id)
            .await?;
        self.backend.delete(&self.keys.user_lock(&job.user_id)).await?;
        Ok(())
    }

    async fn broadcast_update(&self, kind: TaskUpdateKind, job_id: &str, job: Option<Job>) {
        let event = TaskUpdateEvent::new(kind, job_id, job);
        if let Err(e) = self.bus.publish_task_update(&event).await {
            warn!(job_id = job_id, error = %e, "⚠️ TASK_STORE: Failed to broadcast task update");
        }
    }
}

/// Result of one compare-and-set modification of a job record
enum Modification {
    Written { previous: JobStatus, job: Job },
    /// The change refused to apply; nothing was written
    Rejected(Job),
    Missing,
}

fn encode_job(key: &str, job: &Job) -> StoreResult<String> {
    serde_json::to_string(job).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}
