use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Lock contention or a live job for the same user; never retried automatically
    #[error("User {user_id} already has an active job")]
    AlreadyActive { user_id: String },

    /// Transient; callers of the store decide whether to retry
    #[error("Task store backend error: {0}")]
    Backend(#[from] BackendError),

    /// Other writers kept changing the record between read and write
    #[error("Job {job_id} still contended after {attempts} update attempts")]
    Contended { job_id: String, attempts: u32 },

    #[error("Corrupt job record {key}: {message}")]
    Serialization { key: String, message: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Contended { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
