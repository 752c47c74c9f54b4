//! Lease-based leader election over the coordination backend.
//!
//! The lease is a single key whose value is the holder id. Acquisition is
//! set-if-absent with expiry; renewal and release are compare-and-set scripts, so a
//! holder whose lease lapsed can never extend or delete its successor's lease.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::backend::{BackendError, CoordinationBackend};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElectionError {
    #[error("Leader election backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type ElectionResult<T> = Result<T, ElectionError>;

/// Result of a leadership acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    Acquired { lease_duration: Duration },
    NotLeader { current_leader: Option<String> },
}

impl LeadershipResult {
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Result of a lease renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { lease_duration: Duration },
    /// The lease expired or another holder owns it now
    Lost,
}

impl RenewalResult {
    pub const fn is_renewed(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

#[async_trait]
pub trait LeaderElector: Send + Sync + std::fmt::Debug {
    async fn try_acquire(&self, holder_id: &str) -> ElectionResult<LeadershipResult>;

    async fn renew(&self, holder_id: &str) -> ElectionResult<RenewalResult>;

    /// Release the lease if `holder_id` still owns it; `true` when something was released
    async fn release(&self, holder_id: &str) -> ElectionResult<bool>;

    async fn current_leader(&self) -> ElectionResult<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct BackendLeaderElector {
    backend: Arc<dyn CoordinationBackend>,
    lock_key: String,
    lease_duration: Duration,
}

impl BackendLeaderElector {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        lock_key: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            backend,
            lock_key: lock_key.into(),
            lease_duration,
        }
    }

    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }
}

#[async_trait]
impl LeaderElector for BackendLeaderElector {
    async fn try_acquire(&self, holder_id: &str) -> ElectionResult<LeadershipResult> {
        if self
            .backend
            .set_if_absent(&self.lock_key, holder_id, self.lease_duration)
            .await?
        {
            return Ok(LeadershipResult::Acquired {
                lease_duration: self.lease_duration,
            });
        }

        let current_leader = self.backend.get(&self.lock_key).await?;
        // Our own lease survives a restart of the coordinator loop
        if current_leader.as_deref() == Some(holder_id) {
            return match self.renew(holder_id).await? {
                RenewalResult::Renewed { lease_duration } => {
                    Ok(LeadershipResult::Acquired { lease_duration })
                }
                RenewalResult::Lost => Ok(LeadershipResult::NotLeader {
                    current_leader: None,
                }),
            };
        }

        debug!(current_leader = ?current_leader, "LEADER: Lease held elsewhere");
        Ok(LeadershipResult::NotLeader { current_leader })
    }

    async fn renew(&self, holder_id: &str) -> ElectionResult<RenewalResult> {
        let renewed = self
            .backend
            .compare_and_expire(&self.lock_key, holder_id, self.lease_duration)
            .await?;
        Ok(if renewed {
            RenewalResult::Renewed {
                lease_duration: self.lease_duration,
            }
        } else {
            RenewalResult::Lost
        })
    }

    async fn release(&self, holder_id: &str) -> ElectionResult<bool> {
        Ok(self
            .backend
            .compare_and_delete(&self.lock_key, holder_id)
            .await?)
    }

    async fn current_leader(&self) -> ElectionResult<Option<String>> {
        Ok(self.backend.get(&self.lock_key).await?)
    }
}
