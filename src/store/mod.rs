//! # Shared Task Store
//!
//! Job records, the per-user active marker and submission lock, and the
//! message-to-job index, all kept in the coordination backend under TTLs.

pub mod errors;
pub mod task_store;

pub use errors::{StoreError, StoreResult};
pub use task_store::{SharedTaskStore, UpdateOutcome};
