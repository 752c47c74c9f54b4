//! # Data Models
//!
//! Records kept in the shared task store.

pub mod job;

pub use job::{ActionButton, Job, JobKind, JobPatch};
