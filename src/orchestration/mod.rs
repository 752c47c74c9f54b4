//! # Orchestration
//!
//! The public facade over the relay core and the bootstrap that assembles a node.

pub mod bootstrap;
pub mod orchestrator;

pub use bootstrap::{bootstrap_node, BootstrapError, NodeHandle, NodeStatus};
pub use orchestrator::{generate_job_id, ActRequest, Orchestrator, OrchestratorBuilder, SubmitRequest};
