#![allow(clippy::doc_markdown)] // Allow technical terms like WebSocket, Redis in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # BotRelay Core
//!
//! Cluster-safe orchestration core for driving an external chat-bot through its
//! real-time gateway.
//!
//! ## Overview
//!
//! Any number of identical processes share one Redis. Exactly one of them, the leader,
//! holds the gateway connection; the others forward commands to it over pub/sub. Every
//! process accepts submissions, and every process can read job state, because jobs live
//! in the shared store rather than in the process that created them.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - The `Orchestrator` facade and node bootstrap
//! - [`coordinator`] - Lease-based leader election over the gateway connection
//! - [`gateway`] - WebSocket session, frame protocol and interaction client
//! - [`relay`] - Follower-to-leader command forwarding
//! - [`correlation`] - Matching gateway messages to pending jobs
//! - [`store`] - Shared job records, per-user locks and the message index
//! - [`events`] - Cross-process event bus
//! - [`backend`] - Coordination backend trait with Redis and in-memory implementations
//! - [`models`] / [`state_machine`] - Jobs and their lifecycle
//! - [`config`] - Layered configuration
//! - [`error`] - Public error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use botrelay_core::config::ConfigManager;
//! use botrelay_core::orchestration::{bootstrap_node, SubmitRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = bootstrap_node(ConfigManager::load()?).await?;
//! let job_id = node
//!     .orchestrator
//!     .submit(SubmitRequest::new("user-1", "a red fox"))
//!     .await?;
//! let job = node.orchestrator.wait_for_task(&job_id, None).await?;
//! println!("result: {:?}", job.result_ref);
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                          # Unit and in-memory cluster tests
//! cargo test --features test-services # Adds tests against a live Redis at REDIS_URL
//! ```

pub mod backend;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod correlation;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod relay;
pub mod resilience;
pub mod state_machine;
pub mod store;

pub use backend::{CoordinationBackend, InMemoryBackend, RedisBackend};
pub use config::{BotRelayConfig, ConfigManager, UnmatchedEventPolicy};
pub use constants::KeySpace;
pub use coordinator::{LeaderCoordinator, NodeRole};
pub use error::{OrchestratorError, Result};
pub use events::{JobStateChanged, TaskUpdateEvent};
pub use gateway::{GatewayCommand, GatewayConnection, GatewaySession, SessionEvent};
pub use models::{ActionButton, Job, JobKind, JobPatch};
pub use orchestration::{ActRequest, Orchestrator, SubmitRequest};
pub use state_machine::{JobEvent, JobStatus};
