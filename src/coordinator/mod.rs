//! Cluster leadership over the gateway connection.

pub mod elector;
pub mod leader;

pub use elector::{
    BackendLeaderElector, ElectionError, ElectionResult, LeaderElector, LeadershipResult,
    RenewalResult,
};
pub use leader::{generate_holder_id, GatewayLease, LeaderCoordinator, NodeRole};
