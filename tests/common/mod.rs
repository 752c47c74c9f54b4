#![allow(dead_code)]

pub mod cluster;
pub mod fake_gateway;
pub mod messages;

pub use cluster::*;
pub use fake_gateway::*;
pub use messages::*;
