//! # Resilience Module
//!
//! Backoff and bounded retry for the two places the relay core talks to flaky
//! networks: gateway reconnection and outbound command sends.

pub mod backoff;
pub mod retry;

pub use backoff::ExponentialBackoff;
pub use retry::{retry_with_backoff, RetryDelay, RetryPolicy};
