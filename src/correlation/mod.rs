//! Event correlation: matching inbound gateway messages to stored jobs.

pub mod correlator;
pub mod matchers;

pub use correlator::{derive_patch, CorrelationOutcome, EventCorrelator};
pub use matchers::{correlate, CandidateSet, MatchResult, MatchRule};
