//! Pure matchers mapping a platform message to a pending job.
//!
//! Each matcher looks at the message and a [`CandidateSet`] prepared by the
//! correlator and either claims a job, reports ambiguity, or passes. The chain is
//! ordered from exact identifiers to heuristics; the first claim wins, and an event
//! nobody claims unambiguously is dropped rather than mis-applied.

use serde::Serialize;
use std::fmt;

use crate::gateway::{prompts_match, PlatformMessage};
use crate::models::{Job, JobKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// The platform echoed the job id as the message nonce
    Nonce,
    /// The message id is already indexed to a job
    MessageIndex,
    /// Reply to the message a pending action job acted on
    ReplyReference,
    /// Only one job is pending cluster-wide
    SinglePending,
    /// The echoed prompt matches exactly one pending job
    PromptSimilarity,
}

impl MatchRule {
    /// Rules that rely on identifiers rather than heuristics
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Nonce | Self::MessageIndex)
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nonce => "nonce",
            Self::MessageIndex => "message_index",
            Self::ReplyReference => "reply_reference",
            Self::SinglePending => "single_pending",
            Self::PromptSimilarity => "prompt_similarity",
        };
        f.write_str(name)
    }
}

/// Jobs the correlator fetched for one message
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Job whose id equals the message's (or referenced message's) nonce
    pub nonce_job: Option<Job>,
    /// Job the message id is indexed to
    pub indexed_job: Option<Job>,
    /// Every non-terminal job; only loaded when both lookups above miss
    pub pending: Vec<Job>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched { job: Job, rule: MatchRule },
    Ambiguous { rule: MatchRule, candidates: usize },
    NoMatch,
}

pub type Matcher = fn(&PlatformMessage, &CandidateSet) -> MatchResult;

pub fn match_nonce(message: &PlatformMessage, candidates: &CandidateSet) -> MatchResult {
    match (&candidates.nonce_job, message.effective_nonce()) {
        (Some(job), Some(nonce)) if job.job_id == nonce => MatchResult::Matched {
            job: job.clone(),
            rule: MatchRule::Nonce,
        },
        _ => MatchResult::NoMatch,
    }
}

pub fn match_message_index(_message: &PlatformMessage, candidates: &CandidateSet) -> MatchResult {
    match &candidates.indexed_job {
        Some(job) => MatchResult::Matched {
            job: job.clone(),
            rule: MatchRule::MessageIndex,
        },
        None => MatchResult::NoMatch,
    }
}

pub fn match_reply_reference(message: &PlatformMessage, candidates: &CandidateSet) -> MatchResult {
    let Some(referenced) = message.referenced_message_id() else {
        return MatchResult::NoMatch;
    };
    let hits: Vec<&Job> = candidates
        .pending
        .iter()
        .filter(|job| {
            (job.kind == JobKind::Act && job.source_message_id.as_deref() == Some(referenced))
                || job.external_message_id.as_deref() == Some(referenced)
        })
        .collect();
    unique(hits, MatchRule::ReplyReference)
}

pub fn match_single_pending(_message: &PlatformMessage, candidates: &CandidateSet) -> MatchResult {
    match candidates.pending.as_slice() {
        [only] => MatchResult::Matched {
            job: only.clone(),
            rule: MatchRule::SinglePending,
        },
        _ => MatchResult::NoMatch,
    }
}

pub fn match_prompt_similarity(message: &PlatformMessage, candidates: &CandidateSet) -> MatchResult {
    let Some(echoed) = message.prompt_fragment() else {
        return MatchResult::NoMatch;
    };
    let hits: Vec<&Job> = candidates
        .pending
        .iter()
        .filter(|job| {
            job.prompt
                .as_deref()
                .is_some_and(|prompt| prompts_match(prompt, &echoed))
        })
        .collect();
    unique(hits, MatchRule::PromptSimilarity)
}

fn unique(hits: Vec<&Job>, rule: MatchRule) -> MatchResult {
    match hits.as_slice() {
        [] => MatchResult::NoMatch,
        [job] => MatchResult::Matched {
            job: (*job).clone(),
            rule,
        },
        many => MatchResult::Ambiguous {
            rule,
            candidates: many.len(),
        },
    }
}

/// The full chain, exact identifiers first
pub const MATCHER_CHAIN: [Matcher; 5] = [
    match_nonce,
    match_message_index,
    match_reply_reference,
    match_single_pending,
    match_prompt_similarity,
];

/// Identifier-only chain, used when re-querying history
pub const EXACT_MATCHERS: [Matcher; 2] = [match_nonce, match_message_index];

/// First claim wins; otherwise report the first ambiguity, if any
pub fn run_chain(
    matchers: &[Matcher],
    message: &PlatformMessage,
    candidates: &CandidateSet,
) -> MatchResult {
    let mut ambiguity = None;
    for matcher in matchers {
        match matcher(message, candidates) {
            matched @ MatchResult::Matched { .. } => return matched,
            ambiguous @ MatchResult::Ambiguous { .. } => {
                ambiguity.get_or_insert(ambiguous);
            }
            MatchResult::NoMatch => {}
        }
    }
    ambiguity.unwrap_or(MatchResult::NoMatch)
}

pub fn correlate(message: &PlatformMessage, candidates: &CandidateSet) -> MatchResult {
    run_chain(&MATCHER_CHAIN, message, candidates)
}
