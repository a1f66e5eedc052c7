//! Quorum voting coordinator.
//!
//! Ad-hoc, one-shot decisions (not a replicated log) for conflict
//! resolution and task assignment. Independent of the consensus engine but
//! sharing its membership and quorum math.

pub mod coordinator;

pub use coordinator::{TallyOutcome, VoteCoordinator};

use hive_protocol::{AgentId, VoteId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("unknown vote {0}")]
    UnknownVote(VoteId),

    #[error("vote {0} is no longer open")]
    VoteClosed(VoteId),

    #[error("agent {0} already responded to this vote")]
    DuplicateVote(AgentId),

    #[error("agent {0} is not an active voter in this swarm")]
    NotEligible(AgentId),

    #[error("option {0:?} is not on the ballot")]
    UnknownOption(String),

    #[error("a vote needs at least two options, got {0}")]
    TooFewOptions(usize),

    #[error("quorum fraction must be in (0, 1], got {0}")]
    InvalidQuorum(f64),
}
