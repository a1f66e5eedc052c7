//! Raft-style consensus engine for Hive swarms.
//!
//! Split in two layers:
//! - [`raft::RaftNode`] is a pure, synchronous state machine: messages in,
//!   messages out. All mutations to `current_term`, `voted_for`, `state`,
//!   and the log happen there, one step at a time.
//! - [`runtime::ConsensusRuntime`] owns one node per swarm inside a tokio
//!   task, drives the cancellable election/heartbeat timers, carries RPCs
//!   over the message bus, persists durable state, and services command
//!   submission with commit waiters.
//!
//! The split keeps the safety-critical protocol logic deterministic and
//! testable without timers or transport.

pub mod log;
pub mod raft;
pub mod runtime;
pub mod timer;

pub use log::RaftLog;
pub use raft::{Outgoing, RaftNode, Step};
pub use runtime::{CommitResult, ConsensusHandle, ConsensusRuntime, GroupStatus};

use hive_bus::BusError;
use hive_protocol::{AgentId, Term};
use hive_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The node is not the leader; redirect to `leader` if known.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<AgentId> },

    /// The submitted entry was not majority-acknowledged in time. It may
    /// still commit later; retry with the same request id.
    #[error("command not committed within the timeout")]
    CommitTimeout,

    /// A reply from a newer term forced this node to step down.
    #[error("stale term {observed}, current term is {current}")]
    StaleTerm { observed: Term, current: Term },

    /// The persisted log violates log matching (gap, or a conflicting
    /// entry at a committed index). The group halts rather than serve.
    #[error("corrupt replicated log: {0}")]
    CorruptLog(String),

    /// The consensus runtime for this swarm is not running.
    #[error("consensus group is not running")]
    NotRunning,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ConsensusError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
