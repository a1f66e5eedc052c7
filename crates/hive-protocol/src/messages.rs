//! Raft RPC messages carried over the message bus.
//!
//! No wire format is mandated by the coordination core; these are the
//! logical RPCs. The consensus runtime serializes an envelope to JSON and
//! publishes it on the swarm's consensus channel; any transport honoring
//! per-channel ordering and at-least-once delivery is conformant.

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, LogEntry, LogIndex, SwarmId, Term};

/// A candidate asking for a vote in a new term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate: AgentId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub voter: AgentId,
    pub granted: bool,
}

/// Leader heartbeat and log replication. Empty `entries` is a pure
/// heartbeat; a follower resets its election timer on any valid one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader: AgentId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub follower: AgentId,
    pub success: bool,
    /// Highest index known replicated on the follower when `success`.
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum RaftMessage {
    RequestVote(RequestVote),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntries),
    AppendEntriesReply(AppendEntriesReply),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteReply(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesReply(m) => m.term,
        }
    }
}

/// Envelope published on the consensus channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftEnvelope {
    pub swarm_id: SwarmId,
    pub from: AgentId,
    /// None broadcasts to every node in the group.
    pub to: Option<AgentId>,
    pub message: RaftMessage,
}
