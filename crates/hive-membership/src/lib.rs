//! Membership registry for the Hive coordination core.
//!
//! Tracks which agents belong to which swarm, their role and liveness,
//! independent of consensus state. The consensus engine and the voting
//! coordinator both read the active-voter set from here and share the
//! quorum math in [`quorum`].

pub mod quorum;
pub mod registry;

pub use quorum::{majority_count, QuorumSpec, VoterInfo};
pub use registry::{MembershipRegistry, SweptMember};

use hive_protocol::{AgentId, SwarmId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("swarm {swarm_id} is at capacity ({max} active members)")]
    CapacityExceeded { swarm_id: SwarmId, max: u32 },

    #[error("unknown swarm {0}")]
    UnknownSwarm(SwarmId),

    #[error("agent {agent} is not a member of swarm {swarm_id}")]
    NotAMember { swarm_id: SwarmId, agent: AgentId },

    #[error("swarm {0} is not active")]
    SwarmInactive(SwarmId),
}
