//! The coordination facade tying the Hive subsystems together.
//!
//! A [`SwarmCoordinator`] represents one agent's view of the system: its
//! membership registry, its consensus groups, the vote coordinator, and
//! the shared message bus and event log. Several coordinators wired to
//! the same bus form a cluster; each keeps its own durable store.

pub mod config;
pub mod coordinator;

pub use config::CoordinatorConfig;
pub use coordinator::{SwarmCoordinator, SwarmStatus};

use hive_bus::BusError;
use hive_consensus::ConsensusError;
use hive_membership::MembershipError;
use hive_protocol::{ProtocolError, SwarmId};
use hive_state::StateError;
use hive_voting::VoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// No consensus group is running for this swarm on this node.
    #[error("not a member of swarm {0}")]
    NotJoined(SwarmId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Vote(#[from] VoteError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}
