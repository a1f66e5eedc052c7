//! Protocol constants and defaults.

use crate::types::SwarmId;

/// Default quorum fraction for ad-hoc votes.
pub const DEFAULT_VOTING_THRESHOLD: f64 = 0.51;

/// Fraction an option needs under the super-majority strategy.
pub const SUPER_MAJORITY_FRACTION: f64 = 2.0 / 3.0;

/// Default vote weight assigned to a new member.
pub const DEFAULT_VOTE_WEIGHT: f64 = 1.0;

/// Default cap on active members per swarm.
pub const DEFAULT_MAX_MEMBERS: u32 = 64;

/// Election timeout range a follower waits before standing as candidate.
pub const DEFAULT_ELECTION_TIMEOUT_MIN_MS: u64 = 1_500;
pub const DEFAULT_ELECTION_TIMEOUT_MAX_MS: u64 = 3_000;

/// Interval between leader heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// A member that fails to heartbeat within this window goes inactive.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;

/// How long a submitted command may wait for majority acknowledgment.
pub const DEFAULT_COMMIT_TIMEOUT_MS: u64 = 5_000;

/// TTL applied to Raft RPC messages on the bus; a consensus message this
/// stale is useless and must not be replayed to late subscribers.
pub const CONSENSUS_MESSAGE_TTL_SECS: i64 = 30;

/// Default TTL for ad-hoc votes.
pub const DEFAULT_VOTE_TTL_SECS: i64 = 60;

/// Bus channel carrying Raft RPC traffic for one swarm.
pub fn consensus_channel(swarm_id: &SwarmId) -> String {
    format!("hive.consensus.{swarm_id}")
}

/// Bus channel carrying swarm-wide chatter for one swarm.
pub fn swarm_channel(swarm_id: &SwarmId) -> String {
    format!("hive.swarm.{swarm_id}")
}
