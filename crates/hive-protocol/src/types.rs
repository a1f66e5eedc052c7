//! Core identifiers and the persisted record types.
//!
//! These are the durable contract of the coordination core: a restarted
//! node reconstructs its consensus state purely from the persisted
//! `ConsensusGroupRecord` plus its `LogEntry` rows.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants;
use crate::error::ProtocolError;

/// Logical epoch number in Raft-style consensus. Monotonically increasing.
pub type Term = u64;

/// Position of an entry in a replicated log. 1-based; 0 means "no entries".
pub type LogIndex = u64;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a swarm (a named group of agents).
    SwarmId
);
uuid_id!(
    /// Identifier of a one-shot quorum vote.
    VoteId
);
uuid_id!(
    /// Identifier of a message on the bus.
    MessageId
);
uuid_id!(
    /// Identifier of an event log entry.
    EventId
);
uuid_id!(
    /// Identifier of a consensus group.
    GroupId
);
uuid_id!(
    /// Client-supplied request id used to deduplicate command submissions.
    RequestId
);

// ---------------------------------------------------------------------------
// Swarm
// ---------------------------------------------------------------------------

/// Consensus protocol configured for a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusProtocol {
    /// Raft with one vote per active voter.
    Raft,
    /// Raft with elections decided by summed `vote_weight`.
    WeightedRaft,
}

/// Configuration supplied when a collaborator creates a swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub name: String,
    pub protocol: ConsensusProtocol,
    /// Required quorum fraction for ad-hoc votes, in (0, 1].
    pub voting_threshold: f64,
    pub max_members: u32,
    /// Election timeout is drawn uniformly from this range per attempt.
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// A member that fails to heartbeat within this window goes inactive.
    pub health_check_interval_ms: u64,
}

impl SwarmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: ConsensusProtocol::Raft,
            voting_threshold: constants::DEFAULT_VOTING_THRESHOLD,
            max_members: constants::DEFAULT_MAX_MEMBERS,
            election_timeout_min_ms: constants::DEFAULT_ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: constants::DEFAULT_ELECTION_TIMEOUT_MAX_MS,
            heartbeat_interval_ms: constants::DEFAULT_HEARTBEAT_INTERVAL_MS,
            health_check_interval_ms: constants::DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        }
    }

    /// Validate the configured invariants: `voting_threshold` in (0, 1],
    /// `max_members` >= 1, and a non-empty election timeout range above the
    /// heartbeat interval.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(self.voting_threshold > 0.0 && self.voting_threshold <= 1.0) {
            return Err(ProtocolError::InvalidConfig(format!(
                "voting_threshold must be in (0, 1], got {}",
                self.voting_threshold
            )));
        }
        if self.max_members < 1 {
            return Err(ProtocolError::InvalidConfig(
                "max_members must be at least 1".into(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(ProtocolError::InvalidConfig(format!(
                "election timeout range is empty: {}..{}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err(ProtocolError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the minimum election timeout {}ms",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        Ok(())
    }
}

/// A named group of agents. Deactivated (not hard-deleted) when retired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Swarm {
    pub id: SwarmId,
    pub config: SwarmConfig,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Swarm {
    pub fn new(config: SwarmConfig) -> Result<Self, ProtocolError> {
        config.validate()?;
        Ok(Self {
            id: SwarmId::new(),
            config,
            active: true,
            created_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Leader,
    Follower,
    Candidate,
    /// Observers receive traffic but never count toward quorum.
    Observer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Inactive,
    Suspended,
    Banned,
}

/// A (swarm, agent) pair. Created on join, updated on heartbeat or role
/// change, never hard-deleted (history retained for audit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub swarm_id: SwarmId,
    pub agent_id: AgentId,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub vote_weight: f64,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(swarm_id: SwarmId, agent_id: AgentId) -> Self {
        let now = Utc::now();
        Self {
            swarm_id,
            agent_id,
            role: MemberRole::Follower,
            status: MemberStatus::Active,
            vote_weight: constants::DEFAULT_VOTE_WEIGHT,
            joined_at: now,
            last_seen_at: now,
        }
    }

    /// An active non-observer counts toward quorum.
    pub fn is_voter(&self) -> bool {
        self.status == MemberStatus::Active && self.role != MemberRole::Observer
    }
}

// ---------------------------------------------------------------------------
// Consensus group and log
// ---------------------------------------------------------------------------

/// Role of a node within its consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    Leader,
    Follower,
    Candidate,
}

/// Durable Raft state for one consensus group. `current_term`, `voted_for`,
/// and the log are the minimum state a restarted node needs; the commit and
/// applied indexes are persisted for faster recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusGroupRecord {
    pub group_id: GroupId,
    pub swarm_id: SwarmId,
    pub current_term: Term,
    pub voted_for: Option<AgentId>,
    pub commit_index: LogIndex,
    pub last_applied_index: LogIndex,
    pub leader: Option<AgentId>,
    pub state: GroupState,
}

impl ConsensusGroupRecord {
    pub fn new(swarm_id: SwarmId) -> Self {
        Self {
            group_id: GroupId::new(),
            swarm_id,
            current_term: 0,
            voted_for: None,
            commit_index: 0,
            last_applied_index: 0,
            leader: None,
            state: GroupState::Follower,
        }
    }
}

/// Replicated command. Tagged union over the known command types, with an
/// opaque escape hatch for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command_type", content = "command_data", rename_all = "snake_case")]
pub enum Command {
    /// Set a key in the swarm's replicated key-value state.
    SetState {
        key: String,
        value: serde_json::Value,
    },
    /// Durably record a role change for a member.
    MembershipChange { agent: AgentId, role: MemberRole },
    /// Adjust swarm configuration through the replicated log.
    ConfigChange {
        voting_threshold: Option<f64>,
        max_members: Option<u32>,
    },
    /// Unknown command type carried as opaque bytes.
    Opaque { type_tag: String, payload: Vec<u8> },
}

/// Immutable log entry, identified by `(group, term, index)`. Once committed
/// at a given `(term, index)` the payload never changes (log matching).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// Vote / VoteResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStrategy {
    /// Plurality of responses wins.
    SimpleMajority,
    /// An option wins only with at least the super-majority fraction.
    SuperMajority,
    /// Options accumulate the `vote_weight` of their supporters.
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Open,
    Closed,
    Cancelled,
    Executed,
}

/// Outcome recorded when a vote closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteResult {
    Winner { option: String },
    NoQuorum,
}

/// A one-shot proposal with an option set. Independent of the replicated
/// log; used for decisions that need no durable ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub swarm_id: SwarmId,
    pub options: Vec<String>,
    pub strategy: VoteStrategy,
    /// Required participation fraction in (0, 1].
    pub quorum: f64,
    pub status: VoteStatus,
    pub opened_by: Option<AgentId>,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub result: Option<VoteResult>,
}

/// One option-selection per (vote, agent). Immutable once cast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote_id: VoteId,
    pub agent_id: AgentId,
    pub option: String,
    pub confidence: Option<f64>,
    pub rationale: Option<String>,
    pub cast_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// A unit of bus traffic. Delivery and read flags are monotonic: once set
/// they are never reset, and `read` implies `delivered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: String,
    /// None for system-originated messages.
    pub sender: Option<AgentId>,
    /// None means broadcast to every subscriber on the channel.
    pub recipient: Option<AgentId>,
    pub content: serde_json::Value,
    pub priority: MessagePriority,
    pub published_at: DateTime<Utc>,
    /// None means the message never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Whether this message may be handed to the given subscriber.
    pub fn addressed_to(&self, agent: &AgentId) -> bool {
        match &self.recipient {
            Some(recipient) => recipient == agent,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Append-only occurrence record consumed by the observability collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub swarm_id: SwarmId,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub source: Option<AgentId>,
    pub is_global: bool,
    pub occurred_at: DateTime<Utc>,
    /// Ordered list of agents that forwarded this event.
    pub propagation_path: Vec<AgentId>,
    /// Agents that already handled this event; prevents reprocessing loops.
    pub processed_by: BTreeSet<AgentId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swarm_config_defaults_are_valid() {
        let config = SwarmConfig::new("alpha");
        assert!(config.validate().is_ok());
        assert!((config.voting_threshold - 0.51).abs() < f64::EPSILON);
    }

    #[test]
    fn test_swarm_config_rejects_bad_threshold() {
        let mut config = SwarmConfig::new("alpha");
        config.voting_threshold = 0.0;
        assert!(config.validate().is_err());
        config.voting_threshold = 1.5;
        assert!(config.validate().is_err());
        config.voting_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_swarm_config_rejects_zero_members() {
        let mut config = SwarmConfig::new("alpha");
        config.max_members = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_observer_is_not_a_voter() {
        let mut m = Membership::new(SwarmId::new(), AgentId::new("a1"));
        assert!(m.is_voter());
        m.role = MemberRole::Observer;
        assert!(!m.is_voter());
        m.role = MemberRole::Follower;
        m.status = MemberStatus::Suspended;
        assert!(!m.is_voter());
    }

    #[test]
    fn test_command_round_trips_with_type_tag() {
        let cmd = Command::SetState {
            key: "task".into(),
            value: serde_json::json!({"assignee": "a1"}),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command_type"], "set_state");
        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_opaque_command_carries_unknown_payloads() {
        let cmd = Command::Opaque {
            type_tag: "future_thing".into(),
            payload: vec![1, 2, 3],
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_message_expiry_and_addressing() {
        let now = Utc::now();
        let mut msg = Message {
            id: MessageId::new(),
            channel: "tasks".into(),
            sender: None,
            recipient: None,
            content: serde_json::json!("hello"),
            priority: MessagePriority::Normal,
            published_at: now,
            expires_at: Some(now),
            delivered: false,
            delivered_at: None,
            read: false,
            read_at: None,
        };
        // ttl=0 expires at publish time.
        assert!(msg.is_expired(now));

        msg.expires_at = None;
        assert!(!msg.is_expired(now));

        let a1 = AgentId::new("a1");
        let a2 = AgentId::new("a2");
        assert!(msg.addressed_to(&a1));
        msg.recipient = Some(a2.clone());
        assert!(!msg.addressed_to(&a1));
        assert!(msg.addressed_to(&a2));
    }
}
