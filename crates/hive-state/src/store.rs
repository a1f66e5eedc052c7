//! The `SwarmStore` trait and shared log-integrity checks.

use hive_protocol::{
    ConsensusGroupRecord, Event, LogEntry, LogIndex, Membership, Message, Swarm, SwarmId, Vote,
    VoteId, VoteResponse,
};

use crate::StateError;

/// Durable storage contract for the six logical records.
///
/// Implementations must make `append_log_entries` + `load_log` round-trip
/// exactly: entries come back in index order with identical payloads.
pub trait SwarmStore: Send + Sync {
    // Swarm
    fn save_swarm(&self, swarm: &Swarm) -> Result<(), StateError>;
    fn load_swarms(&self) -> Result<Vec<Swarm>, StateError>;

    // Membership
    fn save_membership(&self, membership: &Membership) -> Result<(), StateError>;
    fn load_memberships(&self, swarm_id: &SwarmId) -> Result<Vec<Membership>, StateError>;

    // Consensus group + log
    fn save_group(&self, group: &ConsensusGroupRecord) -> Result<(), StateError>;
    fn load_group(&self, swarm_id: &SwarmId) -> Result<Option<ConsensusGroupRecord>, StateError>;
    fn append_log_entries(&self, swarm_id: &SwarmId, entries: &[LogEntry])
        -> Result<(), StateError>;
    /// Remove entries with `index >= from` (follower conflict truncation).
    fn truncate_log_from(&self, swarm_id: &SwarmId, from: LogIndex) -> Result<(), StateError>;
    fn load_log(&self, swarm_id: &SwarmId) -> Result<Vec<LogEntry>, StateError>;

    // Votes
    fn save_vote(&self, vote: &Vote) -> Result<(), StateError>;
    fn save_vote_response(&self, response: &VoteResponse) -> Result<(), StateError>;
    fn load_votes(&self, swarm_id: &SwarmId) -> Result<Vec<Vote>, StateError>;
    fn load_vote_responses(&self, vote_id: &VoteId) -> Result<Vec<VoteResponse>, StateError>;

    // Messages
    fn save_message(&self, message: &Message) -> Result<(), StateError>;
    fn load_messages(&self, channel: &str) -> Result<Vec<Message>, StateError>;
    /// Every persisted message across all channels, for restart hydration.
    fn load_all_messages(&self) -> Result<Vec<Message>, StateError>;

    // Events
    fn save_event(&self, event: &Event) -> Result<(), StateError>;
    fn load_events(&self, swarm_id: &SwarmId) -> Result<Vec<Event>, StateError>;
    /// Every persisted event across all swarms, for restart hydration.
    fn load_all_events(&self) -> Result<Vec<Event>, StateError>;
}

/// Structural integrity check for a loaded log.
///
/// Verifies that indexes are contiguous from 1 and that terms never
/// decrease. A violation at or below `commit_index` is unrecoverable: it
/// breaks log matching, so the affected group must halt rather than serve.
pub fn verify_log(entries: &[LogEntry], commit_index: LogIndex) -> Result<(), StateError> {
    let mut prev_term = 0;
    for (i, entry) in entries.iter().enumerate() {
        let expected_index = i as LogIndex + 1;
        if entry.index != expected_index {
            return Err(StateError::Corrupt(format!(
                "log gap: expected index {expected_index}, found {}",
                entry.index
            )));
        }
        if entry.term < prev_term {
            return Err(StateError::Corrupt(format!(
                "term regression at index {}: {} after {prev_term}",
                entry.index, entry.term
            )));
        }
        prev_term = entry.term;
    }
    if commit_index > entries.len() as LogIndex {
        return Err(StateError::Corrupt(format!(
            "commit index {commit_index} beyond last entry {}",
            entries.len()
        )));
    }
    Ok(())
}
