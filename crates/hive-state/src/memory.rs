//! In-memory store, used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use hive_protocol::{
    ConsensusGroupRecord, Event, LogEntry, LogIndex, Membership, Message, Swarm, SwarmId, Vote,
    VoteId, VoteResponse,
};

use crate::store::SwarmStore;
use crate::StateError;

#[derive(Default)]
struct Inner {
    swarms: HashMap<SwarmId, Swarm>,
    memberships: HashMap<SwarmId, HashMap<String, Membership>>,
    groups: HashMap<SwarmId, ConsensusGroupRecord>,
    logs: HashMap<SwarmId, Vec<LogEntry>>,
    votes: HashMap<SwarmId, Vec<Vote>>,
    vote_responses: Vec<VoteResponse>,
    messages: HashMap<String, Vec<Message>>,
    events: HashMap<SwarmId, Vec<Event>>,
}

/// Everything behind one mutex; writes here are tiny and rare relative to
/// consensus message traffic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwarmStore for MemoryStore {
    fn save_swarm(&self, swarm: &Swarm) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.swarms.insert(swarm.id, swarm.clone());
        Ok(())
    }

    fn load_swarms(&self) -> Result<Vec<Swarm>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.swarms.values().cloned().collect())
    }

    fn save_membership(&self, membership: &Membership) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .memberships
            .entry(membership.swarm_id)
            .or_default()
            .insert(membership.agent_id.to_string(), membership.clone());
        Ok(())
    }

    fn load_memberships(&self, swarm_id: &SwarmId) -> Result<Vec<Membership>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .memberships
            .get(swarm_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    fn save_group(&self, group: &ConsensusGroupRecord) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.groups.insert(group.swarm_id, group.clone());
        Ok(())
    }

    fn load_group(&self, swarm_id: &SwarmId) -> Result<Option<ConsensusGroupRecord>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.groups.get(swarm_id).cloned())
    }

    fn append_log_entries(
        &self,
        swarm_id: &SwarmId,
        entries: &[LogEntry],
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner
            .logs
            .entry(*swarm_id)
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    fn truncate_log_from(&self, swarm_id: &SwarmId, from: LogIndex) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(log) = inner.logs.get_mut(swarm_id) {
            log.retain(|e| e.index < from);
        }
        Ok(())
    }

    fn load_log(&self, swarm_id: &SwarmId) -> Result<Vec<LogEntry>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.logs.get(swarm_id).cloned().unwrap_or_default())
    }

    fn save_vote(&self, vote: &Vote) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        let votes = inner.votes.entry(vote.swarm_id).or_default();
        match votes.iter_mut().find(|v| v.id == vote.id) {
            Some(existing) => *existing = vote.clone(),
            None => votes.push(vote.clone()),
        }
        Ok(())
    }

    fn save_vote_response(&self, response: &VoteResponse) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.vote_responses.push(response.clone());
        Ok(())
    }

    fn load_votes(&self, swarm_id: &SwarmId) -> Result<Vec<Vote>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.votes.get(swarm_id).cloned().unwrap_or_default())
    }

    fn load_vote_responses(&self, vote_id: &VoteId) -> Result<Vec<VoteResponse>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .vote_responses
            .iter()
            .filter(|r| r.vote_id == *vote_id)
            .cloned()
            .collect())
    }

    fn save_message(&self, message: &Message) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        let messages = inner.messages.entry(message.channel.clone()).or_default();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        Ok(())
    }

    fn load_messages(&self, channel: &str) -> Result<Vec<Message>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.messages.get(channel).cloned().unwrap_or_default())
    }

    fn load_all_messages(&self) -> Result<Vec<Message>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.messages.values().flatten().cloned().collect())
    }

    fn save_event(&self, event: &Event) -> Result<(), StateError> {
        let mut inner = self.inner.lock().expect("store lock");
        let events = inner.events.entry(event.swarm_id).or_default();
        match events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => events.push(event.clone()),
        }
        Ok(())
    }

    fn load_events(&self, swarm_id: &SwarmId) -> Result<Vec<Event>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.events.get(swarm_id).cloned().unwrap_or_default())
    }

    fn load_all_events(&self) -> Result<Vec<Event>, StateError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.events.values().flatten().cloned().collect())
    }
}
