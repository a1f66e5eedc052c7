//! The collaborator-facing facade.
//!
//! One `SwarmCoordinator` is one agent's node: it owns the membership
//! registry and vote coordinator, runs one consensus group per joined
//! swarm, and shares the message bus and event log with the rest of the
//! cluster. All async locking follows the same rule: collect what the
//! critical section needs, drop the lock, then await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hive_bus::{EventLog, MessageBus, Subscription};
use hive_consensus::{CommitResult, ConsensusHandle, ConsensusRuntime};
use hive_membership::{MembershipRegistry, VoterInfo};
use hive_protocol::{
    swarm_channel, AgentId, Command, Event, EventId, GroupState, LogIndex, Membership, Message,
    MessageId, MessagePriority, RequestId, Swarm, SwarmConfig, SwarmId, Term, Vote, VoteId,
    VoteResponse, VoteStatus, VoteStrategy,
};
use hive_state::SwarmStore;
use hive_voting::{TallyOutcome, VoteCoordinator};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::CoordinatorError;

/// Snapshot of one swarm as seen from this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub swarm_id: SwarmId,
    pub name: String,
    pub active: bool,
    pub member_count: usize,
    /// Consensus fields are absent when this node runs no group for the
    /// swarm (not joined, or group halted).
    pub state: Option<GroupState>,
    pub term: Option<Term>,
    pub leader: Option<AgentId>,
    pub commit_index: Option<LogIndex>,
}

struct Inner {
    local: AgentId,
    config: CoordinatorConfig,
    registry: RwLock<MembershipRegistry>,
    votes: RwLock<VoteCoordinator>,
    groups: RwLock<HashMap<SwarmId, ConsensusHandle>>,
    bus: MessageBus,
    events: EventLog,
    store: Arc<dyn SwarmStore>,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SwarmCoordinator {
    inner: Arc<Inner>,
}

impl SwarmCoordinator {
    /// Build a coordinator, restore persisted swarms and memberships, and
    /// start the background sweep.
    pub async fn start(
        local: AgentId,
        config: CoordinatorConfig,
        bus: MessageBus,
        events: EventLog,
        store: Arc<dyn SwarmStore>,
    ) -> Result<Self, CoordinatorError> {
        let coordinator = Self {
            inner: Arc::new(Inner {
                local,
                config,
                registry: RwLock::new(MembershipRegistry::new()),
                votes: RwLock::new(VoteCoordinator::new()),
                groups: RwLock::new(HashMap::new()),
                bus,
                events,
                store,
                sweeper: std::sync::Mutex::new(None),
            }),
        };
        coordinator.restore().await?;
        coordinator.start_sweeper();
        Ok(coordinator)
    }

    pub fn local_agent(&self) -> &AgentId {
        &self.inner.local
    }

    /// Reload persisted swarms, memberships, and votes, restarting
    /// consensus groups for swarms this agent is an active member of.
    async fn restore(&self) -> Result<(), CoordinatorError> {
        let swarms = self.inner.store.load_swarms()?;
        for swarm in swarms {
            let swarm_id = swarm.id;
            let memberships = self.inner.store.load_memberships(&swarm_id)?;
            let rejoin = {
                let mut registry = self.inner.registry.write().await;
                registry.register_swarm(swarm.clone());
                registry.restore_memberships(&swarm_id, memberships.clone())?;
                memberships
                    .iter()
                    .any(|m| m.agent_id == self.inner.local && m.is_voter())
            };

            let mut persisted = Vec::new();
            for vote in self.inner.store.load_votes(&swarm_id)? {
                let responses = self.inner.store.load_vote_responses(&vote.id)?;
                persisted.push((vote, responses));
            }
            if !persisted.is_empty() {
                let mut votes = self.inner.votes.write().await;
                for (vote, responses) in persisted {
                    votes.restore(vote, responses);
                }
            }

            if rejoin && swarm.active {
                info!(swarm_id = %swarm_id, "restoring consensus group");
                self.ensure_group(&swarm).await?;
            }
        }
        Ok(())
    }

    // ---- swarms and membership -------------------------------------

    /// Create a swarm, join it as its first member, and start its
    /// consensus group.
    pub async fn create_swarm(&self, config: SwarmConfig) -> Result<Swarm, CoordinatorError> {
        let swarm = Swarm::new(config)?;
        self.inner.store.save_swarm(&swarm)?;
        {
            let mut registry = self.inner.registry.write().await;
            registry.register_swarm(swarm.clone());
        }
        info!(swarm_id = %swarm.id, name = %swarm.config.name, "swarm created");
        self.inner
            .events
            .emit(
                swarm.id,
                "swarm.created",
                serde_json::json!({ "name": swarm.config.name }),
                Some(self.inner.local.clone()),
                true,
            )
            .await?;
        self.join_swarm(&swarm.id, self.inner.local.clone()).await?;
        Ok(swarm)
    }

    /// Adopt a swarm created by another node so local agents can join it.
    pub async fn register_swarm(&self, swarm: Swarm) -> Result<(), CoordinatorError> {
        self.inner.store.save_swarm(&swarm)?;
        let mut registry = self.inner.registry.write().await;
        registry.register_swarm(swarm);
        Ok(())
    }

    /// Deactivate a swarm and stop its consensus group.
    pub async fn deactivate_swarm(&self, swarm_id: &SwarmId) -> Result<(), CoordinatorError> {
        let swarm = {
            let mut registry = self.inner.registry.write().await;
            registry.deactivate_swarm(swarm_id)?;
            registry.swarm(swarm_id)?.clone()
        };
        self.inner.store.save_swarm(&swarm)?;
        if let Some(handle) = self.inner.groups.write().await.remove(swarm_id) {
            handle.shutdown();
        }
        info!(swarm_id = %swarm_id, "swarm deactivated");
        Ok(())
    }

    /// Join `agent` to the swarm. Joining the local agent starts the
    /// swarm's consensus group on this node.
    pub async fn join_swarm(
        &self,
        swarm_id: &SwarmId,
        agent: AgentId,
    ) -> Result<Membership, CoordinatorError> {
        let (membership, swarm, voters) = {
            let mut registry = self.inner.registry.write().await;
            let membership = registry.join(swarm_id, agent.clone())?;
            let swarm = registry.swarm(swarm_id)?.clone();
            let voters = registry.list_active_voters(swarm_id)?;
            (membership, swarm, voters)
        };
        self.inner.store.save_membership(&membership)?;
        self.inner
            .events
            .emit(
                *swarm_id,
                "membership.joined",
                serde_json::json!({ "agent": agent.as_str() }),
                Some(self.inner.local.clone()),
                false,
            )
            .await?;

        if agent == self.inner.local {
            self.ensure_group(&swarm).await?;
        }
        self.sync_voters(swarm_id, voters).await;
        Ok(membership)
    }

    /// Remove `agent` from the swarm. A departing leader triggers an
    /// immediate election; the local agent leaving stops the group.
    pub async fn leave_swarm(
        &self,
        swarm_id: &SwarmId,
        agent: &AgentId,
    ) -> Result<(), CoordinatorError> {
        let (was_leader, membership, voters) = {
            let mut registry = self.inner.registry.write().await;
            let was_leader = registry.leave(swarm_id, agent)?;
            let membership = registry.membership(swarm_id, agent)?.clone();
            let voters = registry.list_active_voters(swarm_id)?;
            (was_leader, membership, voters)
        };
        self.inner.store.save_membership(&membership)?;
        self.inner
            .events
            .emit(
                *swarm_id,
                "membership.left",
                serde_json::json!({ "agent": agent.as_str(), "was_leader": was_leader }),
                Some(self.inner.local.clone()),
                false,
            )
            .await?;

        if agent == &self.inner.local {
            if let Some(handle) = self.inner.groups.write().await.remove(swarm_id) {
                handle.shutdown();
            }
        } else {
            self.sync_voters(swarm_id, voters).await;
            if was_leader {
                self.trigger_election(swarm_id).await;
            }
        }
        Ok(())
    }

    /// Refresh an agent's liveness window.
    pub async fn heartbeat(
        &self,
        swarm_id: &SwarmId,
        agent: &AgentId,
    ) -> Result<(), CoordinatorError> {
        let mut registry = self.inner.registry.write().await;
        registry.heartbeat(swarm_id, agent)?;
        Ok(())
    }

    pub async fn set_vote_weight(
        &self,
        swarm_id: &SwarmId,
        agent: &AgentId,
        weight: f64,
    ) -> Result<(), CoordinatorError> {
        let (membership, voters) = {
            let mut registry = self.inner.registry.write().await;
            registry.set_vote_weight(swarm_id, agent, weight)?;
            let membership = registry.membership(swarm_id, agent)?.clone();
            let voters = registry.list_active_voters(swarm_id)?;
            (membership, voters)
        };
        self.inner.store.save_membership(&membership)?;
        self.sync_voters(swarm_id, voters).await;
        Ok(())
    }

    pub async fn memberships(
        &self,
        swarm_id: &SwarmId,
    ) -> Result<Vec<Membership>, CoordinatorError> {
        let registry = self.inner.registry.read().await;
        Ok(registry.memberships(swarm_id)?)
    }

    // ---- consensus --------------------------------------------------

    /// Submit a command to the swarm's replicated log and wait for
    /// commit. Pass the same `request_id` when retrying after a timeout;
    /// submission is idempotent on it.
    pub async fn submit_command(
        &self,
        swarm_id: &SwarmId,
        command: Command,
        request_id: Option<RequestId>,
    ) -> Result<CommitResult, CoordinatorError> {
        let handle = self.group(swarm_id).await?;
        let result = handle
            .submit(
                request_id.unwrap_or_else(RequestId::new),
                command,
                Duration::from_millis(self.inner.config.commit_timeout_ms),
            )
            .await?;
        Ok(result)
    }

    /// Committed prefix of the swarm's replicated log.
    pub async fn committed_log(
        &self,
        swarm_id: &SwarmId,
    ) -> Result<Vec<hive_protocol::LogEntry>, CoordinatorError> {
        let handle = self.group(swarm_id).await?;
        let status = handle.status().await?;
        let entries = self.inner.store.load_log(swarm_id)?;
        Ok(entries
            .into_iter()
            .take_while(|e| e.index <= status.commit_index)
            .collect())
    }

    pub async fn swarm_status(&self, swarm_id: &SwarmId) -> Result<SwarmStatus, CoordinatorError> {
        let (swarm, member_count) = {
            let registry = self.inner.registry.read().await;
            (
                registry.swarm(swarm_id)?.clone(),
                registry.active_member_count(swarm_id)?,
            )
        };
        let group = {
            let groups = self.inner.groups.read().await;
            groups.get(swarm_id).cloned()
        };
        let status = match group {
            Some(handle) => handle.status().await.ok(),
            None => None,
        };
        Ok(SwarmStatus {
            swarm_id: *swarm_id,
            name: swarm.config.name,
            active: swarm.active,
            member_count,
            state: status.as_ref().map(|s| s.state),
            term: status.as_ref().map(|s| s.term),
            leader: status.as_ref().and_then(|s| s.leader.clone()),
            commit_index: status.as_ref().map(|s| s.commit_index),
        })
    }

    async fn ensure_group(&self, swarm: &Swarm) -> Result<(), CoordinatorError> {
        {
            let groups = self.inner.groups.read().await;
            if groups.contains_key(&swarm.id) {
                return Ok(());
            }
        }
        let voters = {
            let registry = self.inner.registry.read().await;
            registry.list_active_voters(&swarm.id)?
        };
        let handle = ConsensusRuntime::spawn(
            swarm.clone(),
            self.inner.local.clone(),
            voters,
            self.inner.bus.clone(),
            self.inner.events.clone(),
            self.inner.store.clone(),
        )
        .await?;
        self.inner.groups.write().await.insert(swarm.id, handle);
        Ok(())
    }

    async fn group(&self, swarm_id: &SwarmId) -> Result<ConsensusHandle, CoordinatorError> {
        let groups = self.inner.groups.read().await;
        groups
            .get(swarm_id)
            .cloned()
            .ok_or(CoordinatorError::NotJoined(*swarm_id))
    }

    async fn sync_voters(&self, swarm_id: &SwarmId, voters: Vec<VoterInfo>) {
        let groups = self.inner.groups.read().await;
        if let Some(handle) = groups.get(swarm_id) {
            if handle.update_voters(voters).is_err() {
                warn!(swarm_id = %swarm_id, "consensus group gone while updating voters");
            }
        }
    }

    async fn trigger_election(&self, swarm_id: &SwarmId) {
        let groups = self.inner.groups.read().await;
        if let Some(handle) = groups.get(swarm_id) {
            let _ = handle.trigger_election();
        }
    }

    // ---- voting -----------------------------------------------------

    /// Open a vote. Quorum defaults to the swarm's voting threshold and
    /// TTL to the configured default.
    pub async fn open_vote(
        &self,
        swarm_id: &SwarmId,
        options: Vec<String>,
        strategy: VoteStrategy,
        quorum: Option<f64>,
        ttl_secs: Option<i64>,
        opened_by: Option<AgentId>,
    ) -> Result<Vote, CoordinatorError> {
        let threshold = {
            let registry = self.inner.registry.read().await;
            registry.swarm(swarm_id)?.config.voting_threshold
        };
        let vote = {
            let mut votes = self.inner.votes.write().await;
            votes.open_vote(
                *swarm_id,
                options,
                strategy,
                quorum.unwrap_or(threshold),
                ttl_secs.unwrap_or(self.inner.config.default_vote_ttl_secs),
                opened_by,
            )?
        };
        self.inner.store.save_vote(&vote)?;
        self.inner
            .events
            .emit(
                *swarm_id,
                "vote.opened",
                serde_json::json!({ "vote_id": vote.id, "options": vote.options }),
                Some(self.inner.local.clone()),
                false,
            )
            .await?;
        Ok(vote)
    }

    /// Cast one response, returning the running tally. A response that
    /// produces a winner closes the vote.
    pub async fn cast_vote(
        &self,
        vote_id: &VoteId,
        agent: AgentId,
        option: &str,
        confidence: Option<f64>,
        rationale: Option<String>,
    ) -> Result<TallyOutcome, CoordinatorError> {
        let swarm_id = {
            let votes = self.inner.votes.read().await;
            votes.vote(vote_id)?.swarm_id
        };
        let voters = {
            let registry = self.inner.registry.read().await;
            registry.list_active_voters(&swarm_id)?
        };
        let (outcome, vote, response) = {
            let mut votes = self.inner.votes.write().await;
            let outcome = votes.cast(vote_id, agent.clone(), option, confidence, rationale, &voters)?;
            let vote = votes.vote(vote_id)?.clone();
            let response = votes
                .responses(vote_id)?
                .into_iter()
                .find(|r| r.agent_id == agent);
            (outcome, vote, response)
        };
        if let Some(response) = response {
            self.inner.store.save_vote_response(&response)?;
        }
        self.inner.store.save_vote(&vote)?;
        if vote.status == VoteStatus::Closed {
            self.inner
                .events
                .emit(
                    swarm_id,
                    "vote.closed",
                    serde_json::json!({ "vote_id": vote.id, "result": vote.result }),
                    Some(self.inner.local.clone()),
                    false,
                )
                .await?;
        }
        Ok(outcome)
    }

    pub async fn cancel_vote(&self, vote_id: &VoteId) -> Result<Vote, CoordinatorError> {
        let vote = {
            let mut votes = self.inner.votes.write().await;
            votes.cancel(vote_id)?
        };
        self.inner.store.save_vote(&vote)?;
        Ok(vote)
    }

    /// Mark a closed, winning vote as acted upon.
    pub async fn mark_vote_executed(&self, vote_id: &VoteId) -> Result<Vote, CoordinatorError> {
        let vote = {
            let mut votes = self.inner.votes.write().await;
            votes.mark_executed(vote_id)?
        };
        self.inner.store.save_vote(&vote)?;
        Ok(vote)
    }

    pub async fn vote(&self, vote_id: &VoteId) -> Result<Vote, CoordinatorError> {
        let votes = self.inner.votes.read().await;
        Ok(votes.vote(vote_id)?.clone())
    }

    pub async fn vote_responses(
        &self,
        vote_id: &VoteId,
    ) -> Result<Vec<VoteResponse>, CoordinatorError> {
        let votes = self.inner.votes.read().await;
        Ok(votes.responses(vote_id)?)
    }

    // ---- messaging and events --------------------------------------

    /// Publish on a channel as the local agent.
    pub async fn publish(
        &self,
        channel: &str,
        content: serde_json::Value,
        recipient: Option<AgentId>,
        priority: MessagePriority,
        ttl_secs: Option<i64>,
    ) -> Result<Message, CoordinatorError> {
        Ok(self
            .inner
            .bus
            .publish(
                channel,
                content,
                Some(self.inner.local.clone()),
                recipient,
                priority,
                ttl_secs,
            )
            .await?)
    }

    /// Publish on the swarm's general channel.
    pub async fn publish_to_swarm(
        &self,
        swarm_id: &SwarmId,
        content: serde_json::Value,
        priority: MessagePriority,
        ttl_secs: Option<i64>,
    ) -> Result<Message, CoordinatorError> {
        self.publish(&swarm_channel(swarm_id), content, None, priority, ttl_secs)
            .await
    }

    /// Subscribe the local agent to the swarm's general channel.
    pub async fn subscribe_to_swarm(&self, swarm_id: &SwarmId) -> Subscription {
        self.subscribe(&swarm_channel(swarm_id)).await
    }

    pub async fn subscribe(&self, channel: &str) -> Subscription {
        self.inner
            .bus
            .subscribe(channel, self.inner.local.clone())
            .await
    }

    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.inner.bus.unsubscribe(subscription).await;
    }

    pub async fn ack_message(&self, message_id: &MessageId) -> Result<Message, CoordinatorError> {
        Ok(self.inner.bus.ack(message_id, &self.inner.local).await?)
    }

    pub async fn mark_message_read(
        &self,
        message_id: &MessageId,
    ) -> Result<Message, CoordinatorError> {
        Ok(self
            .inner
            .bus
            .mark_read(message_id, &self.inner.local)
            .await?)
    }

    pub async fn emit_event(
        &self,
        swarm_id: &SwarmId,
        event_type: &str,
        event_data: serde_json::Value,
        is_global: bool,
    ) -> Result<Event, CoordinatorError> {
        Ok(self
            .inner
            .events
            .emit(
                *swarm_id,
                event_type,
                event_data,
                Some(self.inner.local.clone()),
                is_global,
            )
            .await?)
    }

    /// Record that the local agent processed and forwarded an event.
    /// Returns false when the agent had already processed it.
    pub async fn propagate_event(
        &self,
        swarm_id: &SwarmId,
        event_id: &EventId,
    ) -> Result<bool, CoordinatorError> {
        Ok(self
            .inner
            .events
            .propagate(swarm_id, event_id, self.inner.local.clone())
            .await?)
    }

    pub async fn events(&self, swarm_id: &SwarmId) -> Vec<Event> {
        self.inner.events.events(swarm_id).await
    }

    pub async fn events_since(
        &self,
        swarm_id: &SwarmId,
        since: chrono::DateTime<Utc>,
    ) -> Vec<Event> {
        self.inner.events.events_since(swarm_id, since).await
    }

    // ---- maintenance ------------------------------------------------

    /// One maintenance pass: sweep stale members, expire due votes, prune
    /// expired messages. The background sweeper calls this on an interval;
    /// tests call it directly.
    pub async fn run_sweep(&self) -> Result<(), CoordinatorError> {
        let now = Utc::now();

        let (swept, voters_by_swarm, swept_memberships) = {
            let mut registry = self.inner.registry.write().await;
            let swept = registry.sweep(now);
            let mut voters_by_swarm = HashMap::new();
            let mut memberships = Vec::new();
            for swarm in registry.swarm_ids() {
                if let Ok(voters) = registry.list_active_voters(&swarm) {
                    voters_by_swarm.insert(swarm, voters);
                }
            }
            for s in &swept {
                if let Ok(m) = registry.membership(&s.swarm_id, &s.agent_id) {
                    memberships.push(m.clone());
                }
            }
            (swept, voters_by_swarm, memberships)
        };

        for membership in &swept_memberships {
            self.inner.store.save_membership(membership)?;
        }
        for s in &swept {
            debug!(swarm_id = %s.swarm_id, agent = %s.agent_id, "swept stale member");
            self.inner
                .events
                .emit(
                    s.swarm_id,
                    "membership.swept",
                    serde_json::json!({ "agent": s.agent_id.as_str(), "was_leader": s.was_leader }),
                    None,
                    false,
                )
                .await?;
            if let Some(voters) = voters_by_swarm.get(&s.swarm_id) {
                self.sync_voters(&s.swarm_id, voters.clone()).await;
            }
            if s.was_leader {
                self.trigger_election(&s.swarm_id).await;
            }
        }

        let expired = {
            let mut votes = self.inner.votes.write().await;
            votes.expire_due(now, |swarm_id| {
                voters_by_swarm.get(swarm_id).cloned().unwrap_or_default()
            })
        };
        for vote in expired {
            self.inner.store.save_vote(&vote)?;
            self.inner
                .events
                .emit(
                    vote.swarm_id,
                    "vote.expired",
                    serde_json::json!({ "vote_id": vote.id, "result": vote.result }),
                    None,
                    false,
                )
                .await?;
        }

        let pruned = self.inner.bus.prune_expired().await;
        if pruned > 0 {
            debug!(pruned, "pruned expired messages");
        }
        Ok(())
    }

    fn start_sweeper(&self) {
        let coordinator = self.clone();
        let interval = Duration::from_millis(self.inner.config.sweep_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.run_sweep().await {
                    warn!(error = %e, "sweep pass failed");
                }
            }
        });
        *self.inner.sweeper.lock().expect("sweeper lock") = Some(handle);
    }

    /// Stop the sweeper and every consensus group. Raft hard state was
    /// persisted on each step, so shutdown only has to stop the tasks.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweeper.lock().expect("sweeper lock").take() {
            handle.abort();
        }
        let mut groups = self.inner.groups.write().await;
        for (swarm_id, handle) in groups.drain() {
            debug!(swarm_id = %swarm_id, "stopping consensus group");
            handle.shutdown();
        }
        info!(agent = %self.inner.local, "coordinator shut down");
    }
}
