//! Async driver for one consensus group.
//!
//! `ConsensusRuntime::spawn` restores durable state, subscribes to the
//! swarm's consensus channel, and runs the group inside a tokio task.
//! Everything reaches the task through a [`ConsensusHandle`]: command
//! submission with commit waiters, status probes, voter updates, and
//! shutdown. RPCs travel as [`RaftEnvelope`] JSON over the message bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hive_bus::{EventLog, MessageBus, Subscription};
use hive_membership::VoterInfo;
use hive_protocol::{
    consensus_channel, AgentId, Command, GroupState, LogIndex, MessagePriority, RaftEnvelope,
    RequestId, Swarm, Term, CONSENSUS_MESSAGE_TTL_SECS,
};
use hive_state::{verify_log, SwarmStore};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::raft::{RaftNode, Step};
use crate::timer::{TimerKind, Timers};
use crate::ConsensusError;

/// Where a submitted command landed once committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub term: Term,
    pub index: LogIndex,
}

#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub state: GroupState,
    pub term: Term,
    pub leader: Option<AgentId>,
    pub commit_index: LogIndex,
}

type CommitReply = oneshot::Sender<Result<CommitResult, ConsensusError>>;

/// How many committed request ids to keep for idempotent retries. A retry
/// arriving after its entry fell this far behind the commit index appends
/// again, so callers should retry promptly.
const COMMITTED_REQUEST_CACHE: usize = 1024;

/// Evict cached commit results that have fallen behind the retry window.
fn prune_committed(committed: &mut HashMap<RequestId, CommitResult>, commit_index: LogIndex) {
    if committed.len() > COMMITTED_REQUEST_CACHE {
        let floor = commit_index.saturating_sub(COMMITTED_REQUEST_CACHE as LogIndex);
        committed.retain(|_, r| r.index > floor);
    }
}

enum GroupCommand {
    Submit {
        request_id: RequestId,
        command: Command,
        reply: CommitReply,
    },
    Status {
        reply: oneshot::Sender<GroupStatus>,
    },
    UpdateVoters(Vec<VoterInfo>),
    TriggerElection,
    Shutdown,
}

/// Cheap cloneable handle to a running group.
#[derive(Clone)]
pub struct ConsensusHandle {
    tx: mpsc::UnboundedSender<GroupCommand>,
}

impl ConsensusHandle {
    /// Submit a command and wait for it to commit. Submission is
    /// idempotent on `request_id`: retrying a committed request returns
    /// the original position instead of appending again.
    pub async fn submit(
        &self,
        request_id: RequestId,
        command: Command,
        timeout: Duration,
    ) -> Result<CommitResult, ConsensusError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GroupCommand::Submit {
                request_id,
                command,
                reply,
            })
            .map_err(|_| ConsensusError::NotRunning)?;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(ConsensusError::CommitTimeout),
            Ok(Err(_)) => Err(ConsensusError::NotRunning),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn status(&self) -> Result<GroupStatus, ConsensusError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(GroupCommand::Status { reply })
            .map_err(|_| ConsensusError::NotRunning)?;
        rx.await.map_err(|_| ConsensusError::NotRunning)
    }

    /// Push a refreshed active-voter set into the group.
    pub fn update_voters(&self, voters: Vec<VoterInfo>) -> Result<(), ConsensusError> {
        self.tx
            .send(GroupCommand::UpdateVoters(voters))
            .map_err(|_| ConsensusError::NotRunning)
    }

    /// Force an immediate election, e.g. after the leader was swept.
    pub fn trigger_election(&self) -> Result<(), ConsensusError> {
        self.tx
            .send(GroupCommand::TriggerElection)
            .map_err(|_| ConsensusError::NotRunning)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(GroupCommand::Shutdown);
    }
}

struct PendingRequest {
    index: LogIndex,
    term: Term,
    waiters: Vec<CommitReply>,
}

pub struct ConsensusRuntime {
    node: RaftNode,
    swarm: Swarm,
    local: AgentId,
    bus: MessageBus,
    events: EventLog,
    store: Arc<dyn SwarmStore>,
    subscription: Subscription,
    cmd_rx: mpsc::UnboundedReceiver<GroupCommand>,
    timer_rx: mpsc::UnboundedReceiver<TimerKind>,
    timers: Timers,
    last_role: GroupState,
    pending: HashMap<RequestId, PendingRequest>,
    by_index: HashMap<LogIndex, RequestId>,
    committed: HashMap<RequestId, CommitResult>,
}

impl ConsensusRuntime {
    /// Restore the group from the store and start driving it.
    ///
    /// A log that fails verification poisons the group: a
    /// `consensus.halted` event is emitted and the runtime refuses to
    /// start, so a damaged node cannot vote or lead.
    pub async fn spawn(
        swarm: Swarm,
        local: AgentId,
        voters: Vec<VoterInfo>,
        bus: MessageBus,
        events: EventLog,
        store: Arc<dyn SwarmStore>,
    ) -> Result<ConsensusHandle, ConsensusError> {
        let weighted = swarm.config.protocol == hive_protocol::ConsensusProtocol::WeightedRaft;
        let node = match store.load_group(&swarm.id)? {
            Some(record) => {
                let entries = store.load_log(&swarm.id)?;
                if let Err(e) = verify_log(&entries, record.commit_index) {
                    error!(swarm_id = %swarm.id, error = %e, "refusing to start on corrupt log");
                    events
                        .emit(
                            swarm.id,
                            "consensus.halted",
                            serde_json::json!({ "agent": local.as_str(), "reason": e.to_string() }),
                            Some(local),
                            false,
                        )
                        .await?;
                    return Err(ConsensusError::CorruptLog(e.to_string()));
                }
                RaftNode::restore(local.clone(), &record, entries, voters, weighted)?
            }
            None => {
                let node = RaftNode::new(local.clone(), swarm.id, voters, weighted);
                store.save_group(&node.record())?;
                node
            }
        };

        let subscription = bus.subscribe(&consensus_channel(&swarm.id), local.clone()).await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let mut timers = Timers::new(timer_tx);
        timers.reset_election(
            swarm.config.election_timeout_min_ms,
            swarm.config.election_timeout_max_ms,
        );

        info!(swarm_id = %swarm.id, agent = %local, "consensus group started");
        let runtime = Self {
            node,
            swarm,
            local,
            bus,
            events,
            store,
            subscription,
            cmd_rx,
            timer_rx,
            timers,
            last_role: GroupState::Follower,
            pending: HashMap::new(),
            by_index: HashMap::new(),
            committed: HashMap::new(),
        };
        tokio::spawn(runtime.run());
        Ok(ConsensusHandle { tx: cmd_tx })
    }

    async fn run(mut self) {
        loop {
            let halt = tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(GroupCommand::Shutdown) | None => break,
                    Some(cmd) => self.on_command(cmd).await,
                },
                Some(kind) = self.timer_rx.recv() => self.on_timer(kind).await,
                inbound = self.subscription.recv() => match inbound {
                    Some(message) => self.on_message(message).await,
                    None => break,
                },
            };
            if let Err(e) = halt {
                self.halt(e).await;
                break;
            }
        }
        debug!(swarm_id = %self.swarm.id, agent = %self.local, "consensus group stopped");
    }

    async fn on_command(&mut self, cmd: GroupCommand) -> Result<(), ConsensusError> {
        match cmd {
            GroupCommand::Submit {
                request_id,
                command,
                reply,
            } => self.on_submit(request_id, command, reply).await?,
            GroupCommand::Status { reply } => {
                let _ = reply.send(GroupStatus {
                    state: self.node.role(),
                    term: self.node.current_term(),
                    leader: self.node.leader().cloned(),
                    commit_index: self.node.commit_index(),
                });
            }
            GroupCommand::UpdateVoters(voters) => self.node.set_voters(voters),
            GroupCommand::TriggerElection => {
                if self.node.role() != GroupState::Leader {
                    let step = self.node.start_election();
                    self.apply_step(step).await?;
                }
            }
            GroupCommand::Shutdown => unreachable!("handled in run loop"),
        }
        Ok(())
    }

    async fn on_submit(
        &mut self,
        request_id: RequestId,
        command: Command,
        reply: CommitReply,
    ) -> Result<(), ConsensusError> {
        if let Some(result) = self.committed.get(&request_id) {
            let _ = reply.send(Ok(*result));
            return Ok(());
        }
        if let Some(pending) = self.pending.get_mut(&request_id) {
            pending.waiters.push(reply);
            return Ok(());
        }
        match self.node.propose(command) {
            Err(e) => {
                let _ = reply.send(Err(e));
            }
            Ok((index, step)) => {
                self.by_index.insert(index, request_id);
                self.pending.insert(
                    request_id,
                    PendingRequest {
                        index,
                        term: self.node.current_term(),
                        waiters: vec![reply],
                    },
                );
                self.apply_step(step).await?;
            }
        }
        Ok(())
    }

    async fn on_timer(&mut self, kind: TimerKind) -> Result<(), ConsensusError> {
        let step = match kind {
            TimerKind::Election => {
                if self.node.role() == GroupState::Leader {
                    return Ok(());
                }
                debug!(swarm_id = %self.swarm.id, agent = %self.local, "election timeout");
                self.node.start_election()
            }
            TimerKind::Heartbeat => self.node.tick_heartbeat(),
        };
        self.apply_step(step).await
    }

    async fn on_message(&mut self, message: hive_protocol::Message) -> Result<(), ConsensusError> {
        // At-least-once transport: acknowledge before processing, the
        // state machine tolerates duplicates anyway.
        let _ = self.bus.ack(&message.id, &self.local).await;
        let envelope: RaftEnvelope = match serde_json::from_value(message.content) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(swarm_id = %self.swarm.id, error = %e, "ignoring malformed consensus message");
                return Ok(());
            }
        };
        if envelope.swarm_id != self.swarm.id || envelope.from == self.local {
            return Ok(());
        }
        if let Some(to) = &envelope.to {
            if to != &self.local {
                return Ok(());
            }
        }
        let step = self.node.handle(&envelope.from, envelope.message)?;
        self.apply_step(step).await
    }

    /// Carry out one step's side effects, durable state first.
    async fn apply_step(&mut self, step: Step) -> Result<(), ConsensusError> {
        if let Some(from) = step.truncated_from {
            self.store.truncate_log_from(&self.swarm.id, from)?;
            self.fail_pending_from(from);
        }
        if !step.appended.is_empty() {
            self.store.append_log_entries(&self.swarm.id, &step.appended)?;
        }

        if !step.newly_committed.is_empty() {
            let commit_index = self.node.commit_index();
            self.node.mark_applied_up_to(commit_index);
            for entry in &step.newly_committed {
                let Some(request_id) = self.by_index.remove(&entry.index) else {
                    continue;
                };
                let Some(pending) = self.pending.remove(&request_id) else {
                    continue;
                };
                if pending.term == entry.term {
                    let result = CommitResult {
                        term: entry.term,
                        index: entry.index,
                    };
                    self.committed.insert(request_id, result);
                    for waiter in pending.waiters {
                        let _ = waiter.send(Ok(result));
                    }
                } else {
                    for waiter in pending.waiters {
                        let _ = waiter.send(Err(ConsensusError::StaleTerm {
                            observed: pending.term,
                            current: entry.term,
                        }));
                    }
                }
            }
            prune_committed(&mut self.committed, commit_index);
        }

        self.store.save_group(&self.node.record())?;

        for outgoing in step.outgoing {
            let envelope = RaftEnvelope {
                swarm_id: self.swarm.id,
                from: self.local.clone(),
                to: outgoing.to.clone(),
                message: outgoing.message,
            };
            self.bus
                .publish(
                    &consensus_channel(&self.swarm.id),
                    serde_json::to_value(&envelope)?,
                    Some(self.local.clone()),
                    outgoing.to,
                    MessagePriority::High,
                    Some(CONSENSUS_MESSAGE_TTL_SECS),
                )
                .await?;
        }

        self.on_role_change().await?;
        if step.reset_election_timer && self.node.role() != GroupState::Leader {
            self.timers.reset_election(
                self.swarm.config.election_timeout_min_ms,
                self.swarm.config.election_timeout_max_ms,
            );
        }
        Ok(())
    }

    async fn on_role_change(&mut self) -> Result<(), ConsensusError> {
        let role = self.node.role();
        if role == self.last_role {
            return Ok(());
        }
        if role == GroupState::Leader {
            self.timers.cancel_election();
            self.timers
                .start_heartbeat(self.swarm.config.heartbeat_interval_ms);
            self.events
                .emit(
                    self.swarm.id,
                    "consensus.leader_elected",
                    serde_json::json!({
                        "leader": self.local.as_str(),
                        "term": self.node.current_term(),
                    }),
                    Some(self.local.clone()),
                    false,
                )
                .await?;
        } else if self.last_role == GroupState::Leader {
            self.timers.cancel_heartbeat();
            self.timers.reset_election(
                self.swarm.config.election_timeout_min_ms,
                self.swarm.config.election_timeout_max_ms,
            );
            // A deposed leader cannot confirm its in-flight proposals.
            self.fail_pending_from(1);
        }
        self.last_role = role;
        Ok(())
    }

    /// Fail commit waiters for log indexes at or above `from`. Their
    /// entries were either truncated away or belong to a lost term.
    fn fail_pending_from(&mut self, from: LogIndex) {
        let stale: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.index >= from)
            .map(|(id, _)| *id)
            .collect();
        for request_id in stale {
            if let Some(pending) = self.pending.remove(&request_id) {
                self.by_index.remove(&pending.index);
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(ConsensusError::NotLeader {
                        leader: self.node.leader().cloned(),
                    }));
                }
            }
        }
    }

    async fn halt(&mut self, error: ConsensusError) {
        error!(
            swarm_id = %self.swarm.id,
            agent = %self.local,
            error = %error,
            "halting consensus group"
        );
        let _ = self
            .events
            .emit(
                self.swarm.id,
                "consensus.halted",
                serde_json::json!({
                    "agent": self.local.as_str(),
                    "reason": error.to_string(),
                }),
                Some(self.local.clone()),
                false,
            )
            .await;
        self.fail_pending_from(1);
    }
}
