//! Pure Raft state machine.
//!
//! [`RaftNode`] never touches a clock, a socket, or a disk. Every
//! transition happens through [`RaftNode::start_election`],
//! [`RaftNode::tick_heartbeat`], [`RaftNode::handle`], or
//! [`RaftNode::propose`], each returning a [`Step`] describing what the
//! runtime must now do: send messages, persist log entries, apply
//! committed commands, reset the election timer.

use std::collections::{HashMap, HashSet};

use hive_membership::{QuorumSpec, VoterInfo};
use hive_protocol::{
    AgentId, AppendEntries, AppendEntriesReply, Command, ConsensusGroupRecord, GroupState,
    LogEntry, LogIndex, RaftMessage, RequestVote, RequestVoteReply, SwarmId, Term,
};
use tracing::{debug, info, warn};

use crate::log::{AppendOutcome, RaftLog};
use crate::ConsensusError;

/// A message the runtime must put on the wire. `to: None` broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: Option<AgentId>,
    pub message: RaftMessage,
}

/// Side effects of one state-machine step.
#[derive(Debug, Default)]
pub struct Step {
    pub outgoing: Vec<Outgoing>,
    /// Entries that became committed during this step, in log order.
    pub newly_committed: Vec<LogEntry>,
    /// Entries appended to the local log; persist before sending replies.
    pub appended: Vec<LogEntry>,
    /// First log index invalidated by conflict truncation, if any.
    pub truncated_from: Option<LogIndex>,
    /// The election timeout must be re-armed.
    pub reset_election_timer: bool,
    /// `current_term` or `voted_for` changed; persist before sending.
    pub hard_state_changed: bool,
}

pub struct RaftNode {
    id: AgentId,
    swarm_id: SwarmId,
    group_id: hive_protocol::GroupId,
    role: GroupState,
    current_term: Term,
    voted_for: Option<AgentId>,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader: Option<AgentId>,
    voters: Vec<VoterInfo>,
    weighted: bool,
    votes_granted: HashSet<AgentId>,
    next_index: HashMap<AgentId, LogIndex>,
    match_index: HashMap<AgentId, LogIndex>,
}

impl RaftNode {
    pub fn new(id: AgentId, swarm_id: SwarmId, voters: Vec<VoterInfo>, weighted: bool) -> Self {
        Self {
            id,
            swarm_id,
            group_id: hive_protocol::GroupId::new(),
            role: GroupState::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader: None,
            voters,
            weighted,
            votes_granted: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Rebuild from durable state. The node always restarts as a follower;
    /// `commit_index` is restored but nothing past it is trusted until the
    /// next leader's consistency check confirms it.
    pub fn restore(
        id: AgentId,
        record: &ConsensusGroupRecord,
        entries: Vec<LogEntry>,
        voters: Vec<VoterInfo>,
        weighted: bool,
    ) -> Result<Self, ConsensusError> {
        let log = RaftLog::from_entries(entries)?;
        if record.commit_index > log.last_index() {
            return Err(ConsensusError::CorruptLog(format!(
                "commit index {} beyond last log index {}",
                record.commit_index,
                log.last_index()
            )));
        }
        Ok(Self {
            id,
            swarm_id: record.swarm_id,
            group_id: record.group_id,
            role: GroupState::Follower,
            current_term: record.current_term,
            voted_for: record.voted_for.clone(),
            log,
            commit_index: record.commit_index,
            last_applied: record.last_applied_index,
            leader: None,
            voters,
            weighted,
            votes_granted: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        })
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn role(&self) -> GroupState {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn leader(&self) -> Option<&AgentId> {
        self.leader.as_ref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RaftLog {
        &mut self.log
    }

    /// Durable snapshot of the group for the state store.
    pub fn record(&self) -> ConsensusGroupRecord {
        ConsensusGroupRecord {
            group_id: self.group_id,
            swarm_id: self.swarm_id,
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_applied_index: self.last_applied,
            leader: self.leader.clone(),
            state: self.role,
        }
    }

    /// Replace the active-voter set after a membership change.
    pub fn set_voters(&mut self, voters: Vec<VoterInfo>) {
        self.voters = voters;
        if self.role == GroupState::Leader {
            let next = self.log.last_index() + 1;
            for voter in &self.voters {
                if voter.id != self.id {
                    self.next_index.entry(voter.id.clone()).or_insert(next);
                    self.match_index.entry(voter.id.clone()).or_insert(0);
                }
            }
        }
    }

    fn quorum(&self) -> QuorumSpec {
        if self.weighted {
            QuorumSpec::weighted(0.5)
        } else {
            QuorumSpec::counted(0.5)
        }
    }

    fn weight_of(&self, agent: &AgentId) -> f64 {
        let spec = self.quorum();
        self.voters
            .iter()
            .find(|v| &v.id == agent)
            .map(|v| spec.weight_of(v))
            .unwrap_or(0.0)
    }

    fn is_voter(&self, agent: &AgentId) -> bool {
        self.voters.iter().any(|v| &v.id == agent)
    }

    /// Election timeout fired: become a candidate in a new term and ask
    /// the group for votes. A single-voter group elects itself at once.
    pub fn start_election(&mut self) -> Step {
        let mut step = Step::default();
        if !self.is_voter(&self.id) {
            debug!(agent = %self.id, "observer skipping election");
            return step;
        }

        self.current_term += 1;
        self.role = GroupState::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.votes_granted = HashSet::from([self.id.clone()]);
        step.hard_state_changed = true;
        step.reset_election_timer = true;

        info!(
            swarm_id = %self.swarm_id,
            agent = %self.id,
            term = self.current_term,
            "starting election"
        );

        let own = self.weight_of(&self.id);
        if self.quorum().strict_majority(own, &self.voters) {
            self.become_leader(&mut step);
            return step;
        }

        let request = RaftMessage::RequestVote(RequestVote {
            term: self.current_term,
            candidate: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        });
        step.outgoing.push(Outgoing {
            to: None,
            message: request,
        });
        step
    }

    fn become_leader(&mut self, step: &mut Step) {
        self.role = GroupState::Leader;
        self.leader = Some(self.id.clone());
        self.next_index.clear();
        self.match_index.clear();
        let next = self.log.last_index() + 1;
        for voter in &self.voters {
            if voter.id != self.id {
                self.next_index.insert(voter.id.clone(), next);
                self.match_index.insert(voter.id.clone(), 0);
            }
        }
        info!(
            swarm_id = %self.swarm_id,
            agent = %self.id,
            term = self.current_term,
            "won election, assuming leadership"
        );
        // Assert leadership immediately.
        self.replicate_all(step);
    }

    fn step_down(&mut self, term: Term, step: &mut Step) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            step.hard_state_changed = true;
        }
        if self.role != GroupState::Follower {
            debug!(agent = %self.id, term = self.current_term, "stepping down to follower");
        }
        self.role = GroupState::Follower;
        self.votes_granted.clear();
    }

    fn append_entries_for(&self, follower: &AgentId) -> RaftMessage {
        let next = self.next_index.get(follower).copied().unwrap_or(1);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        RaftMessage::AppendEntries(AppendEntries {
            term: self.current_term,
            leader: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })
    }

    fn replicate_all(&self, step: &mut Step) {
        for voter in &self.voters {
            if voter.id == self.id {
                continue;
            }
            step.outgoing.push(Outgoing {
                to: Some(voter.id.clone()),
                message: self.append_entries_for(&voter.id),
            });
        }
    }

    /// Heartbeat interval fired on the leader.
    pub fn tick_heartbeat(&mut self) -> Step {
        let mut step = Step::default();
        if self.role == GroupState::Leader {
            self.replicate_all(&mut step);
        }
        step
    }

    /// Feed one inbound RPC through the state machine.
    pub fn handle(&mut self, from: &AgentId, msg: RaftMessage) -> Result<Step, ConsensusError> {
        let mut step = Step::default();
        if msg.term() > self.current_term {
            self.step_down(msg.term(), &mut step);
            self.leader = None;
        }

        match msg {
            RaftMessage::RequestVote(m) => self.on_request_vote(m, &mut step),
            RaftMessage::RequestVoteReply(m) => self.on_vote_reply(m, &mut step),
            RaftMessage::AppendEntries(m) => self.on_append_entries(m, &mut step)?,
            RaftMessage::AppendEntriesReply(m) => self.on_append_reply(from, m, &mut step),
        }
        Ok(step)
    }

    fn on_request_vote(&mut self, m: RequestVote, step: &mut Step) {
        let up_to_date = m.last_log_term > self.log.last_term()
            || (m.last_log_term == self.log.last_term()
                && m.last_log_index >= self.log.last_index());
        let granted = m.term == self.current_term
            && self
                .voted_for
                .as_ref()
                .map(|v| v == &m.candidate)
                .unwrap_or(true)
            && up_to_date;

        if granted {
            self.voted_for = Some(m.candidate.clone());
            step.hard_state_changed = true;
            step.reset_election_timer = true;
        }
        debug!(
            agent = %self.id,
            candidate = %m.candidate,
            term = m.term,
            granted,
            "vote request"
        );
        step.outgoing.push(Outgoing {
            to: Some(m.candidate),
            message: RaftMessage::RequestVoteReply(RequestVoteReply {
                term: self.current_term,
                voter: self.id.clone(),
                granted,
            }),
        });
    }

    fn on_vote_reply(&mut self, m: RequestVoteReply, step: &mut Step) {
        if self.role != GroupState::Candidate || m.term != self.current_term || !m.granted {
            return;
        }
        if !self.is_voter(&m.voter) {
            return;
        }
        self.votes_granted.insert(m.voter);
        let spec = self.quorum();
        let acquired: f64 = self
            .votes_granted
            .iter()
            .map(|a| self.weight_of(a))
            .sum();
        if spec.strict_majority(acquired, &self.voters) {
            self.become_leader(step);
        }
    }

    fn on_append_entries(&mut self, m: AppendEntries, step: &mut Step) -> Result<(), ConsensusError> {
        if m.term < self.current_term {
            step.outgoing.push(Outgoing {
                to: Some(m.leader),
                message: RaftMessage::AppendEntriesReply(AppendEntriesReply {
                    term: self.current_term,
                    follower: self.id.clone(),
                    success: false,
                    match_index: 0,
                }),
            });
            return Ok(());
        }

        // A valid AppendEntries at our term is the leader speaking; a
        // candidate in the same term yields.
        self.step_down(m.term, step);
        self.leader = Some(m.leader.clone());
        step.reset_election_timer = true;

        let outcome = self
            .log
            .try_append(m.prev_log_index, m.prev_log_term, &m.entries, self.commit_index)?;
        let (success, match_index) = match outcome {
            AppendOutcome::Rejected => {
                debug!(
                    agent = %self.id,
                    prev_log_index = m.prev_log_index,
                    prev_log_term = m.prev_log_term,
                    "append rejected, log diverges"
                );
                (false, 0)
            }
            AppendOutcome::Accepted {
                truncated_from,
                appended,
                match_index,
            } => {
                step.truncated_from = truncated_from;
                step.appended = appended;
                let new_commit = m.leader_commit.min(self.log.last_index());
                self.advance_commit_to(new_commit, step);
                (true, match_index)
            }
        };

        step.outgoing.push(Outgoing {
            to: Some(m.leader),
            message: RaftMessage::AppendEntriesReply(AppendEntriesReply {
                term: self.current_term,
                follower: self.id.clone(),
                success,
                match_index,
            }),
        });
        Ok(())
    }

    fn on_append_reply(&mut self, from: &AgentId, m: AppendEntriesReply, step: &mut Step) {
        if self.role != GroupState::Leader || m.term != self.current_term {
            return;
        }
        if m.success {
            let known = self.match_index.entry(from.clone()).or_insert(0);
            if m.match_index > *known {
                *known = m.match_index;
            }
            self.next_index.insert(from.clone(), m.match_index + 1);
            self.try_advance_leader_commit(step);
        } else {
            // Walk backwards until the consistency check passes.
            let next = self.next_index.entry(from.clone()).or_insert(1);
            *next = (*next).saturating_sub(1).max(1);
            step.outgoing.push(Outgoing {
                to: Some(from.clone()),
                message: self.append_entries_for(from),
            });
        }
    }

    /// Leader commit rule: an index commits once a strict majority has
    /// replicated it, and only for entries from the current term.
    fn try_advance_leader_commit(&mut self, step: &mut Step) {
        let spec = self.quorum();
        let mut target = self.commit_index;
        for n in (self.commit_index + 1)..=self.log.last_index() {
            if self.log.term_at(n) != Some(self.current_term) {
                continue;
            }
            let mut acquired = self.weight_of(&self.id);
            for voter in &self.voters {
                if voter.id == self.id {
                    continue;
                }
                if self.match_index.get(&voter.id).copied().unwrap_or(0) >= n {
                    acquired += spec.weight_of(voter);
                }
            }
            if spec.strict_majority(acquired, &self.voters) {
                target = n;
            }
        }
        self.advance_commit_to(target, step);
    }

    fn advance_commit_to(&mut self, index: LogIndex, step: &mut Step) {
        if index <= self.commit_index {
            return;
        }
        for n in (self.commit_index + 1)..=index {
            if let Some(entry) = self.log.entry(n) {
                step.newly_committed.push(entry.clone());
            }
        }
        debug!(
            agent = %self.id,
            from = self.commit_index,
            to = index,
            "advancing commit index"
        );
        self.commit_index = index;
    }

    /// Record freshly applied entries, in commit order.
    pub fn mark_applied_up_to(&mut self, index: LogIndex) -> Vec<LogEntry> {
        let applied = self.log.mark_applied_up_to(index.min(self.commit_index));
        if let Some(last) = applied.last() {
            self.last_applied = last.index;
        }
        applied
    }

    /// Leader-side command submission: append locally and replicate. A
    /// single-voter group commits immediately.
    pub fn propose(&mut self, command: Command) -> Result<(LogIndex, Step), ConsensusError> {
        if self.role != GroupState::Leader {
            warn!(agent = %self.id, "rejecting proposal, not the leader");
            return Err(ConsensusError::NotLeader {
                leader: self.leader.clone(),
            });
        }
        let mut step = Step::default();
        let entry = self.log.append_new(self.current_term, command);
        let index = entry.index;
        step.appended.push(entry);
        self.replicate_all(&mut step);
        self.try_advance_leader_commit(&mut step);
        Ok((index, step))
    }
}
