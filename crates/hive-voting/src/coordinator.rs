//! One-shot quorum vote lifecycle.
//!
//! Lifecycle:
//! 1. `open_vote()` - register the option set, strategy, quorum, and TTL
//! 2. `cast()` - collect one immutable response per eligible agent;
//!    every cast re-tallies and closes the vote the instant a
//!    strategy-satisfying winner exists
//! 3. `expire_due()` - close votes whose `expires_at` passed
//!
//! The active-voter set is passed into every operation explicitly; the
//! coordinator holds no ambient membership state.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use hive_membership::{QuorumSpec, VoterInfo};
use hive_protocol::{
    AgentId, SwarmId, Vote, VoteId, VoteResponse, VoteResult, VoteStatus, VoteStrategy,
    SUPER_MAJORITY_FRACTION,
};

use crate::VoteError;

struct VoteState {
    vote: Vote,
    responses: HashMap<AgentId, VoteResponse>,
}

/// Result of a tally pass.
#[derive(Debug, Clone)]
pub struct TallyOutcome {
    /// Participating fraction of the active-voter set (count or weight,
    /// per the strategy).
    pub participation: f64,
    /// Accumulated decision weight per option.
    pub counts: HashMap<String, f64>,
    pub status: VoteStatus,
    pub result: Option<VoteResult>,
}

/// Coordinates every open vote across swarms.
#[derive(Default)]
pub struct VoteCoordinator {
    votes: HashMap<VoteId, VoteState>,
}

impl VoteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a vote over `options` with the given strategy and required
    /// participation quorum.
    pub fn open_vote(
        &mut self,
        swarm_id: SwarmId,
        options: Vec<String>,
        strategy: VoteStrategy,
        quorum: f64,
        ttl_secs: i64,
        opened_by: Option<AgentId>,
    ) -> Result<Vote, VoteError> {
        if options.len() < 2 {
            return Err(VoteError::TooFewOptions(options.len()));
        }
        if !(quorum > 0.0 && quorum <= 1.0) {
            return Err(VoteError::InvalidQuorum(quorum));
        }

        let now = Utc::now();
        let vote = Vote {
            id: VoteId::new(),
            swarm_id,
            options,
            strategy,
            quorum,
            status: VoteStatus::Open,
            opened_by,
            opened_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            result: None,
        };

        tracing::info!(
            vote_id = %vote.id,
            swarm_id = %swarm_id,
            strategy = ?strategy,
            quorum,
            "Vote opened"
        );
        self.votes.insert(
            vote.id,
            VoteState {
                vote: vote.clone(),
                responses: HashMap::new(),
            },
        );
        Ok(vote)
    }

    /// Reload a persisted vote and its recorded responses, e.g. on node
    /// restart. The vote keeps its persisted status; an expired-but-open
    /// vote is closed by the next sweep.
    pub fn restore(&mut self, vote: Vote, responses: Vec<VoteResponse>) {
        let responses = responses
            .into_iter()
            .map(|r| (r.agent_id.clone(), r))
            .collect();
        self.votes.insert(vote.id, VoteState { vote, responses });
    }

    /// Cast one response. `voters` is the swarm's current active-voter
    /// snapshot; agents outside it are rejected with `NotEligible`.
    ///
    /// Returns the tally after this response; the vote may now be closed
    /// with a winner.
    pub fn cast(
        &mut self,
        vote_id: &VoteId,
        agent: AgentId,
        option: &str,
        confidence: Option<f64>,
        rationale: Option<String>,
        voters: &[VoterInfo],
    ) -> Result<TallyOutcome, VoteError> {
        let state = self
            .votes
            .get_mut(vote_id)
            .ok_or(VoteError::UnknownVote(*vote_id))?;

        let now = Utc::now();
        if state.vote.status == VoteStatus::Open && state.vote.expires_at <= now {
            close_expired(&mut state.vote, &state.responses, voters);
        }
        if state.vote.status != VoteStatus::Open {
            return Err(VoteError::VoteClosed(*vote_id));
        }
        if !voters.iter().any(|v| v.id == agent) {
            return Err(VoteError::NotEligible(agent));
        }
        if state.responses.contains_key(&agent) {
            return Err(VoteError::DuplicateVote(agent));
        }
        if !state.vote.options.iter().any(|o| o == option) {
            return Err(VoteError::UnknownOption(option.to_string()));
        }

        state.responses.insert(
            agent.clone(),
            VoteResponse {
                vote_id: *vote_id,
                agent_id: agent.clone(),
                option: option.to_string(),
                confidence,
                rationale,
                cast_at: now,
            },
        );
        tracing::debug!(
            vote_id = %vote_id,
            agent = %agent,
            option,
            responses = state.responses.len(),
            "Vote response recorded"
        );

        let outcome = tally(&state.vote, &state.responses, voters);
        if let Some(VoteResult::Winner { option }) = &outcome.result {
            state.vote.status = VoteStatus::Closed;
            state.vote.result = Some(VoteResult::Winner {
                option: option.clone(),
            });
            tracing::info!(vote_id = %vote_id, winner = %option, "Vote closed with winner");
        }
        Ok(outcome)
    }

    /// Tally on demand without mutating the vote.
    pub fn tally(&self, vote_id: &VoteId, voters: &[VoterInfo]) -> Result<TallyOutcome, VoteError> {
        let state = self
            .votes
            .get(vote_id)
            .ok_or(VoteError::UnknownVote(*vote_id))?;
        Ok(tally(&state.vote, &state.responses, voters))
    }

    /// Close open votes whose TTL has passed. A vote that reached quorum
    /// with a strategy-satisfying winner closes with that winner; anything
    /// else closes with `no_quorum`. Returns the votes that closed.
    pub fn expire_due(&mut self, now: DateTime<Utc>, voters_of: impl Fn(&SwarmId) -> Vec<VoterInfo>) -> Vec<Vote> {
        let mut closed = Vec::new();
        for state in self.votes.values_mut() {
            if state.vote.status == VoteStatus::Open && state.vote.expires_at <= now {
                let voters = voters_of(&state.vote.swarm_id);
                close_expired(&mut state.vote, &state.responses, &voters);
                closed.push(state.vote.clone());
            }
        }
        closed
    }

    /// Cancel an open vote.
    pub fn cancel(&mut self, vote_id: &VoteId) -> Result<Vote, VoteError> {
        let state = self
            .votes
            .get_mut(vote_id)
            .ok_or(VoteError::UnknownVote(*vote_id))?;
        if state.vote.status != VoteStatus::Open {
            return Err(VoteError::VoteClosed(*vote_id));
        }
        state.vote.status = VoteStatus::Cancelled;
        tracing::info!(vote_id = %vote_id, "Vote cancelled");
        Ok(state.vote.clone())
    }

    /// Mark a closed-with-winner vote as executed by the collaborator.
    pub fn mark_executed(&mut self, vote_id: &VoteId) -> Result<Vote, VoteError> {
        let state = self
            .votes
            .get_mut(vote_id)
            .ok_or(VoteError::UnknownVote(*vote_id))?;
        if state.vote.status != VoteStatus::Closed
            || !matches!(state.vote.result, Some(VoteResult::Winner { .. }))
        {
            return Err(VoteError::VoteClosed(*vote_id));
        }
        state.vote.status = VoteStatus::Executed;
        Ok(state.vote.clone())
    }

    pub fn vote(&self, vote_id: &VoteId) -> Result<&Vote, VoteError> {
        self.votes
            .get(vote_id)
            .map(|s| &s.vote)
            .ok_or(VoteError::UnknownVote(*vote_id))
    }

    pub fn responses(&self, vote_id: &VoteId) -> Result<Vec<VoteResponse>, VoteError> {
        let state = self
            .votes
            .get(vote_id)
            .ok_or(VoteError::UnknownVote(*vote_id))?;
        let mut responses: Vec<VoteResponse> = state.responses.values().cloned().collect();
        responses.sort_by_key(|r| r.cast_at);
        Ok(responses)
    }
}

fn quorum_spec(vote: &Vote) -> QuorumSpec {
    match vote.strategy {
        VoteStrategy::Weighted => QuorumSpec::weighted(vote.quorum),
        _ => QuorumSpec::counted(vote.quorum),
    }
}

/// Compute participation and the winner (if any) under the vote's strategy.
///
/// Never reports a winner while participating weight is below the required
/// quorum fraction of the total active-voter weight.
fn tally(
    vote: &Vote,
    responses: &HashMap<AgentId, VoteResponse>,
    voters: &[VoterInfo],
) -> TallyOutcome {
    let spec = quorum_spec(vote);
    let total = spec.total_weight(voters);

    let mut counts: HashMap<String, f64> = vote
        .options
        .iter()
        .map(|o| (o.clone(), 0.0))
        .collect();
    let mut participating = 0.0;
    for response in responses.values() {
        // Responses from agents that have since gone inactive still count
        // as cast, but carry no weight against the current voter set.
        let Some(voter) = voters.iter().find(|v| v.id == response.agent_id) else {
            continue;
        };
        let weight = spec.weight_of(voter);
        participating += weight;
        *counts.entry(response.option.clone()).or_insert(0.0) += weight;
    }

    let participation = if total > 0.0 { participating / total } else { 0.0 };
    let mut result = None;

    if spec.satisfied(participating, voters) {
        result = winner_for(vote.strategy, &counts, participating);
    }

    TallyOutcome {
        participation,
        counts,
        status: vote.status,
        result,
    }
}

/// Strategy-specific winner selection over accumulated option weights.
fn winner_for(
    strategy: VoteStrategy,
    counts: &HashMap<String, f64>,
    participating: f64,
) -> Option<VoteResult> {
    if participating <= 0.0 {
        return None;
    }
    let (best, best_weight) = counts
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    // A tie for first place is not a winner yet.
    let tied = counts
        .values()
        .filter(|w| (**w - *best_weight).abs() < f64::EPSILON)
        .count()
        > 1;
    if tied || *best_weight <= 0.0 {
        return None;
    }

    match strategy {
        VoteStrategy::SimpleMajority | VoteStrategy::Weighted => Some(VoteResult::Winner {
            option: best.clone(),
        }),
        VoteStrategy::SuperMajority => {
            if best_weight / participating >= SUPER_MAJORITY_FRACTION {
                Some(VoteResult::Winner {
                    option: best.clone(),
                })
            } else {
                None
            }
        }
    }
}

fn close_expired(
    vote: &mut Vote,
    responses: &HashMap<AgentId, VoteResponse>,
    voters: &[VoterInfo],
) {
    let outcome = tally(vote, responses, voters);
    vote.status = VoteStatus::Closed;
    vote.result = Some(match outcome.result {
        Some(winner) => winner,
        None => VoteResult::NoQuorum,
    });
    tracing::info!(vote_id = %vote.id, result = ?vote.result, "Vote expired and closed");
}
