//! Swarm membership registry.
//!
//! Lifecycle:
//! 1. `register_swarm()` - make a swarm known to the registry
//! 2. `join()` / `leave()` - membership churn (capacity-checked, soft delete)
//! 3. `heartbeat()` - liveness refresh
//! 4. `sweep()` - transition members that missed their health window to
//!    inactive; the caller forces a re-election when a leader was swept
//!
//! Memberships are never hard-deleted: a departed agent stays in the roster
//! as `inactive` so history is retained for audit, and a rejoin reactivates
//! the existing row.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use hive_protocol::{AgentId, MemberRole, MemberStatus, Membership, Swarm, SwarmId};

use crate::quorum::VoterInfo;
use crate::MembershipError;

/// A member transitioned to inactive by a liveness sweep.
#[derive(Debug, Clone)]
pub struct SweptMember {
    pub swarm_id: SwarmId,
    pub agent_id: AgentId,
    /// The caller must trigger a new election when true.
    pub was_leader: bool,
}

#[derive(Debug)]
struct Roster {
    swarm: Swarm,
    members: HashMap<AgentId, Membership>,
}

/// Tracks which agents belong to which swarm, their role and liveness.
///
/// The registry is a plain synchronous structure; callers that share it
/// across tasks wrap it in a lock. Membership is shared-read by every
/// component and mutated only here.
#[derive(Debug, Default)]
pub struct MembershipRegistry {
    rosters: HashMap<SwarmId, Roster>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a swarm known to the registry.
    pub fn register_swarm(&mut self, swarm: Swarm) {
        tracing::info!(swarm_id = %swarm.id, name = %swarm.config.name, "Swarm registered");
        self.rosters.insert(
            swarm.id,
            Roster {
                swarm,
                members: HashMap::new(),
            },
        );
    }

    /// Retire a swarm. Soft: the roster stays readable.
    pub fn deactivate_swarm(&mut self, swarm_id: &SwarmId) -> Result<(), MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        roster.swarm.active = false;
        tracing::info!(swarm_id = %swarm_id, "Swarm deactivated");
        Ok(())
    }

    pub fn swarm(&self, swarm_id: &SwarmId) -> Result<&Swarm, MembershipError> {
        self.rosters
            .get(swarm_id)
            .map(|r| &r.swarm)
            .ok_or(MembershipError::UnknownSwarm(*swarm_id))
    }

    pub fn swarm_ids(&self) -> Vec<SwarmId> {
        self.rosters.keys().copied().collect()
    }

    /// Replace the roster with persisted membership rows, used when a
    /// node restarts.
    pub fn restore_memberships(
        &mut self,
        swarm_id: &SwarmId,
        memberships: Vec<Membership>,
    ) -> Result<(), MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        roster.members = memberships
            .into_iter()
            .map(|m| (m.agent_id.clone(), m))
            .collect();
        Ok(())
    }

    /// Add an agent to a swarm, or reactivate its previous membership.
    ///
    /// Fails with `CapacityExceeded` when active members are already at
    /// the swarm's `max_members`.
    pub fn join(
        &mut self,
        swarm_id: &SwarmId,
        agent_id: AgentId,
    ) -> Result<Membership, MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        if !roster.swarm.active {
            return Err(MembershipError::SwarmInactive(*swarm_id));
        }

        let active = roster
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Active)
            .count() as u32;

        if let Some(existing) = roster.members.get_mut(&agent_id) {
            if existing.status != MemberStatus::Active {
                if active >= roster.swarm.config.max_members {
                    return Err(MembershipError::CapacityExceeded {
                        swarm_id: *swarm_id,
                        max: roster.swarm.config.max_members,
                    });
                }
                existing.status = MemberStatus::Active;
                existing.role = MemberRole::Follower;
            }
            existing.last_seen_at = Utc::now();
            tracing::debug!(swarm_id = %swarm_id, agent = %agent_id, "Membership reactivated");
            return Ok(existing.clone());
        }

        if active >= roster.swarm.config.max_members {
            return Err(MembershipError::CapacityExceeded {
                swarm_id: *swarm_id,
                max: roster.swarm.config.max_members,
            });
        }

        let membership = Membership::new(*swarm_id, agent_id.clone());
        roster.members.insert(agent_id.clone(), membership.clone());
        tracing::info!(
            swarm_id = %swarm_id,
            agent = %agent_id,
            active_members = active + 1,
            "Agent joined swarm"
        );
        Ok(membership)
    }

    /// Set a member inactive. Returns whether the departing agent held the
    /// leader role, in which case the caller must start a new election.
    pub fn leave(
        &mut self,
        swarm_id: &SwarmId,
        agent_id: &AgentId,
    ) -> Result<bool, MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        let member = roster
            .members
            .get_mut(agent_id)
            .ok_or_else(|| MembershipError::NotAMember {
                swarm_id: *swarm_id,
                agent: agent_id.clone(),
            })?;

        let was_leader = member.role == MemberRole::Leader;
        member.status = MemberStatus::Inactive;
        member.role = MemberRole::Follower;
        tracing::info!(swarm_id = %swarm_id, agent = %agent_id, was_leader, "Agent left swarm");
        Ok(was_leader)
    }

    /// Refresh an agent's `last_seen_at`.
    pub fn heartbeat(
        &mut self,
        swarm_id: &SwarmId,
        agent_id: &AgentId,
    ) -> Result<(), MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        let member = roster
            .members
            .get_mut(agent_id)
            .ok_or_else(|| MembershipError::NotAMember {
                swarm_id: *swarm_id,
                agent: agent_id.clone(),
            })?;
        member.last_seen_at = Utc::now();
        Ok(())
    }

    /// Record a role change. Assigning `Leader` demotes any current leader
    /// to follower first, so at most one active member holds the role.
    pub fn set_role(
        &mut self,
        swarm_id: &SwarmId,
        agent_id: &AgentId,
        role: MemberRole,
    ) -> Result<(), MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        if !roster.members.contains_key(agent_id) {
            return Err(MembershipError::NotAMember {
                swarm_id: *swarm_id,
                agent: agent_id.clone(),
            });
        }

        if role == MemberRole::Leader {
            for member in roster.members.values_mut() {
                if member.role == MemberRole::Leader && &member.agent_id != agent_id {
                    member.role = MemberRole::Follower;
                }
            }
        }

        // Checked above.
        let member = roster.members.get_mut(agent_id).expect("member exists");
        member.role = role;
        tracing::debug!(swarm_id = %swarm_id, agent = %agent_id, role = ?role, "Role updated");
        Ok(())
    }

    pub fn set_vote_weight(
        &mut self,
        swarm_id: &SwarmId,
        agent_id: &AgentId,
        weight: f64,
    ) -> Result<(), MembershipError> {
        let roster = self.roster_mut(swarm_id)?;
        let member = roster
            .members
            .get_mut(agent_id)
            .ok_or_else(|| MembershipError::NotAMember {
                swarm_id: *swarm_id,
                agent: agent_id.clone(),
            })?;
        member.vote_weight = weight;
        Ok(())
    }

    pub fn membership(
        &self,
        swarm_id: &SwarmId,
        agent_id: &AgentId,
    ) -> Result<&Membership, MembershipError> {
        self.rosters
            .get(swarm_id)
            .ok_or(MembershipError::UnknownSwarm(*swarm_id))?
            .members
            .get(agent_id)
            .ok_or_else(|| MembershipError::NotAMember {
                swarm_id: *swarm_id,
                agent: agent_id.clone(),
            })
    }

    /// Full roster, including inactive history rows.
    pub fn memberships(&self, swarm_id: &SwarmId) -> Result<Vec<Membership>, MembershipError> {
        Ok(self
            .rosters
            .get(swarm_id)
            .ok_or(MembershipError::UnknownSwarm(*swarm_id))?
            .members
            .values()
            .cloned()
            .collect())
    }

    /// Agents that count toward quorum: `active` and not `observer`.
    pub fn list_active_voters(
        &self,
        swarm_id: &SwarmId,
    ) -> Result<Vec<VoterInfo>, MembershipError> {
        let roster = self
            .rosters
            .get(swarm_id)
            .ok_or(MembershipError::UnknownSwarm(*swarm_id))?;
        let mut voters: Vec<VoterInfo> = roster
            .members
            .values()
            .filter(|m| m.is_voter())
            .map(|m| VoterInfo::new(m.agent_id.clone(), m.vote_weight))
            .collect();
        // Deterministic ordering for callers that snapshot the set.
        voters.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(voters)
    }

    pub fn active_member_count(&self, swarm_id: &SwarmId) -> Result<usize, MembershipError> {
        let roster = self
            .rosters
            .get(swarm_id)
            .ok_or(MembershipError::UnknownSwarm(*swarm_id))?;
        Ok(roster
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Active)
            .count())
    }

    /// Transition members that missed their health window to inactive.
    ///
    /// Returns the swept members; the consensus engine starts a new
    /// election for any swarm whose leader was swept.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<SweptMember> {
        let mut swept = Vec::new();
        for roster in self.rosters.values_mut() {
            if !roster.swarm.active {
                continue;
            }
            let window = Duration::milliseconds(
                roster.swarm.config.health_check_interval_ms as i64,
            );
            for member in roster.members.values_mut() {
                if member.status == MemberStatus::Active && now - member.last_seen_at > window {
                    let was_leader = member.role == MemberRole::Leader;
                    member.status = MemberStatus::Inactive;
                    member.role = MemberRole::Follower;
                    tracing::warn!(
                        swarm_id = %member.swarm_id,
                        agent = %member.agent_id,
                        was_leader,
                        "Member missed health window, marked inactive"
                    );
                    swept.push(SweptMember {
                        swarm_id: member.swarm_id,
                        agent_id: member.agent_id.clone(),
                        was_leader,
                    });
                }
            }
        }
        swept
    }

    fn roster_mut(&mut self, swarm_id: &SwarmId) -> Result<&mut Roster, MembershipError> {
        self.rosters
            .get_mut(swarm_id)
            .ok_or(MembershipError::UnknownSwarm(*swarm_id))
    }
}
