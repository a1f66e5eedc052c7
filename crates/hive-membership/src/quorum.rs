//! Quorum math shared by the consensus engine and the voting coordinator.

use hive_protocol::AgentId;
use serde::{Deserialize, Serialize};

/// An active voter and its configured weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoterInfo {
    pub id: AgentId,
    pub weight: f64,
}

impl VoterInfo {
    pub fn new(id: AgentId, weight: f64) -> Self {
        Self { id, weight }
    }
}

/// Strict majority by count: more than half of `total`.
pub fn majority_count(total: usize) -> usize {
    total / 2 + 1
}

/// Quorum requirement for a decision: a participation fraction over the
/// active-voter set, measured by head count or by summed vote weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuorumSpec {
    /// Required participation fraction in (0, 1].
    pub fraction: f64,
    /// Measure participation by summed vote weight instead of head count.
    pub weighted: bool,
}

impl QuorumSpec {
    pub fn counted(fraction: f64) -> Self {
        Self {
            fraction,
            weighted: false,
        }
    }

    pub fn weighted(fraction: f64) -> Self {
        Self {
            fraction,
            weighted: true,
        }
    }

    /// Total decision weight of the voter set under this spec.
    pub fn total_weight(&self, voters: &[VoterInfo]) -> f64 {
        if self.weighted {
            voters.iter().map(|v| v.weight).sum()
        } else {
            voters.len() as f64
        }
    }

    /// Decision weight of a single voter under this spec.
    pub fn weight_of(&self, voter: &VoterInfo) -> f64 {
        if self.weighted {
            voter.weight
        } else {
            1.0
        }
    }

    /// Whether `participating` weight meets the quorum over `voters`.
    ///
    /// An empty voter set never reaches quorum.
    pub fn satisfied(&self, participating: f64, voters: &[VoterInfo]) -> bool {
        let total = self.total_weight(voters);
        if total <= 0.0 {
            return false;
        }
        participating / total >= self.fraction
    }

    /// Whether `acquired` weight is a strict majority of the voter set.
    /// Used for leader election and commit acknowledgment.
    pub fn strict_majority(&self, acquired: f64, voters: &[VoterInfo]) -> bool {
        let total = self.total_weight(voters);
        total > 0.0 && acquired > total / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voters(weights: &[f64]) -> Vec<VoterInfo> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| VoterInfo::new(AgentId::new(format!("a{i}")), *w))
            .collect()
    }

    #[test]
    fn test_majority_count() {
        assert_eq!(majority_count(1), 1);
        assert_eq!(majority_count(2), 2);
        assert_eq!(majority_count(3), 2);
        assert_eq!(majority_count(4), 3);
        assert_eq!(majority_count(5), 3);
    }

    #[test]
    fn test_counted_quorum() {
        let spec = QuorumSpec::counted(0.51);
        let set = voters(&[1.0, 1.0, 1.0, 1.0, 1.0]);
        // 3 of 5 = 0.6 >= 0.51
        assert!(spec.satisfied(3.0, &set));
        // 2 of 5 = 0.4 < 0.51
        assert!(!spec.satisfied(2.0, &set));
    }

    #[test]
    fn test_weighted_quorum_uses_weights() {
        let spec = QuorumSpec::weighted(0.5);
        let set = voters(&[3.0, 1.0, 1.0]);
        // One heavy voter alone reaches 3/5 participation.
        assert!(spec.satisfied(3.0, &set));
        // Two light voters reach only 2/5.
        assert!(!spec.satisfied(2.0, &set));
    }

    #[test]
    fn test_strict_majority_by_weight() {
        let spec = QuorumSpec::weighted(0.5);
        let set = voters(&[2.0, 1.0, 1.0]);
        assert!(!spec.strict_majority(2.0, &set)); // exactly half is not enough
        assert!(spec.strict_majority(3.0, &set));
    }

    #[test]
    fn test_empty_voter_set_never_reaches_quorum() {
        let spec = QuorumSpec::counted(0.51);
        assert!(!spec.satisfied(0.0, &[]));
        assert!(!spec.strict_majority(0.0, &[]));
    }
}
