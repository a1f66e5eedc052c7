//! Deterministic consensus scenarios.
//! A small in-test cluster shuttles RPCs between pure `RaftNode`s, so
//! election safety, log matching, partitions, and split votes run without
//! timers or networking. "Time" advances only when a test explicitly fires
//! an election or a heartbeat.

use std::collections::{HashSet, VecDeque};

use hive_consensus::{Outgoing, RaftNode, Step};
use hive_membership::VoterInfo;
use hive_protocol::{AgentId, Command, GroupState, RaftMessage, SwarmId};

struct Cluster {
    nodes: Vec<RaftNode>,
    queue: VecDeque<(AgentId, Outgoing)>,
    cut: HashSet<AgentId>,
}

impl Cluster {
    fn new(count: usize) -> Self {
        let swarm_id = SwarmId::new();
        let voters: Vec<VoterInfo> = (0..count)
            .map(|n| VoterInfo::new(agent(n), 1.0))
            .collect();
        let nodes = (0..count)
            .map(|n| RaftNode::new(agent(n), swarm_id, voters.clone(), false))
            .collect();
        Self {
            nodes,
            queue: VecDeque::new(),
            cut: HashSet::new(),
        }
    }

    /// Sever an agent from the rest of the cluster, both directions.
    fn partition(&mut self, n: usize) {
        self.cut.insert(agent(n));
    }

    fn heal(&mut self) {
        self.cut.clear();
    }

    fn send(&mut self, from: usize, step: Step) {
        for out in step.outgoing {
            self.queue.push_back((agent(from), out));
        }
    }

    /// Deliver queued messages until the cluster quiesces. Messages from
    /// or to a partitioned agent are dropped, matching a silent network.
    fn deliver_all(&mut self) {
        while let Some((from, out)) = self.queue.pop_front() {
            if self.cut.contains(&from) {
                continue;
            }
            let targets: Vec<usize> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| match &out.to {
                    Some(to) => node.id() == to,
                    None => node.id() != &from,
                })
                .map(|(i, _)| i)
                .collect();
            for i in targets {
                if self.cut.contains(self.nodes[i].id()) {
                    continue;
                }
                let step = self.nodes[i].handle(&from, out.message.clone()).unwrap();
                self.send(i, step);
            }
        }
    }

    fn elect(&mut self, n: usize) {
        let step = self.nodes[n].start_election();
        self.send(n, step);
        self.deliver_all();
    }

    fn heartbeat(&mut self, n: usize) {
        let step = self.nodes[n].tick_heartbeat();
        self.send(n, step);
        self.deliver_all();
    }

    fn propose(&mut self, n: usize, command: Command) {
        let (_, step) = self.nodes[n].propose(command).unwrap();
        self.send(n, step);
        self.deliver_all();
    }

    fn leaders(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.role() == GroupState::Leader)
            .map(|(i, _)| i)
            .collect()
    }
}

fn agent(n: usize) -> AgentId {
    AgentId::new(format!("node-{n}"))
}

fn cmd(tag: &str) -> Command {
    Command::SetState {
        key: tag.into(),
        value: serde_json::json!(true),
    }
}

// ─── Election safety ─────────────────────────────────────────────────────────

#[test]
fn test_at_most_one_leader_per_term() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);

    assert_eq!(cluster.leaders(), vec![0]);
    let term = cluster.nodes[0].current_term();
    for node in &cluster.nodes {
        assert_eq!(node.current_term(), term, "voters adopt the winner's term");
    }
}

#[test]
fn test_split_vote_resolves_on_next_timeout() {
    let mut cluster = Cluster::new(4);

    // Two candidates time out at once; route each candidate's request to a
    // single distinct voter so both end at 2 of 4 votes.
    let step0 = cluster.nodes[0].start_election();
    let step1 = cluster.nodes[1].start_election();
    let req0 = step0.outgoing[0].message.clone();
    let req1 = step1.outgoing[0].message.clone();

    let grant2 = cluster.nodes[2].handle(&agent(0), req0.clone()).unwrap();
    let grant3 = cluster.nodes[3].handle(&agent(1), req1.clone()).unwrap();
    // Rival candidates refuse each other; they already voted for themselves.
    cluster.nodes[1].handle(&agent(0), req0).unwrap();
    cluster.nodes[0].handle(&agent(1), req1).unwrap();

    for (voter, grant) in [(2usize, grant2), (3usize, grant3)] {
        let reply = grant.outgoing[0].message.clone();
        let candidate = match &reply {
            RaftMessage::RequestVoteReply(r) => {
                assert!(r.granted);
                if voter == 2 {
                    0
                } else {
                    1
                }
            }
            other => panic!("expected a vote reply, got {other:?}"),
        };
        cluster.nodes[candidate]
            .handle(&agent(voter), reply)
            .unwrap();
    }
    assert!(cluster.leaders().is_empty(), "2 of 4 is not a majority");

    // One candidate's randomized timeout fires first and wins the new term.
    cluster.elect(1);
    assert_eq!(cluster.leaders(), vec![1]);
    assert_eq!(cluster.nodes[1].current_term(), 2);
}

// ─── Partitions and commit safety ────────────────────────────────────────────

#[test]
fn test_minority_leader_cannot_commit() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);

    cluster.partition(1);
    cluster.partition(2);
    cluster.propose(0, cmd("isolated"));
    assert_eq!(
        cluster.nodes[0].commit_index(),
        0,
        "a leader cut off from the majority must not commit"
    );

    cluster.heal();
    cluster.heartbeat(0);
    assert_eq!(cluster.nodes[0].commit_index(), 1);
    assert_eq!(cluster.nodes[1].log().last_index(), 1);
}

#[test]
fn test_stale_leader_steps_down_after_heal() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);
    cluster.propose(0, cmd("before-split"));
    cluster.heartbeat(0);
    assert_eq!(cluster.nodes[2].commit_index(), 1);

    // The leader drops off; the majority side moves on to term 2.
    cluster.partition(0);
    cluster.elect(1);
    assert!(
        cluster.leaders().contains(&1),
        "the majority side elects a new leader"
    );
    cluster.propose(1, cmd("during-split"));
    assert_eq!(cluster.nodes[1].commit_index(), 2);

    // Back online, the deposed leader hears the higher term and yields.
    cluster.heal();
    cluster.heartbeat(1);
    assert_eq!(cluster.nodes[0].role(), GroupState::Follower);
    assert_eq!(cluster.leaders(), vec![1]);
    assert_eq!(cluster.nodes[0].commit_index(), 2);
}

#[test]
fn test_leader_crash_reelection_preserves_committed_entries() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);
    cluster.propose(0, cmd("survives"));
    cluster.heartbeat(0);

    // Crash: the old leader never comes back.
    cluster.partition(0);
    cluster.elect(2);
    assert_eq!(cluster.leaders().last(), Some(&2));

    cluster.propose(2, cmd("after-crash"));
    assert_eq!(cluster.nodes[2].commit_index(), 2);
    assert_eq!(
        cluster.nodes[2].log().entry(1).map(|e| &e.command),
        Some(&cmd("survives")),
        "the committed entry outlives its leader"
    );
}

// ─── Log matching ────────────────────────────────────────────────────────────

#[test]
fn test_divergent_suffix_is_overwritten_by_new_leader() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);
    cluster.propose(0, cmd("shared"));
    cluster.heartbeat(0);

    // The leader strands two uncommitted proposals behind a partition.
    cluster.partition(0);
    cluster.propose(0, cmd("stranded-1"));
    cluster.propose(0, cmd("stranded-2"));
    assert_eq!(cluster.nodes[0].log().last_index(), 3);
    assert_eq!(cluster.nodes[0].commit_index(), 1);

    // The majority elects node 1, which commits its own index 2.
    cluster.elect(1);
    cluster.propose(1, cmd("winner"));
    assert_eq!(cluster.nodes[1].commit_index(), 2);

    // On heal, node 0's conflicting suffix is truncated and replaced.
    cluster.heal();
    cluster.heartbeat(1);
    assert_eq!(cluster.nodes[0].log().entries(), cluster.nodes[1].log().entries());
    assert_eq!(
        cluster.nodes[0].log().entry(2).map(|e| &e.command),
        Some(&cmd("winner"))
    );
    assert_eq!(cluster.nodes[0].commit_index(), 2, "commit index is monotonic");
}

#[test]
fn test_lagging_follower_catches_up_after_heal() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);

    // Node 2 misses a batch of appends.
    cluster.partition(2);
    for i in 0..4 {
        cluster.propose(0, cmd(&format!("entry-{i}")));
    }
    assert_eq!(cluster.nodes[0].commit_index(), 4);
    assert_eq!(cluster.nodes[2].log().last_index(), 0);

    // The next heartbeat ships the suffix node 2 never saw.
    cluster.heal();
    cluster.heartbeat(0);
    assert_eq!(cluster.nodes[2].log().last_index(), 4);
    assert_eq!(cluster.nodes[2].commit_index(), 4);
    assert_eq!(cluster.nodes[2].log().entries(), cluster.nodes[0].log().entries());
}
