//! Hive integration tests.
//! These tests drive the coordinator facade end-to-end: swarm lifecycle,
//! consensus over the shared bus, quorum votes, messaging, and sweeps.

use std::sync::Arc;
use std::time::Duration;

use hive_bus::{EventLog, MessageBus};
use hive_coordinator::{CoordinatorConfig, SwarmCoordinator};
use hive_protocol::{
    AgentId, Command, GroupState, MemberStatus, MessagePriority, SwarmConfig, VoteStatus,
    VoteStrategy,
};
use hive_state::{JsonStore, MemoryStore};

fn fast_swarm_config(name: &str) -> SwarmConfig {
    let mut config = SwarmConfig::new(name);
    config.election_timeout_min_ms = 50;
    config.election_timeout_max_ms = 100;
    config.heartbeat_interval_ms = 20;
    // Wide health window so the background sweeper leaves quiet test
    // members alone; the sweep test narrows it explicitly.
    config.health_check_interval_ms = 60_000;
    config
}

async fn coordinator(
    agent: &str,
    bus: &MessageBus,
    events: &EventLog,
) -> SwarmCoordinator {
    SwarmCoordinator::start(
        AgentId::new(agent),
        CoordinatorConfig::default(),
        bus.clone(),
        events.clone(),
        Arc::new(MemoryStore::new()),
    )
    .await
    .unwrap()
}

async fn wait_for_leader(
    coordinators: &[&SwarmCoordinator],
    swarm_id: &hive_protocol::SwarmId,
) -> usize {
    for _ in 0..200 {
        for (i, c) in coordinators.iter().enumerate() {
            if let Ok(status) = c.swarm_status(swarm_id).await {
                if status.state == Some(GroupState::Leader) {
                    return i;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no leader elected within the test window");
}

fn set_state(key: &str, value: u64) -> Command {
    Command::SetState {
        key: key.into(),
        value: serde_json::json!(value),
    }
}

// ─── Swarm lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_swarm_elects_creator_and_commits() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;

    let swarm = a.create_swarm(fast_swarm_config("solo")).await.unwrap();
    wait_for_leader(&[&a], &swarm.id).await;

    let result = a
        .submit_command(&swarm.id, set_state("phase", 1), None)
        .await
        .unwrap();
    assert_eq!(result.index, 1, "first command lands at log index 1");

    let status = a.swarm_status(&swarm.id).await.unwrap();
    assert!(status.active);
    assert_eq!(status.member_count, 1);
    assert_eq!(status.leader, Some(AgentId::new("agent-a")));
    assert_eq!(status.commit_index, Some(1));

    let log = a.committed_log(&swarm.id).await.unwrap();
    assert_eq!(log.len(), 1, "committed prefix must contain the command");

    a.shutdown().await;
}

#[tokio::test]
async fn test_deactivated_swarm_stops_its_group() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let swarm = a.create_swarm(fast_swarm_config("retiring")).await.unwrap();
    wait_for_leader(&[&a], &swarm.id).await;

    a.deactivate_swarm(&swarm.id).await.unwrap();
    let status = a.swarm_status(&swarm.id).await.unwrap();
    assert!(!status.active);
    assert_eq!(status.state, None, "no consensus group after deactivation");

    let err = a
        .submit_command(&swarm.id, set_state("k", 1), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, hive_coordinator::CoordinatorError::NotJoined(_)),
        "submission must fail once the group is stopped"
    );
    a.shutdown().await;
}

// ─── Multi-node consensus ────────────────────────────────────────────────────

#[tokio::test]
async fn test_three_node_swarm_elects_one_leader_and_replicates() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let b = coordinator("agent-b", &bus, &events).await;
    let c = coordinator("agent-c", &bus, &events).await;
    let nodes = [&a, &b, &c];

    let swarm = a.create_swarm(fast_swarm_config("trio")).await.unwrap();
    // Each node keeps its own registry; tell every node about every member.
    for node in &nodes[1..] {
        node.register_swarm(swarm.clone()).await.unwrap();
    }
    for node in &nodes {
        for agent in ["agent-a", "agent-b", "agent-c"] {
            // Creating already joined agent-a on node a; join is idempotent.
            node.join_swarm(&swarm.id, AgentId::new(agent)).await.unwrap();
        }
    }

    let leader = wait_for_leader(&nodes, &swarm.id).await;
    let result = nodes[leader]
        .submit_command(&swarm.id, set_state("plan", 7), None)
        .await
        .unwrap();

    // Followers converge on the commit via heartbeats.
    let mut converged = false;
    for _ in 0..100 {
        let mut all = true;
        for node in &nodes {
            let status = node.swarm_status(&swarm.id).await.unwrap();
            if status.commit_index.unwrap_or(0) < result.index {
                all = false;
            }
        }
        if all {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(converged, "all nodes must observe the committed entry");

    let leader_count = {
        let mut count = 0;
        for node in &nodes {
            if node.swarm_status(&swarm.id).await.unwrap().state == Some(GroupState::Leader) {
                count += 1;
            }
        }
        count
    };
    assert_eq!(leader_count, 1, "exactly one leader at a time");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_leader_crash_triggers_reelection() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let b = coordinator("agent-b", &bus, &events).await;
    let c = coordinator("agent-c", &bus, &events).await;
    let nodes = [&a, &b, &c];

    let swarm = a.create_swarm(fast_swarm_config("failover")).await.unwrap();
    for node in &nodes[1..] {
        node.register_swarm(swarm.clone()).await.unwrap();
    }
    for node in &nodes {
        for agent in ["agent-a", "agent-b", "agent-c"] {
            node.join_swarm(&swarm.id, AgentId::new(agent)).await.unwrap();
        }
    }

    let leader = wait_for_leader(&nodes, &swarm.id).await;
    // "Crash" the leader: stop its whole coordinator.
    nodes[leader].shutdown().await;

    let survivors: Vec<&SwarmCoordinator> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, n)| *n)
        .collect();
    let new_leader = wait_for_leader(&survivors, &swarm.id).await;

    // The survivor leader still commands a majority (2 of 3).
    let result = survivors[new_leader]
        .submit_command(&swarm.id, set_state("after-failover", 1), None)
        .await
        .unwrap();
    assert!(result.index >= 1);

    for node in survivors {
        node.shutdown().await;
    }
}

// ─── Quorum voting ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_vote_lifecycle_simple_majority() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;

    let swarm = a.create_swarm(fast_swarm_config("ballot")).await.unwrap();
    a.join_swarm(&swarm.id, AgentId::new("agent-b")).await.unwrap();
    a.join_swarm(&swarm.id, AgentId::new("agent-c")).await.unwrap();

    let vote = a
        .open_vote(
            &swarm.id,
            vec!["north".into(), "south".into()],
            VoteStrategy::SimpleMajority,
            None,
            Some(60),
            Some(AgentId::new("agent-a")),
        )
        .await
        .unwrap();

    a.cast_vote(&vote.id, AgentId::new("agent-a"), "north", Some(0.9), None)
        .await
        .unwrap();
    let outcome = a
        .cast_vote(
            &vote.id,
            AgentId::new("agent-b"),
            "north",
            Some(0.6),
            Some("safer route".into()),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, VoteStatus::Closed, "2 of 3 closes the vote");

    let closed = a.vote(&vote.id).await.unwrap();
    assert_eq!(
        closed.result,
        Some(hive_protocol::VoteResult::Winner {
            option: "north".into()
        })
    );

    // A late ballot is refused.
    let err = a
        .cast_vote(&vote.id, AgentId::new("agent-c"), "south", None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        hive_coordinator::CoordinatorError::Vote(hive_voting::VoteError::VoteClosed(_))
    ));

    let executed = a.mark_vote_executed(&vote.id).await.unwrap();
    assert_eq!(executed.status, VoteStatus::Executed);

    let responses = a.vote_responses(&vote.id).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].rationale.as_deref(), Some("safer route"));

    a.shutdown().await;
}

#[tokio::test]
async fn test_vote_expires_without_quorum() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let swarm = a.create_swarm(fast_swarm_config("stalled")).await.unwrap();
    a.join_swarm(&swarm.id, AgentId::new("agent-b")).await.unwrap();
    a.join_swarm(&swarm.id, AgentId::new("agent-c")).await.unwrap();

    let vote = a
        .open_vote(
            &swarm.id,
            vec!["yes".into(), "no".into()],
            VoteStrategy::SimpleMajority,
            Some(0.9),
            Some(0),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    a.run_sweep().await.unwrap();

    let expired = a.vote(&vote.id).await.unwrap();
    assert_eq!(expired.status, VoteStatus::Closed);
    assert_eq!(
        expired.result,
        Some(hive_protocol::VoteResult::NoQuorum),
        "an expired vote without quorum reports no_quorum"
    );

    let swarm_events = a.events(&swarm.id).await;
    assert!(
        swarm_events.iter().any(|e| e.event_type == "vote.expired"),
        "expiry must be recorded on the event log"
    );
    a.shutdown().await;
}

// ─── Messaging and events ────────────────────────────────────────────────────

#[tokio::test]
async fn test_messaging_between_coordinators() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let b = coordinator("agent-b", &bus, &events).await;

    let mut inbox = b.subscribe("hive.tasks").await;
    let sent = a
        .publish(
            "hive.tasks",
            serde_json::json!({ "task": "scout" }),
            None,
            MessagePriority::Normal,
            Some(60),
        )
        .await
        .unwrap();

    let received = inbox.recv().await.expect("subscriber must receive");
    assert_eq!(received.id, sent.id);
    assert_eq!(received.content["task"], "scout");

    let acked = b.ack_message(&received.id).await.unwrap();
    assert!(acked.delivered, "first ack latches the delivered flag");
    let read = b.mark_message_read(&received.id).await.unwrap();
    assert!(read.read && read.delivered, "read implies delivered");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_replays_unacked_messages() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let b = coordinator("agent-b", &bus, &events).await;

    let sent = a
        .publish(
            "hive.briefings",
            serde_json::json!({ "n": 1 }),
            None,
            MessagePriority::Normal,
            Some(60),
        )
        .await
        .unwrap();

    // Late subscriber still gets the pending message.
    let mut inbox = b.subscribe("hive.briefings").await;
    let received = inbox.recv().await.expect("replay must deliver");
    assert_eq!(received.id, sent.id);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_swarm_channel_chatter() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let b = coordinator("agent-b", &bus, &events).await;
    let swarm = a.create_swarm(fast_swarm_config("chatter")).await.unwrap();

    let mut inbox = b.subscribe_to_swarm(&swarm.id).await;
    a.publish_to_swarm(
        &swarm.id,
        serde_json::json!({ "announcement": "rally" }),
        MessagePriority::Low,
        Some(30),
    )
    .await
    .unwrap();

    let received = inbox.recv().await.expect("swarm channel must deliver");
    assert_eq!(received.sender, Some(AgentId::new("agent-a")));
    assert_eq!(received.content["announcement"], "rally");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_event_propagation_is_idempotent() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let swarm = a.create_swarm(fast_swarm_config("gossip")).await.unwrap();

    let event = a
        .emit_event(
            &swarm.id,
            "anomaly.detected",
            serde_json::json!({ "sector": 4 }),
            false,
        )
        .await
        .unwrap();

    assert!(a.propagate_event(&swarm.id, &event.id).await.unwrap());
    assert!(
        !a.propagate_event(&swarm.id, &event.id).await.unwrap(),
        "second propagation by the same agent is a no-op"
    );
    a.shutdown().await;
}

// ─── Liveness sweep ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sweep_marks_silent_members_inactive() {
    let bus = MessageBus::new();
    let events = EventLog::new();
    let a = coordinator("agent-a", &bus, &events).await;
    let mut config = fast_swarm_config("watch");
    config.health_check_interval_ms = 50;
    let swarm = a.create_swarm(config).await.unwrap();
    a.join_swarm(&swarm.id, AgentId::new("agent-x")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    // Keep the local agent alive; agent-x stays silent.
    a.heartbeat(&swarm.id, &AgentId::new("agent-a")).await.unwrap();
    a.run_sweep().await.unwrap();

    let memberships = a.memberships(&swarm.id).await.unwrap();
    let x = memberships
        .iter()
        .find(|m| m.agent_id == AgentId::new("agent-x"))
        .expect("membership row survives the sweep");
    assert_eq!(x.status, MemberStatus::Inactive, "silent member is swept");

    let alive = memberships
        .iter()
        .find(|m| m.agent_id == AgentId::new("agent-a"))
        .unwrap();
    assert_eq!(alive.status, MemberStatus::Active);

    let swarm_events = a.events(&swarm.id).await;
    assert!(swarm_events.iter().any(|e| e.event_type == "membership.swept"));
    a.shutdown().await;
}

// ─── Durable restart ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_restores_swarm_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MessageBus::new();
    let events = EventLog::new();
    let store = Arc::new(JsonStore::new(dir.path()).unwrap());

    let swarm = {
        let a = SwarmCoordinator::start(
            AgentId::new("agent-a"),
            CoordinatorConfig::default(),
            bus.clone(),
            events.clone(),
            store.clone(),
        )
        .await
        .unwrap();
        let swarm = a.create_swarm(fast_swarm_config("durable")).await.unwrap();
        wait_for_leader(&[&a], &swarm.id).await;
        a.submit_command(&swarm.id, set_state("k", 1), None)
            .await
            .unwrap();
        a.shutdown().await;
        swarm
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let a = SwarmCoordinator::start(
        AgentId::new("agent-a"),
        CoordinatorConfig::default(),
        MessageBus::new(),
        EventLog::new(),
        store,
    )
    .await
    .unwrap();
    wait_for_leader(&[&a], &swarm.id).await;
    let status = a.swarm_status(&swarm.id).await.unwrap();
    assert_eq!(status.name, "durable");
    assert!(
        status.commit_index.unwrap_or(0) >= 1,
        "committed entry must survive the restart"
    );
    a.shutdown().await;
}

#[tokio::test]
async fn test_restart_restores_messages_votes_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStore::new(dir.path()).unwrap());

    let (swarm, vote_id, msg_id) = {
        let bus = MessageBus::with_store(store.clone()).unwrap();
        let events = EventLog::with_store(store.clone()).unwrap();
        let a = SwarmCoordinator::start(
            AgentId::new("agent-a"),
            CoordinatorConfig::default(),
            bus,
            events,
            store.clone(),
        )
        .await
        .unwrap();
        let swarm = a
            .create_swarm(fast_swarm_config("full-restore"))
            .await
            .unwrap();
        wait_for_leader(&[&a], &swarm.id).await;
        a.join_swarm(&swarm.id, AgentId::new("agent-b"))
            .await
            .unwrap();

        let vote = a
            .open_vote(
                &swarm.id,
                vec!["A".into(), "B".into()],
                VoteStrategy::SimpleMajority,
                None,
                Some(300),
                None,
            )
            .await
            .unwrap();
        a.cast_vote(&vote.id, AgentId::new("agent-a"), "A", None, None)
            .await
            .unwrap();

        let msg = a
            .publish(
                "ops",
                serde_json::json!("unfinished"),
                None,
                MessagePriority::Normal,
                None,
            )
            .await
            .unwrap();
        a.shutdown().await;
        (swarm, vote.id, msg.id)
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bus = MessageBus::with_store(store.clone()).unwrap();
    let events = EventLog::with_store(store.clone()).unwrap();
    let a = SwarmCoordinator::start(
        AgentId::new("agent-a"),
        CoordinatorConfig::default(),
        bus,
        events,
        store,
    )
    .await
    .unwrap();

    // The unacked message replays to a resubscriber on the fresh node.
    let mut sub = a.subscribe("ops").await;
    assert_eq!(sub.recv().await.unwrap().id, msg_id);

    // The vote is open again with its earlier response intact.
    let vote = a.vote(&vote_id).await.unwrap();
    assert_eq!(vote.status, VoteStatus::Open);
    assert_eq!(a.vote_responses(&vote_id).await.unwrap().len(), 1);
    let outcome = a
        .cast_vote(&vote_id, AgentId::new("agent-b"), "A", None, None)
        .await
        .unwrap();
    assert!(
        outcome.result.is_some(),
        "pre-restart response must count toward quorum"
    );

    // Emission history came back with the store too.
    let history = a.events(&swarm.id).await;
    assert!(history.iter().any(|e| e.event_type == "swarm.created"));

    a.shutdown().await;
}
