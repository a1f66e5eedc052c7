//! Append-only event log with loop-safe propagation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use hive_protocol::{AgentId, Event, EventId, SwarmId};
use hive_state::SwarmStore;

use crate::BusError;

/// Append-only record of swarm-wide occurrences (membership changes,
/// consensus transitions, vote outcomes). Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<HashMap<SwarmId, Vec<Event>>>>,
    store: Option<Arc<dyn SwarmStore>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            store: None,
        }
    }

    /// Event log seeded from the store, so emission history survives a
    /// node restart.
    pub fn with_store(store: Arc<dyn SwarmStore>) -> Result<Self, BusError> {
        let mut by_swarm: HashMap<SwarmId, Vec<Event>> = HashMap::new();
        let mut all = store.load_all_events()?;
        all.sort_by_key(|e| e.occurred_at);
        for event in all {
            by_swarm.entry(event.swarm_id).or_default().push(event);
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(by_swarm)),
            store: Some(store),
        })
    }

    /// Append an event.
    pub async fn emit(
        &self,
        swarm_id: SwarmId,
        event_type: &str,
        event_data: serde_json::Value,
        source: Option<AgentId>,
        is_global: bool,
    ) -> Result<Event, BusError> {
        let event = Event {
            id: EventId::new(),
            swarm_id,
            event_type: event_type.to_string(),
            event_data,
            source,
            is_global,
            occurred_at: Utc::now(),
            propagation_path: Vec::new(),
            processed_by: BTreeSet::new(),
        };

        if let Some(store) = &self.store {
            store.save_event(&event)?;
        }

        tracing::debug!(swarm_id = %swarm_id, event_type, "Event emitted");
        self.inner
            .write()
            .await
            .entry(swarm_id)
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    /// Record that `via_agent` forwarded the event.
    ///
    /// Idempotent: if the agent is already in `processed_by` the call is a
    /// no-op returning `false`, which breaks forwarding cycles in cyclic
    /// membership topologies.
    pub async fn propagate(
        &self,
        swarm_id: &SwarmId,
        event_id: &EventId,
        via_agent: AgentId,
    ) -> Result<bool, BusError> {
        let mut inner = self.inner.write().await;
        let event = inner
            .get_mut(swarm_id)
            .and_then(|events| events.iter_mut().find(|e| e.id == *event_id))
            .ok_or(BusError::UnknownEvent(*event_id))?;

        if !event.processed_by.insert(via_agent.clone()) {
            return Ok(false);
        }
        event.propagation_path.push(via_agent);

        if let Some(store) = &self.store {
            store.save_event(event)?;
        }
        Ok(true)
    }

    /// All events for a swarm, in emission order.
    pub async fn events(&self, swarm_id: &SwarmId) -> Vec<Event> {
        self.inner
            .read()
            .await
            .get(swarm_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Events that occurred at or after `since`, for incremental consumers.
    pub async fn events_since(&self, swarm_id: &SwarmId, since: DateTime<Utc>) -> Vec<Event> {
        self.inner
            .read()
            .await
            .get(swarm_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.occurred_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_appends_in_order() {
        let log = EventLog::new();
        let swarm_id = SwarmId::new();
        log.emit(swarm_id, "member.joined", serde_json::json!({"agent": "a1"}), None, false)
            .await
            .unwrap();
        log.emit(swarm_id, "member.joined", serde_json::json!({"agent": "a2"}), None, false)
            .await
            .unwrap();

        let events = log.events(&swarm_id).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_data["agent"], "a1");
        assert_eq!(events[1].event_data["agent"], "a2");
    }

    #[tokio::test]
    async fn test_propagate_is_idempotent() {
        let log = EventLog::new();
        let swarm_id = SwarmId::new();
        let event = log
            .emit(swarm_id, "leader.elected", serde_json::json!({}), None, true)
            .await
            .unwrap();

        let via = AgentId::new("fwd");
        assert!(log.propagate(&swarm_id, &event.id, via.clone()).await.unwrap());
        // Second forward through the same agent is a no-op.
        assert!(!log.propagate(&swarm_id, &event.id, via.clone()).await.unwrap());

        let events = log.events(&swarm_id).await;
        assert_eq!(events[0].propagation_path, vec![via.clone()]);
        assert_eq!(events[0].processed_by.len(), 1);
    }

    #[tokio::test]
    async fn test_propagation_path_keeps_forward_order() {
        let log = EventLog::new();
        let swarm_id = SwarmId::new();
        let event = log
            .emit(swarm_id, "vote.closed", serde_json::json!({}), None, true)
            .await
            .unwrap();

        for name in ["a1", "a2", "a3"] {
            log.propagate(&swarm_id, &event.id, AgentId::new(name))
                .await
                .unwrap();
        }

        let events = log.events(&swarm_id).await;
        let path: Vec<String> = events[0]
            .propagation_path
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(path, vec!["a1", "a2", "a3"]);
    }

    #[tokio::test]
    async fn test_unknown_event_rejected() {
        let log = EventLog::new();
        let swarm_id = SwarmId::new();
        let result = log
            .propagate(&swarm_id, &EventId::new(), AgentId::new("a1"))
            .await;
        assert!(matches!(result, Err(BusError::UnknownEvent(_))));
    }

    #[tokio::test]
    async fn test_event_history_survives_restart() {
        use hive_state::MemoryStore;

        let store = Arc::new(MemoryStore::new());
        let swarm_id = SwarmId::new();
        let event_id = {
            let log = EventLog::with_store(store.clone()).unwrap();
            let event = log
                .emit(swarm_id, "swarm.created", serde_json::json!({}), None, true)
                .await
                .unwrap();
            log.propagate(&swarm_id, &event.id, AgentId::new("fwd"))
                .await
                .unwrap();
            event.id
        };

        let log = EventLog::with_store(store).unwrap();
        let events = log.events(&swarm_id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event_id);
        // Propagation record came back too, so the idempotency guard holds.
        assert!(!log
            .propagate(&swarm_id, &event_id, AgentId::new("fwd"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_events_since_filters_by_time() {
        let log = EventLog::new();
        let swarm_id = SwarmId::new();
        log.emit(swarm_id, "old", serde_json::json!({}), None, false)
            .await
            .unwrap();
        let cutoff = Utc::now();
        log.emit(swarm_id, "new", serde_json::json!({}), None, false)
            .await
            .unwrap();

        let recent = log.events_since(&swarm_id, cutoff).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_type, "new");
    }
}
