//! Persistent publish/subscribe message bus.
//!
//! Guarantees:
//! - Messages on one channel reach a given subscriber in publish order.
//!   No cross-channel ordering is promised.
//! - At-least-once: a message is replayed to a resubscribing agent until
//!   that agent acknowledges it.
//! - Messages past their TTL are pruned and never delivered to new
//!   subscribers; copies already handed out are unaffected.
//! - `delivered` and `read` latch on first acknowledgment and are never
//!   reset; `read` implies `delivered`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use hive_protocol::{AgentId, Message, MessageId, MessagePriority};
use hive_state::SwarmStore;

use crate::BusError;

struct StoredMessage {
    record: Message,
    /// Agents that acknowledged delivery; drives resubscribe replay.
    acked_by: HashSet<AgentId>,
}

struct SubscriberEntry {
    agent: AgentId,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct ChannelState {
    /// Publish order; per-subscriber mpsc queues preserve it downstream.
    messages: Vec<StoredMessage>,
    subscribers: HashMap<Uuid, SubscriberEntry>,
}

#[derive(Default)]
struct BusInner {
    channels: HashMap<String, ChannelState>,
    /// Message id -> owning channel, for ack/read lookups.
    index: HashMap<MessageId, String>,
}

/// An owned channel subscription. Receives messages via [`recv`]; dropping
/// it (or calling [`MessageBus::unsubscribe`]) ends delivery.
///
/// [`recv`]: Subscription::recv
pub struct Subscription {
    pub id: Uuid,
    pub channel: String,
    pub agent: AgentId,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Next message on the channel, in publish order. `None` once the
    /// subscription has been cancelled.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by pollers.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// The message bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<RwLock<BusInner>>,
    store: Option<Arc<dyn SwarmStore>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BusInner::default())),
            store: None,
        }
    }

    /// Bus that persists message records (and their flag updates) through
    /// the given store.
    ///
    /// Unexpired persisted messages are reloaded so subscribers attached
    /// after a restart still receive anything published before it.
    /// Per-agent acknowledgments are process-local; the one case the
    /// record itself settles is a delivered directed message, which is not
    /// replayed to its recipient again. Broadcast redelivery after a
    /// restart stays within at-least-once semantics.
    pub fn with_store(store: Arc<dyn SwarmStore>) -> Result<Self, BusError> {
        let mut inner = BusInner::default();
        let now = Utc::now();
        let mut records = store.load_all_messages()?;
        records.sort_by_key(|m| m.published_at);
        for record in records {
            if record.is_expired(now) {
                continue;
            }
            let mut acked_by = HashSet::new();
            if record.delivered {
                if let Some(recipient) = &record.recipient {
                    acked_by.insert(recipient.clone());
                }
            }
            inner.index.insert(record.id, record.channel.clone());
            inner
                .channels
                .entry(record.channel.clone())
                .or_default()
                .messages
                .push(StoredMessage { record, acked_by });
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            store: Some(store),
        })
    }

    /// Publish a message. `recipient = None` broadcasts to every channel
    /// subscriber; `ttl_secs = Some(0)` expires the message immediately so
    /// it is never delivered.
    pub async fn publish(
        &self,
        channel: &str,
        content: serde_json::Value,
        sender: Option<AgentId>,
        recipient: Option<AgentId>,
        priority: MessagePriority,
        ttl_secs: Option<i64>,
    ) -> Result<Message, BusError> {
        let now = Utc::now();
        let record = Message {
            id: MessageId::new(),
            channel: channel.to_string(),
            sender,
            recipient,
            content,
            priority,
            published_at: now,
            expires_at: ttl_secs.map(|ttl| now + Duration::seconds(ttl)),
            delivered: false,
            delivered_at: None,
            read: false,
            read_at: None,
        };

        if let Some(store) = &self.store {
            store.save_message(&record)?;
        }

        let mut inner = self.inner.write().await;
        inner.index.insert(record.id, channel.to_string());
        let state = inner.channels.entry(channel.to_string()).or_default();

        let mut stale = Vec::new();
        if !record.is_expired(now) {
            for (sub_id, sub) in &state.subscribers {
                if record.addressed_to(&sub.agent) && sub.tx.send(record.clone()).is_err() {
                    stale.push(*sub_id);
                }
            }
        }
        for sub_id in stale {
            state.subscribers.remove(&sub_id);
        }

        state.messages.push(StoredMessage {
            record: record.clone(),
            acked_by: HashSet::new(),
        });

        tracing::debug!(
            channel,
            message_id = %record.id,
            broadcast = record.recipient.is_none(),
            "Message published"
        );
        Ok(record)
    }

    /// Subscribe an agent to a channel.
    ///
    /// Unexpired messages the agent has not yet acknowledged are replayed
    /// first (at-least-once across consumer restarts), then live messages
    /// follow in publish order.
    pub async fn subscribe(&self, channel: &str, agent: AgentId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut inner = self.inner.write().await;
        let state = inner.channels.entry(channel.to_string()).or_default();

        let mut replayed = 0usize;
        for stored in &state.messages {
            if stored.record.is_expired(now)
                || !stored.record.addressed_to(&agent)
                || stored.acked_by.contains(&agent)
            {
                continue;
            }
            if tx.send(stored.record.clone()).is_ok() {
                replayed += 1;
            }
        }

        state.subscribers.insert(
            id,
            SubscriberEntry {
                agent: agent.clone(),
                tx,
            },
        );

        tracing::debug!(channel, agent = %agent, replayed, "Subscriber attached");
        Subscription {
            id,
            channel: channel.to_string(),
            agent,
            rx,
        }
    }

    /// Detach a subscription. Pending queued messages stay readable on the
    /// returned receiver until it is dropped.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.channels.get_mut(&subscription.channel) {
            state.subscribers.remove(&subscription.id);
        }
    }

    /// Acknowledge delivery of a message to an agent. Latches `delivered`.
    pub async fn ack(&self, message_id: &MessageId, agent: &AgentId) -> Result<Message, BusError> {
        self.latch_flags(message_id, agent, false).await
    }

    /// Mark a message read by an agent. Implies delivery.
    pub async fn mark_read(
        &self,
        message_id: &MessageId,
        agent: &AgentId,
    ) -> Result<Message, BusError> {
        self.latch_flags(message_id, agent, true).await
    }

    async fn latch_flags(
        &self,
        message_id: &MessageId,
        agent: &AgentId,
        read: bool,
    ) -> Result<Message, BusError> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .index
            .get(message_id)
            .cloned()
            .ok_or(BusError::UnknownMessage(*message_id))?;
        let state = inner
            .channels
            .get_mut(&channel)
            .ok_or(BusError::UnknownMessage(*message_id))?;
        let stored = state
            .messages
            .iter_mut()
            .find(|m| m.record.id == *message_id)
            .ok_or(BusError::UnknownMessage(*message_id))?;

        let now = Utc::now();
        stored.acked_by.insert(agent.clone());
        if !stored.record.delivered {
            stored.record.delivered = true;
            stored.record.delivered_at = Some(now);
        }
        if read && !stored.record.read {
            stored.record.read = true;
            stored.record.read_at = Some(now);
        }

        let record = stored.record.clone();
        if let Some(store) = &self.store {
            store.save_message(&record)?;
        }
        Ok(record)
    }

    /// Drop expired messages from every channel. Returns how many were
    /// pruned. Copies already sitting in subscriber queues are unaffected.
    pub async fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut pruned = 0usize;
        let mut dropped_ids = Vec::new();
        for state in inner.channels.values_mut() {
            state.messages.retain(|m| {
                if m.record.is_expired(now) {
                    dropped_ids.push(m.record.id);
                    pruned += 1;
                    false
                } else {
                    true
                }
            });
        }
        for id in dropped_ids {
            inner.index.remove(&id);
        }
        if pruned > 0 {
            tracing::debug!(pruned, "Expired messages pruned");
        }
        pruned
    }

    /// Current record state of a message.
    pub async fn message(&self, message_id: &MessageId) -> Result<Message, BusError> {
        let inner = self.inner.read().await;
        let channel = inner
            .index
            .get(message_id)
            .ok_or(BusError::UnknownMessage(*message_id))?;
        inner
            .channels
            .get(channel)
            .and_then(|state| state.messages.iter().find(|m| m.record.id == *message_id))
            .map(|m| m.record.clone())
            .ok_or(BusError::UnknownMessage(*message_id))
    }
}
