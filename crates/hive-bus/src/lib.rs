//! Message bus and event log for the Hive coordination core.
//!
//! The bus gives at-least-once, per-channel-ordered delivery with TTL
//! expiry and delivery/read acknowledgment. The consensus engine rides on
//! it for Raft RPC traffic; collaborators use it for general swarm chatter.
//! The event log is the append-only record of swarm-wide occurrences.

pub mod bus;
pub mod events;

pub use bus::{MessageBus, Subscription};
pub use events::EventLog;

use hive_protocol::{EventId, MessageId};
use hive_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("unknown event {0}")]
    UnknownEvent(EventId),

    #[error(transparent)]
    State(#[from] StateError),
}
