//! Durable state for the Hive coordination core.
//!
//! The six logical records (swarm, membership, consensus group, log entry,
//! vote, message, event) are persisted through the [`SwarmStore`] trait. A
//! restarted node reconstructs its consensus engine purely from the stored
//! group record plus its log entries; the JSON backend checksums every log
//! entry so corruption (a gap or a mismatched term at a committed index) is
//! detected at load instead of silently violating log matching.

pub mod json_store;
pub mod memory;
pub mod store;

pub use json_store::JsonStore;
pub use memory::MemoryStore;
pub use store::{verify_log, SwarmStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt persisted state: {0}")]
    Corrupt(String),
}
