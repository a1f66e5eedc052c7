//! Hive Protocol - Core types and message definitions
//!
//! Defines the shared vocabulary of the swarm coordination core: the six
//! persisted record types (swarm, membership, consensus group + log entry,
//! vote, message, event), the Raft RPC messages carried over the message
//! bus, and the protocol constants.

pub mod constants;
pub mod error;
pub mod messages;
pub mod types;

pub use constants::*;
pub use error::*;
pub use messages::*;
pub use types::*;
