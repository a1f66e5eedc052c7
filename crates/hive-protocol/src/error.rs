//! Protocol-level errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid swarm configuration: {0}")]
    InvalidConfig(String),
}
