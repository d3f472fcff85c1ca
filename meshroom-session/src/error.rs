//! Error types for the session coordinator

use crate::types::PeerId;
use thiserror::Error;

/// Session error types
///
/// Only [`Error::Configuration`] is surfaced to callers as a hard failure.
/// Everything else is scoped to a single peer or a single operation and is
/// logged by the coordinator rather than propagated.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot open connection for signaling peer {peer_id}: {reason}")]
    UnknownPeerSignal { peer_id: PeerId, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel tag is reserved: {0}")]
    ReservedChannel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;
