//! Rendezvous service boundary
//!
//! The rendezvous (signaling) transport itself lives outside this crate.
//! Implementations push inbound events into the channel returned by
//! [`SignalingClient::open`] and queue outbound requests without blocking.

use crate::error::Result;
use crate::types::PeerId;
use crate::user::LocalUser;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Negotiation payload exchanged through the rendezvous service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u32>,
    },
}

impl SignalPayload {
    /// Session description text carried by offers and answers
    #[must_use]
    pub fn sdp(&self) -> Option<&str> {
        match self {
            Self::Offer { sdp } | Self::Answer { sdp } => Some(sdp),
            Self::Candidate { .. } => None,
        }
    }

    /// Rewrite the session description; candidates pass through
    #[must_use]
    pub fn map_sdp(self, f: impl FnOnce(&str) -> String) -> Self {
        match self {
            Self::Offer { sdp } => Self::Offer { sdp: f(&sdp) },
            Self::Answer { sdp } => Self::Answer { sdp: f(&sdp) },
            candidate @ Self::Candidate { .. } => candidate,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

/// STUN/TURN server advertised by the rendezvous service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE configuration handed to every new connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

impl IceConfig {
    /// Configuration from a roster; no list means no relay servers
    #[must_use]
    pub fn from_roster(servers: Option<Vec<IceServer>>) -> Self {
        Self {
            ice_servers: servers.unwrap_or_default(),
        }
    }
}

/// Events delivered by the rendezvous service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Room roster after a join, including our own id
    Ready {
        self_id: PeerId,
        peer_ids: Vec<PeerId>,
        ice_servers: Option<Vec<IceServer>>,
    },
    /// Negotiation payload relayed from a peer
    Signal {
        peer_id: PeerId,
        payload: SignalPayload,
    },
    /// The rendezvous transport re-established itself
    Reconnect,
}

/// Client side of the rendezvous service
pub trait SignalingClient: Send + Sync {
    /// Connect to the service; inbound events arrive on the returned channel
    fn open(&self, server_address: &str) -> Result<mpsc::UnboundedReceiver<SignalingEvent>>;

    /// Ask to join `room`, announcing the local user
    fn join(&self, room: &str, user: &LocalUser) -> Result<()>;

    /// Relay a negotiation payload to `target`
    fn signal(&self, target: &PeerId, payload: &SignalPayload) -> Result<()>;

    /// Close the connection to the service
    fn close(&self);
}
