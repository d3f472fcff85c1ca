//! Connection transport boundary
//!
//! ICE, DTLS and the media/data transport are provided by an external
//! implementation of [`TransportFactory`]. Each created [`PeerTransport`]
//! reports back through a [`PeerEventSink`], a non-owning handle that tags
//! every event with the peer id so the coordinator can look the record up.

use crate::error::Result;
use crate::media::MediaStream;
use crate::sdp::SdpTransform;
use crate::signaling::{IceConfig, SignalPayload};
use crate::types::{ConnectionRole, PeerId, StreamId};
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Options used to construct a connection
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    /// Relay servers from the latest roster
    pub ice: IceConfig,
    /// Caller supplied transport options, forwarded untouched
    pub extra: serde_json::Value,
    /// Rewrite applied to locally generated offers and answers
    pub sdp_transform: Option<SdpTransform>,
    /// Local streams attached at construction
    pub streams: Vec<MediaStream>,
}

impl ConnectionOptions {
    /// Apply the configured rewrite to an outbound payload
    #[must_use]
    pub fn shape_outbound(&self, payload: SignalPayload) -> SignalPayload {
        match &self.sdp_transform {
            Some(transform) => payload.map_sdp(|sdp| transform(sdp)),
            None => payload,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("ice", &self.ice)
            .field("extra", &self.extra)
            .field("sdp_transform", &self.sdp_transform.is_some())
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Handle to one point-to-point connection
pub trait PeerTransport: Send {
    /// Feed an inbound negotiation payload
    fn signal(&mut self, payload: SignalPayload) -> Result<()>;

    fn add_stream(&mut self, stream: &MediaStream) -> Result<()>;

    fn remove_stream(&mut self, stream: &MediaStream) -> Result<()>;

    /// Enable or disable one outbound track of a local stream
    fn set_track_enabled(&mut self, stream_id: &StreamId, track_id: &str, enabled: bool) -> Result<()>;

    /// Send over the established data channel
    fn send(&mut self, data: Bytes) -> Result<()>;

    /// Release the connection; must tolerate repeated calls
    fn destroy(&mut self);
}

/// Builds connections for new peer records
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        peer_id: &PeerId,
        role: ConnectionRole,
        options: ConnectionOptions,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>>;
}

/// What a transport reports about its connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// Locally generated negotiation payload to relay to the peer
    Signal(SignalPayload),
    /// Data channel is open
    Connect,
    /// Remote stream arrived
    Stream(MediaStream),
    /// Remote stream ended
    StreamRemoved(StreamId),
    /// Data channel message
    Data(Bytes),
    /// Connection closed, by either side
    Close,
    /// Transport failure; a `Close` is expected to follow
    Error(String),
}

/// Transport event tagged with the reporting peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer_id: PeerId,
    pub kind: PeerEventKind,
}

/// Non-owning path from a transport back to the coordinator
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    #[must_use]
    pub const fn new(peer_id: PeerId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { peer_id, tx }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Report an event; dropped silently once the session is gone
    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            peer_id: self.peer_id.clone(),
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(peer_id = %self.peer_id, "Session gone, dropping transport event");
        }
    }
}
