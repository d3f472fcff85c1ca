//! Remote participant management
//!
//! This module handles:
//! - Connection handle ownership and teardown
//! - Remote stream and stream metadata registries
//! - Per-peer message statistics
//! - The peer registry, keyed uniquely by peer id

use crate::error::{Error, Result};
use crate::media::{MediaStream, StreamInfo};
use crate::signaling::SignalPayload;
use crate::transport::PeerTransport;
use crate::types::{ConnectionRole, PeerId, StreamId};
use crate::user::LocalUser;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Negotiating through the rendezvous service
    Connecting,
    /// Data channel open
    Connected,
    /// Destroyed locally or closed by the transport
    Closed,
}

/// Per-peer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Negotiation payloads fed into the connection
    pub signals_received: u64,

    /// Data channel messages sent to this peer
    pub messages_sent: u64,

    /// Bytes sent to this peer
    pub bytes_sent: u64,

    /// Data channel messages received from this peer
    pub messages_received: u64,

    /// Bytes received from this peer
    pub bytes_received: u64,
}

/// One remote participant and the connection to it
pub struct PeerConnection {
    id: PeerId,
    role: ConnectionRole,
    state: PeerState,

    /// Exclusively owned connection handle
    transport: Box<dyn PeerTransport>,

    /// Streams the peer is publishing to us
    streams: IndexMap<StreamId, MediaStream>,

    /// Metadata for the peer's streams, replicated through the user info channel
    stream_info: IndexMap<StreamId, StreamInfo>,

    /// The peer's replicated profile
    profile: Option<LocalUser>,

    stats: PeerStats,
}

impl PeerConnection {
    #[must_use]
    pub fn new(id: PeerId, role: ConnectionRole, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            id,
            role,
            state: PeerState::Connecting,
            transport,
            streams: IndexMap::new(),
            stream_info: IndexMap::new(),
            profile: None,
            stats: PeerStats::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn role(&self) -> ConnectionRole {
        self.role
    }

    #[must_use]
    pub const fn state(&self) -> PeerState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Feed an inbound negotiation payload into the connection
    pub fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        self.stats.signals_received += 1;
        self.transport.signal(payload)
    }

    /// Mirror a local stream onto the connection
    pub fn add_stream(&mut self, stream: &MediaStream) -> Result<()> {
        self.transport.add_stream(stream)
    }

    pub fn remove_stream(&mut self, stream: &MediaStream) -> Result<()> {
        self.transport.remove_stream(stream)
    }

    pub fn set_track_enabled(&mut self, stream_id: &StreamId, track_id: &str, enabled: bool) -> Result<()> {
        self.transport.set_track_enabled(stream_id, track_id, enabled)
    }

    /// Send over the data channel; fails until the peer is connected
    pub fn send(&mut self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected(self.id.clone()));
        }
        let len = data.len() as u64;
        self.transport.send(data)?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    /// Release the connection; repeated calls are no-ops
    pub fn destroy(&mut self) {
        if self.state == PeerState::Closed {
            return;
        }
        self.state = PeerState::Closed;
        self.transport.destroy();
        debug!(peer_id = %self.id, "Peer connection destroyed");
    }

    #[must_use]
    pub const fn stats(&self) -> &PeerStats {
        &self.stats
    }

    /// Remote streams in arrival order
    pub fn remote_streams(&self) -> impl Iterator<Item = &MediaStream> {
        self.streams.values()
    }

    #[must_use]
    pub fn remote_stream_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn stream_info(&self, stream_id: &StreamId) -> Option<&StreamInfo> {
        self.stream_info.get(stream_id)
    }

    #[must_use]
    pub const fn profile(&self) -> Option<&LocalUser> {
        self.profile.as_ref()
    }

    pub(crate) fn mark_connected(&mut self) {
        if self.state == PeerState::Connecting {
            self.state = PeerState::Connected;
        }
    }

    pub(crate) fn record_received(&mut self, len: usize) {
        self.stats.messages_received += 1;
        self.stats.bytes_received += len as u64;
    }

    pub(crate) fn insert_remote_stream(&mut self, stream: MediaStream) {
        self.streams.insert(stream.id.clone(), stream);
    }

    pub(crate) fn remove_remote_stream(&mut self, stream_id: &StreamId) -> Option<MediaStream> {
        self.streams.shift_remove(stream_id)
    }

    /// Replace the peer's stream metadata with a freshly replicated profile
    pub(crate) fn apply_profile(&mut self, profile: LocalUser) {
        self.stream_info = profile.stream_info.clone();
        self.profile = Some(profile);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// All peer records of a session, in creation order
#[derive(Default)]
pub struct PeerRegistry {
    peers: IndexMap<PeerId, PeerConnection>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Register a record. A second record for the same id is refused and
    /// destroyed; the existing one is left untouched.
    pub fn insert(&mut self, mut peer: PeerConnection) -> bool {
        if self.peers.contains_key(&peer.id) {
            warn!(peer_id = %peer.id, "Peer already exists, keeping existing connection");
            peer.destroy();
            return false;
        }
        self.peers.insert(peer.id.clone(), peer);
        true
    }

    #[must_use]
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub(crate) fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(peer_id)
    }

    pub(crate) fn remove(&mut self, peer_id: &PeerId) -> Option<PeerConnection> {
        self.peers.shift_remove(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection> {
        self.peers.values_mut()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Destroy and drop every record
    pub(crate) fn destroy_all(&mut self) -> usize {
        let count = self.peers.len();
        for (_, mut peer) in self.peers.drain(..) {
            peer.destroy();
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
