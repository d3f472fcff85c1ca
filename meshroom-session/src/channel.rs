//! Replicated key-tagged data slots
//!
//! A [`SharedChannel`] holds one local payload that is pushed to every peer,
//! and the latest payload each peer pushed back under the same tag. The
//! coordinator owns the replication path; this module only keeps the state
//! and the wire envelope.

use crate::error::Result;
use crate::types::PeerId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tag of the default channel carrying the local user profile
pub const USER_INFO_TAG: &str = "userInfo";

/// Envelope for everything sent over a peer's data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Replicated channel payload
    Channel { tag: String, data: Value },
    /// Application payload from `send_to_all`
    Data { payload: Value },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Options accepted by `add_channel`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    pub local_data: Value,
}

/// Latest payload a peer reported for a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerReport {
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

/// One replicated slot
#[derive(Debug, Clone, PartialEq)]
pub struct SharedChannel {
    tag: String,
    local_data: Value,
    peer_data: IndexMap<PeerId, PeerReport>,
}

impl SharedChannel {
    pub fn new(tag: impl Into<String>, local_data: Value) -> Self {
        Self {
            tag: tag.into(),
            local_data,
            peer_data: IndexMap::new(),
        }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub const fn local_data(&self) -> &Value {
        &self.local_data
    }

    /// Latest report from `peer_id`, absent until the first one arrives
    #[must_use]
    pub fn peer_data(&self, peer_id: &PeerId) -> Option<&PeerReport> {
        self.peer_data.get(peer_id)
    }

    /// Merged read view: local payload plus each peer's latest report
    #[must_use]
    pub fn view(&self) -> ChannelView {
        ChannelView {
            local: self.local_data.clone(),
            peers: self
                .peer_data
                .iter()
                .map(|(id, report)| (id.clone(), report.data.clone()))
                .collect(),
        }
    }

    /// Envelope replicating the current local payload
    #[must_use]
    pub fn wire_message(&self) -> WireMessage {
        WireMessage::Channel {
            tag: self.tag.clone(),
            data: self.local_data.clone(),
        }
    }

    pub(crate) fn set_local_data(&mut self, data: Value) {
        self.local_data = data;
    }

    pub(crate) fn record_peer_data(&mut self, peer_id: PeerId, data: Value) {
        self.peer_data.insert(
            peer_id,
            PeerReport {
                data,
                received_at: Utc::now(),
            },
        );
    }

    pub(crate) fn forget_peer(&mut self, peer_id: &PeerId) {
        self.peer_data.shift_remove(peer_id);
    }
}

/// Snapshot returned by [`SharedChannel::view`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelView {
    pub local: Value,
    pub peers: IndexMap<PeerId, Value>,
}

/// Channels of a session, keyed by tag
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: IndexMap<String, SharedChannel>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one with the same tag
    pub fn insert(&mut self, channel: SharedChannel) -> &SharedChannel {
        let tag = channel.tag.clone();
        let (index, _) = self.channels.insert_full(tag, channel);
        &self.channels[index]
    }

    #[must_use]
    pub fn get(&self, tag: &str) -> Option<&SharedChannel> {
        self.channels.get(tag)
    }

    pub(crate) fn get_mut(&mut self, tag: &str) -> Option<&mut SharedChannel> {
        self.channels.get_mut(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedChannel> {
        self.channels.values()
    }

    pub(crate) fn forget_peer(&mut self, peer_id: &PeerId) {
        for channel in self.channels.values_mut() {
            channel.forget_peer(peer_id);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
