//! Media stream model
//!
//! Streams are produced by capture-device acquisition or by a connection
//! transport; the coordinator only needs their ids and a snapshot of each
//! track's capabilities.

use crate::types::{StreamId, TrackKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capability snapshot of a single track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_count: Option<u16>,
}

/// Per-kind settings of a stream. Later tracks of the same kind win.
pub type StreamSettings = BTreeMap<TrackKind, TrackSettings>;

/// One track of a media stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
    pub settings: TrackSettings,
    /// Disabled tracks keep flowing but carry silence or black frames
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            settings: TrackSettings::default(),
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: TrackSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// A media stream: an id plus its tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: StreamId,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<StreamId>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |track| track.kind == kind)
    }

    /// Enable or disable every track of `kind`; returns the ids of the tracks touched
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> Vec<String> {
        self.tracks
            .iter_mut()
            .filter(|track| track.kind == kind)
            .map(|track| {
                track.enabled = enabled;
                track.id.clone()
            })
            .collect()
    }

    /// Snapshot the settings of every track, keyed by kind.
    ///
    /// A stream without tracks yields an empty mapping.
    #[must_use]
    pub fn settings(&self) -> StreamSettings {
        self.tracks
            .iter()
            .map(|track| (track.kind, track.settings.clone()))
            .collect()
    }
}

/// Metadata published alongside every stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub settings: StreamSettings,
    pub is_audio_muted: bool,
    pub is_video_muted: bool,
    pub name: String,
}

impl StreamInfo {
    /// Merge a partial update; absent fields keep their current value
    pub fn apply(&mut self, update: StreamInfoUpdate) {
        if let Some(settings) = update.settings {
            self.settings = settings;
        }
        if let Some(muted) = update.is_audio_muted {
            self.is_audio_muted = muted;
        }
        if let Some(muted) = update.is_video_muted {
            self.is_video_muted = muted;
        }
        if let Some(name) = update.name {
            self.name = name;
        }
    }

    #[must_use]
    pub const fn is_muted(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.is_audio_muted,
            TrackKind::Video => self.is_video_muted,
        }
    }
}

/// Partial [`StreamInfo`] used by `update_local_stream_info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfoUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<StreamSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_audio_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_video_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl StreamInfoUpdate {
    #[must_use]
    pub fn audio_muted(muted: bool) -> Self {
        Self {
            is_audio_muted: Some(muted),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn video_muted(muted: bool) -> Self {
        Self {
            is_video_muted: Some(muted),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn muted(kind: TrackKind, muted: bool) -> Self {
        match kind {
            TrackKind::Audio => Self::audio_muted(muted),
            TrackKind::Video => Self::video_muted(muted),
        }
    }
}

/// Options accepted by `add_stream`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamOptions {
    pub is_audio_muted: bool,
    pub is_video_muted: bool,
    pub name: String,
}
