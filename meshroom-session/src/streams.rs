//! Local stream registry and the consolidated stream view

use crate::media::{MediaStream, StreamInfo, StreamInfoUpdate, StreamOptions};
use crate::peer::PeerRegistry;
use crate::types::{PeerId, StreamId, TrackKind, UserId};
use crate::user::LocalUser;
use indexmap::IndexMap;
use serde::Serialize;

/// Who publishes a stream. Lookup key only; never owns the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StreamOwner {
    Local(UserId),
    Peer(PeerId),
}

/// One entry of the consolidated view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamDescriptor {
    pub owner: StreamOwner,
    pub stream: MediaStream,
    pub is_local: bool,
    /// Metadata overlay; remote streams may not have any yet
    pub info: Option<StreamInfo>,
}

impl StreamDescriptor {
    #[must_use]
    pub const fn id(&self) -> &StreamId {
        &self.stream.id
    }

    #[must_use]
    pub fn is_audio_muted(&self) -> bool {
        self.info.as_ref().is_some_and(|info| info.is_audio_muted)
    }

    #[must_use]
    pub fn is_video_muted(&self) -> bool {
        self.info.as_ref().is_some_and(|info| info.is_video_muted)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.info.as_ref().map_or("", |info| info.name.as_str())
    }
}

/// Local user plus the streams it publishes.
///
/// Keeps the stream registry and `LocalUser::stream_info` in lockstep: every
/// registered stream has exactly one metadata entry and vice versa.
#[derive(Debug)]
pub struct LocalMedia {
    user: LocalUser,
    streams: IndexMap<StreamId, MediaStream>,
    default_stream: Option<StreamId>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(user: LocalUser) -> Self {
        Self {
            user,
            streams: IndexMap::new(),
            default_stream: None,
        }
    }

    #[must_use]
    pub const fn user(&self) -> &LocalUser {
        &self.user
    }

    #[must_use]
    pub fn get(&self, stream_id: &StreamId) -> Option<&MediaStream> {
        self.streams.get(stream_id)
    }

    pub fn streams(&self) -> impl Iterator<Item = &MediaStream> {
        self.streams.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    #[must_use]
    pub fn default_stream(&self) -> Option<&MediaStream> {
        self.default_stream.as_ref().and_then(|id| self.streams.get(id))
    }

    /// Register or replace a stream. Returns true when the id is new.
    pub fn insert(&mut self, stream: MediaStream, options: StreamOptions) -> bool {
        let info = StreamInfo {
            settings: stream.settings(),
            is_audio_muted: options.is_audio_muted,
            is_video_muted: options.is_video_muted,
            name: options.name,
        };
        let id = stream.id.clone();
        self.user.stream_info.insert(id.clone(), info);
        self.streams.insert(id, stream).is_none()
    }

    /// Enable or disable the `kind` tracks of a registered stream; returns the track ids touched
    pub fn set_tracks_enabled(&mut self, stream_id: &StreamId, kind: TrackKind, enabled: bool) -> Vec<String> {
        self.streams
            .get_mut(stream_id)
            .map(|stream| stream.set_enabled(kind, enabled))
            .unwrap_or_default()
    }

    pub fn set_default(&mut self, stream_id: StreamId) {
        self.default_stream = Some(stream_id);
    }

    /// Unregister a stream, clearing the default reference if it pointed here
    pub fn remove(&mut self, stream_id: &StreamId) -> Option<MediaStream> {
        if self.default_stream.as_ref() == Some(stream_id) {
            self.default_stream = None;
        }
        self.user.stream_info.shift_remove(stream_id);
        self.streams.shift_remove(stream_id)
    }

    /// Merge a partial update into a registered stream's metadata
    pub fn update_info(&mut self, stream_id: &StreamId, update: StreamInfoUpdate) -> Option<&StreamInfo> {
        let info = self.user.stream_info.get_mut(stream_id)?;
        info.apply(update);
        Some(info)
    }

    #[must_use]
    pub fn info(&self, stream_id: &StreamId) -> Option<&StreamInfo> {
        self.user.stream_info.get(stream_id)
    }
}

/// Build the consolidated view: local streams first, then every peer's
/// remote streams in registry order.
#[must_use]
pub fn consolidate(local: &LocalMedia, peers: &PeerRegistry) -> Vec<StreamDescriptor> {
    let local_owner = StreamOwner::Local(local.user.id.clone());

    let local_streams = local.streams().map(|stream| StreamDescriptor {
        owner: local_owner.clone(),
        stream: stream.clone(),
        is_local: true,
        info: local.info(&stream.id).cloned(),
    });

    let remote_streams = peers.iter().flat_map(|peer| {
        peer.remote_streams().map(move |stream| StreamDescriptor {
            owner: StreamOwner::Peer(peer.id().clone()),
            stream: stream.clone(),
            is_local: false,
            info: peer.stream_info(&stream.id).cloned(),
        })
    });

    local_streams.chain(remote_streams).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerConnection;
    use crate::test_helpers::{av_stream, FakeTransport};
    use crate::types::ConnectionRole;

    fn local() -> LocalMedia {
        LocalMedia::new(LocalUser::with_defaults(false))
    }

    fn key_sets_match(media: &LocalMedia) -> bool {
        media.streams.keys().eq(media.user.stream_info.keys())
    }

    #[test]
    fn test_registries_stay_in_lockstep() {
        let mut media = local();
        for id in ["s1", "s2", "s3"] {
            media.insert(av_stream(id), StreamOptions::default());
            assert!(key_sets_match(&media));
        }
        media.remove(&StreamId::from("s2"));
        assert!(key_sets_match(&media));
        media.remove(&StreamId::from("missing"));
        assert!(key_sets_match(&media));
        media.insert(av_stream("s2"), StreamOptions::default());
        assert!(key_sets_match(&media));
        assert_eq!(media.len(), 3);
    }

    #[test]
    fn test_removing_default_clears_reference() {
        let mut media = local();
        media.insert(av_stream("s1"), StreamOptions::default());
        media.set_default(StreamId::from("s1"));
        assert!(media.default_stream().is_some());

        media.remove(&StreamId::from("s1"));
        assert!(media.default_stream().is_none());
    }

    #[test]
    fn test_insert_reports_replacement() {
        let mut media = local();
        assert!(media.insert(av_stream("s1"), StreamOptions::default()));
        assert!(!media.insert(
            av_stream("s1"),
            StreamOptions {
                name: "renamed".to_string(),
                ..Default::default()
            }
        ));
        assert_eq!(media.info(&StreamId::from("s1")).unwrap().name, "renamed");
    }

    #[test]
    fn test_update_unknown_stream_is_ignored() {
        let mut media = local();
        assert!(media
            .update_info(&StreamId::from("nope"), StreamInfoUpdate::audio_muted(true))
            .is_none());
        assert!(media.user().stream_info.is_empty());
    }

    #[test]
    fn test_consolidate_orders_local_then_peers() {
        let mut media = local();
        media.insert(
            av_stream("local-1"),
            StreamOptions {
                name: "me".to_string(),
                ..Default::default()
            },
        );

        let mut peers = PeerRegistry::new();
        for (peer_id, streams) in [("b", vec!["b-1", "b-2"]), ("c", vec!["c-1"])] {
            let id = PeerId::from(peer_id);
            let mut peer = PeerConnection::new(
                id.clone(),
                ConnectionRole::Initiator,
                Box::new(FakeTransport::new(id)),
            );
            for stream_id in streams {
                peer.insert_remote_stream(av_stream(stream_id));
            }
            peers.insert(peer);
        }

        let view = consolidate(&media, &peers);
        let ids: Vec<&str> = view.iter().map(|d| d.id().as_str()).collect();
        assert_eq!(ids, vec!["local-1", "b-1", "b-2", "c-1"]);

        assert!(view[0].is_local);
        assert_eq!(view[0].name(), "me");
        assert_eq!(view[0].owner, StreamOwner::Local(media.user().id.clone()));
        assert!(!view[1].is_local);
        assert!(view[1].info.is_none());
        assert_eq!(view[3].owner, StreamOwner::Peer(PeerId::from("c")));

        let expected: usize = media.len() + peers.iter().map(|p| p.remote_stream_count()).sum::<usize>();
        assert_eq!(view.len(), expected);
    }
}
