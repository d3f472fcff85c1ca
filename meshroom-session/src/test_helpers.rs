//! Test helpers and fixtures for session tests
//!
//! Recording fakes for the rendezvous and transport collaborators. Every fake
//! is cheap to clone and clones share state, so a test keeps one handle while
//! the coordinator owns another.

use crate::channel::WireMessage;
use crate::connectivity::ReachabilitySource;
use crate::error::{Error, Result};
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::{SignalPayload, SignalingClient, SignalingEvent};
use crate::transport::{ConnectionOptions, PeerEventSink, PeerTransport, TransportFactory};
use crate::types::{ConnectionRole, PeerId, StreamId, TrackKind, UserId};
use crate::user::LocalUser;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream with one audio and one video track
pub fn av_stream(id: &str) -> MediaStream {
    MediaStream::new(id)
        .with_track(MediaTrack::new(format!("{id}-audio"), TrackKind::Audio))
        .with_track(MediaTrack::new(format!("{id}-video"), TrackKind::Video))
}

/// A call made on a [`FakeTransport`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Signal(SignalPayload),
    AddStream(StreamId),
    RemoveStream(StreamId),
    SetTrackEnabled {
        stream_id: StreamId,
        track_id: String,
        enabled: bool,
    },
    Send(Bytes),
    Destroy,
}

/// Transport that records every call
#[derive(Clone, Debug)]
pub struct FakeTransport {
    peer_id: PeerId,
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn signals(&self) -> Vec<SignalPayload> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Signal(payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// Decoded data channel messages, in send order
    #[must_use]
    pub fn sent_messages(&self) -> Vec<WireMessage> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Send(bytes) => WireMessage::decode(bytes).ok(),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn destroy_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| **call == TransportCall::Destroy)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl PeerTransport for FakeTransport {
    fn signal(&mut self, payload: SignalPayload) -> Result<()> {
        self.calls.lock().push(TransportCall::Signal(payload));
        Ok(())
    }

    fn add_stream(&mut self, stream: &MediaStream) -> Result<()> {
        self.calls.lock().push(TransportCall::AddStream(stream.id.clone()));
        Ok(())
    }

    fn remove_stream(&mut self, stream: &MediaStream) -> Result<()> {
        self.calls.lock().push(TransportCall::RemoveStream(stream.id.clone()));
        Ok(())
    }

    fn set_track_enabled(&mut self, stream_id: &StreamId, track_id: &str, enabled: bool) -> Result<()> {
        self.calls.lock().push(TransportCall::SetTrackEnabled {
            stream_id: stream_id.clone(),
            track_id: track_id.to_string(),
            enabled,
        });
        Ok(())
    }

    fn send(&mut self, data: Bytes) -> Result<()> {
        self.calls.lock().push(TransportCall::Send(data));
        Ok(())
    }

    fn destroy(&mut self) {
        self.calls.lock().push(TransportCall::Destroy);
    }
}

/// Everything a [`FakeTransportFactory`] was asked to build
#[derive(Clone, Debug)]
pub struct CreatedTransport {
    pub peer_id: PeerId,
    pub role: ConnectionRole,
    pub options: ConnectionOptions,
    pub sink: PeerEventSink,
    pub transport: FakeTransport,
}

#[derive(Default)]
struct FactoryState {
    created: Vec<CreatedTransport>,
    failing: HashSet<PeerId>,
}

/// Factory handing out [`FakeTransport`]s
#[derive(Clone, Default)]
pub struct FakeTransportFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make construction fail for `peer_id`
    pub fn fail_for(&self, peer_id: impl Into<PeerId>) {
        self.state.lock().failing.insert(peer_id.into());
    }

    #[must_use]
    pub fn created(&self) -> Vec<CreatedTransport> {
        self.state.lock().created.clone()
    }

    #[must_use]
    pub fn created_roles(&self) -> Vec<(PeerId, ConnectionRole)> {
        self.state
            .lock()
            .created
            .iter()
            .map(|c| (c.peer_id.clone(), c.role))
            .collect()
    }

    /// Most recently created transport for `peer_id`
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<CreatedTransport> {
        self.state
            .lock()
            .created
            .iter()
            .rev()
            .find(|c| c.peer_id.as_str() == peer_id)
            .cloned()
    }
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &self,
        peer_id: &PeerId,
        role: ConnectionRole,
        options: ConnectionOptions,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>> {
        let mut state = self.state.lock();
        if state.failing.contains(peer_id) {
            return Err(Error::Transport(format!("refusing connection to {peer_id}")));
        }
        let transport = FakeTransport::new(peer_id.clone());
        state.created.push(CreatedTransport {
            peer_id: peer_id.clone(),
            role,
            options,
            sink,
            transport: transport.clone(),
        });
        Ok(Box::new(transport))
    }
}

#[derive(Default)]
struct SignalingState {
    events: Option<mpsc::UnboundedSender<SignalingEvent>>,
    opened: Vec<String>,
    joins: Vec<(String, UserId)>,
    signals: Vec<(PeerId, SignalPayload)>,
    closed: usize,
    fail_open: bool,
}

/// Rendezvous client that records outbound requests and lets the test
/// inject inbound events
#[derive(Clone, Default)]
pub struct RecordingSignaling {
    state: Arc<Mutex<SignalingState>>,
}

impl RecordingSignaling {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open` fail
    #[must_use]
    pub fn failing() -> Self {
        let signaling = Self::default();
        signaling.state.lock().fail_open = true;
        signaling
    }

    /// Deliver an inbound event; false when not open or already closed
    pub fn push(&self, event: SignalingEvent) -> bool {
        self.state
            .lock()
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn roster(&self, self_id: &str, peer_ids: &[&str]) -> bool {
        self.push(SignalingEvent::Ready {
            self_id: PeerId::from(self_id),
            peer_ids: peer_ids.iter().map(|id| PeerId::from(*id)).collect(),
            ice_servers: None,
        })
    }

    pub fn signal_from(&self, peer_id: &str, payload: SignalPayload) -> bool {
        self.push(SignalingEvent::Signal {
            peer_id: PeerId::from(peer_id),
            payload,
        })
    }

    #[must_use]
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    #[must_use]
    pub fn joins(&self) -> Vec<(String, UserId)> {
        self.state.lock().joins.clone()
    }

    #[must_use]
    pub fn signals(&self) -> Vec<(PeerId, SignalPayload)> {
        self.state.lock().signals.clone()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }
}

impl SignalingClient for RecordingSignaling {
    fn open(&self, server_address: &str) -> Result<mpsc::UnboundedReceiver<SignalingEvent>> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(Error::Signaling(format!("cannot reach {server_address}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        state.opened.push(server_address.to_string());
        Ok(rx)
    }

    fn join(&self, room: &str, user: &LocalUser) -> Result<()> {
        self.state
            .lock()
            .joins
            .push((room.to_string(), user.id.clone()));
        Ok(())
    }

    fn signal(&self, target: &PeerId, payload: &SignalPayload) -> Result<()> {
        self.state
            .lock()
            .signals
            .push((target.clone(), payload.clone()));
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed += 1;
        state.events = None;
    }
}

/// Reachability flag flipped by the test
#[derive(Clone)]
pub struct ManualReachability {
    online: Arc<AtomicBool>,
}

impl ManualReachability {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for ManualReachability {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ReachabilitySource for ManualReachability {
    fn is_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
