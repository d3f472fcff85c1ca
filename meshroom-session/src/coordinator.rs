//! Session coordinator
//!
//! Owns every registry of a session and is the only place they are mutated:
//! - local user and local streams
//! - peer records, created from the roster or from unsolicited negotiation
//! - shared channels and their replication to connected peers
//!
//! Inbound work arrives on three queues (rendezvous events, transport events,
//! reachability transitions) and is handled to completion one event at a
//! time. Notifications go out on a broadcast channel of [`SessionEvent`].

use crate::channel::{ChannelOptions, ChannelRegistry, SharedChannel, WireMessage, USER_INFO_TAG};
use crate::config::SessionConfig;
use crate::connectivity::{ConnectivityMonitor, NetworkTransition, ReachabilitySource, RouteReachability};
use crate::error::{Error, Result};
use crate::media::{MediaStream, StreamInfoUpdate, StreamOptions};
use crate::peer::{PeerConnection, PeerRegistry};
use crate::sdp::{BandwidthCeilings, SdpTransform};
use crate::signaling::{IceConfig, IceServer, SignalingClient, SignalingEvent};
use crate::streams::{consolidate, LocalMedia, StreamDescriptor};
use crate::transport::{ConnectionOptions, PeerEvent, PeerEventKind, PeerEventSink, TransportFactory};
use crate::types::{ConnectionRole, PeerId, StreamId, TrackKind};
use crate::user::LocalUser;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the notification channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Roster received after a join
    Ready { self_id: PeerId, peer_ids: Vec<PeerId> },
    /// Full replacement of the consolidated stream view
    Update(Arc<Vec<StreamDescriptor>>),
    /// Network became unreachable
    Disconnect,
    /// Network became reachable again; the join has been re-issued
    Reconnect,
    /// Data channel to a peer opened and channel state was replayed
    PeerConnected(PeerId),
    /// Peer record removed after its transport closed
    PeerClosed(PeerId),
    /// Application payload a peer sent with `send_to_all`
    Data { peer_id: PeerId, payload: Value },
    /// A peer reported new data for a channel
    ChannelUpdated { tag: String, peer_id: PeerId },
}

/// External services the coordinator drives
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingClient>,
    pub transports: Arc<dyn TransportFactory>,
    pub reachability: Arc<dyn ReachabilitySource>,
}

impl Collaborators {
    /// Probe reachability through the host routing table
    pub fn new(signaling: Arc<dyn SignalingClient>, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            signaling,
            transports,
            reachability: Arc::new(RouteReachability::default()),
        }
    }

    #[must_use]
    pub fn with_reachability(mut self, reachability: Arc<dyn ReachabilitySource>) -> Self {
        self.reachability = reachability;
        self
    }
}

/// One unit of inbound work
enum Inbound {
    Signaling(SignalingEvent),
    Peer(PeerEvent),
    Network(NetworkTransition),
}

/// Coordinator of one mesh session
pub struct SessionCoordinator {
    room: String,
    connection_extra: Value,
    sdp_transform: Option<SdpTransform>,
    ice: IceConfig,
    self_id: Option<PeerId>,

    local: LocalMedia,
    peers: PeerRegistry,
    channels: ChannelRegistry,

    /// Last computed consolidated view
    view: Arc<Vec<StreamDescriptor>>,

    /// Last reachability reported by the monitor
    online: bool,
    ended: bool,

    signaling: Arc<dyn SignalingClient>,
    transports: Arc<dyn TransportFactory>,

    signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    network_rx: mpsc::UnboundedReceiver<NetworkTransition>,

    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionCoordinator {
    /// Validate `config`, join the room and start the connectivity poll.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn initialize(config: SessionConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let poll_interval = config.connectivity_poll_interval();
        let SessionConfig {
            server_address,
            room,
            local_user,
            connection_options,
            send_only,
            initial_stream,
            video_bitrate_ceiling,
            audio_bitrate_ceiling,
            ..
        } = config;

        Handle::try_current()
            .map_err(|e| Error::Configuration(format!("session requires a Tokio runtime: {e}")))?;

        let user = LocalUser::with_defaults(send_only).merged(local_user);
        let mut channels = ChannelRegistry::new();
        channels.insert(SharedChannel::new(USER_INFO_TAG, serde_json::to_value(&user)?));

        let mut local = LocalMedia::new(user);
        if let Some(stream) = initial_stream {
            let stream_id = stream.id.clone();
            local.insert(stream, StreamOptions::default());
            local.set_default(stream_id);
            if let Some(channel) = channels.get_mut(USER_INFO_TAG) {
                channel.set_local_data(serde_json::to_value(local.user())?);
            }
        }

        let signaling_rx = collaborators.signaling.open(&server_address)?;
        if let Err(e) = collaborators.signaling.join(&room, local.user()) {
            warn!(room = %room, error = %e, "Join request failed");
        }

        let cancel = CancellationToken::new();
        let (network_tx, network_rx) = mpsc::unbounded_channel();
        ConnectivityMonitor::new(collaborators.reachability).spawn(
            poll_interval,
            network_tx,
            cancel.clone(),
        );

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let view = Arc::new(consolidate(&local, &PeerRegistry::new()));

        info!(
            server_address = %server_address,
            room = %room,
            user_id = %local.user().id,
            "Session initialized"
        );

        Ok(Self {
            room,
            connection_extra: connection_options,
            sdp_transform: BandwidthCeilings::new(video_bitrate_ceiling, audio_bitrate_ceiling)
                .transform(),
            ice: IceConfig::default(),
            self_id: None,
            local,
            peers: PeerRegistry::new(),
            channels,
            view,
            online: true,
            ended: false,
            signaling: collaborators.signaling,
            transports: collaborators.transports,
            signaling_rx,
            peer_tx,
            peer_rx,
            network_rx,
            events,
            cancel,
        })
    }

    /// Receive session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ========== Driving ==========

    /// Wait for the next inbound event and handle it.
    ///
    /// Returns false once the session has ended or every queue is closed.
    pub async fn process_next(&mut self) -> bool {
        if self.ended {
            return false;
        }

        let next = tokio::select! {
            biased;
            Some(event) = self.signaling_rx.recv() => Inbound::Signaling(event),
            Some(event) = self.peer_rx.recv() => Inbound::Peer(event),
            Some(transition) = self.network_rx.recv() => Inbound::Network(transition),
            else => return false,
        };

        self.dispatch(next);
        true
    }

    /// Handle events until the session ends
    pub async fn run(&mut self) {
        while self.process_next().await {}
        debug!("Session event loop finished");
    }

    /// Handle every event already queued without waiting; returns how many
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while !self.ended {
            let Some(next) = self.try_next() else { break };
            self.dispatch(next);
            handled += 1;
        }
        handled
    }

    fn try_next(&mut self) -> Option<Inbound> {
        if let Ok(event) = self.signaling_rx.try_recv() {
            return Some(Inbound::Signaling(event));
        }
        if let Ok(event) = self.peer_rx.try_recv() {
            return Some(Inbound::Peer(event));
        }
        self.network_rx.try_recv().ok().map(Inbound::Network)
    }

    fn dispatch(&mut self, next: Inbound) {
        match next {
            Inbound::Signaling(event) => self.handle_signaling_event(event),
            Inbound::Peer(event) => self.handle_peer_event(event),
            Inbound::Network(transition) => self.handle_network_transition(transition),
        }
    }

    // ========== Local streams ==========

    /// Publish a local stream to every peer
    pub fn add_stream(&mut self, stream: MediaStream, options: StreamOptions) {
        let stream_id = stream.id.clone();
        let is_new = self.local.insert(stream, options);

        // Peers already carry a stream registered under the same id
        if is_new {
            if let Some(stream) = self.local.get(&stream_id) {
                for peer in self.peers.iter_mut() {
                    if let Err(e) = peer.add_stream(stream) {
                        warn!(peer_id = %peer.id(), stream_id = %stream_id, error = %e, "Failed to add stream to peer");
                    }
                }
            }
        }

        info!(stream_id = %stream_id, replaced = !is_new, "Local stream added");
        self.publish_local_user();
        self.refresh_view();
    }

    /// Withdraw a local stream. Descriptors of remote streams are ignored.
    pub fn remove_stream(&mut self, descriptor: &StreamDescriptor) {
        if !descriptor.is_local {
            warn!(stream_id = %descriptor.id(), "Cannot remove a remote stream");
            return;
        }

        let Some(stream) = self.local.remove(descriptor.id()) else {
            debug!(stream_id = %descriptor.id(), "Stream already removed");
            return;
        };

        for peer in self.peers.iter_mut() {
            if let Err(e) = peer.remove_stream(&stream) {
                warn!(peer_id = %peer.id(), stream_id = %stream.id, error = %e, "Failed to remove stream from peer");
            }
        }

        info!(stream_id = %stream.id, "Local stream removed");
        self.publish_local_user();
        self.refresh_view();
    }

    /// Merge a partial update into a local stream's metadata.
    ///
    /// Returns false when `stream_id` is not a registered local stream.
    pub fn update_local_stream_info(&mut self, stream_id: &StreamId, update: StreamInfoUpdate) -> bool {
        if self.local.update_info(stream_id, update).is_none() {
            warn!(stream_id = %stream_id, "Ignoring metadata update for unknown stream");
            return false;
        }

        debug!(stream_id = %stream_id, "Local stream info updated");
        self.publish_local_user();
        self.refresh_view();
        true
    }

    /// Flip the mute flag of `kind` on the default stream; returns the new value.
    ///
    /// The stream's `kind` tracks are disabled while muted, locally and on
    /// every peer connection.
    pub fn toggle_default_stream_mute(&mut self, kind: TrackKind) -> Option<bool> {
        let stream_id = self.local.default_stream()?.id.clone();
        let muted = !self.local.info(&stream_id)?.is_muted(kind);

        let track_ids = self.local.set_tracks_enabled(&stream_id, kind, !muted);
        for peer in self.peers.iter_mut() {
            for track_id in &track_ids {
                if let Err(e) = peer.set_track_enabled(&stream_id, track_id, !muted) {
                    warn!(peer_id = %peer.id(), stream_id = %stream_id, track_id = %track_id, error = %e, "Failed to toggle track");
                }
            }
        }

        info!(stream_id = %stream_id, kind = %kind, muted, "Default stream mute toggled");
        self.update_local_stream_info(&stream_id, StreamInfoUpdate::muted(kind, muted));
        Some(muted)
    }

    // ========== Channels ==========

    /// Register a channel and replicate its payload to connected peers.
    ///
    /// Registering a tag twice keeps the peer reports and replaces only the
    /// local payload. The user info tag is reserved.
    pub fn add_channel(&mut self, tag: impl Into<String>, options: ChannelOptions) -> Result<&SharedChannel> {
        let tag = tag.into();
        if tag == USER_INFO_TAG {
            return Err(Error::ReservedChannel(tag));
        }

        if self.channels.get(&tag).is_some() {
            warn!(tag = %tag, "Channel already registered, replacing local payload");
            self.update_channel(&tag, options.local_data)?;
        } else {
            let channel = SharedChannel::new(tag.clone(), options.local_data);
            let sent = self.send_to_connected(&channel.wire_message());
            debug!(tag = %tag, peers = sent, "Channel added");
            self.channels.insert(channel);
        }

        self.channels
            .get(&tag)
            .ok_or_else(|| Error::UnknownChannel(tag.clone()))
    }

    /// Replace a channel's local payload and replicate it to connected peers
    pub fn update_channel(&mut self, tag: &str, data: Value) -> Result<()> {
        let channel = self
            .channels
            .get_mut(tag)
            .ok_or_else(|| Error::UnknownChannel(tag.to_string()))?;
        channel.set_local_data(data);
        let message = channel.wire_message();

        let sent = self.send_to_connected(&message);
        debug!(tag = %tag, peers = sent, "Channel updated");
        Ok(())
    }

    /// Send `payload` to every peer; returns how many accepted it
    pub fn send_to_all(&mut self, payload: Value) -> usize {
        let bytes = match (WireMessage::Data { payload }).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode payload");
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.peers.iter_mut() {
            match peer.send(bytes.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer_id = %peer.id(), error = %e, "Failed to send to peer"),
            }
        }
        delivered
    }

    fn send_to_connected(&mut self, message: &WireMessage) -> usize {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode channel message");
                return 0;
            }
        };

        let mut sent = 0;
        for peer in self.peers.iter_mut().filter(|peer| peer.is_connected()) {
            match peer.send(bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer_id = %peer.id(), error = %e, "Failed to replicate channel"),
            }
        }
        sent
    }

    fn publish_local_user(&mut self) {
        match serde_json::to_value(self.local.user()) {
            Ok(value) => {
                if let Err(e) = self.update_channel(USER_INFO_TAG, value) {
                    warn!(error = %e, "Failed to publish local user");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize local user"),
        }
    }

    // ========== Teardown ==========

    /// Destroy every peer, close the rendezvous channel and stop the
    /// connectivity poll. Repeated calls are no-ops.
    pub fn end_session(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        self.cancel.cancel();
        let destroyed = self.peers.destroy_all();
        self.signaling.close();

        info!(room = %self.room, peers = destroyed, "Session ended");
    }

    // ========== Rendezvous events ==========

    pub fn handle_signaling_event(&mut self, event: SignalingEvent) {
        if self.ended {
            debug!(?event, "Session ended, ignoring rendezvous event");
            return;
        }

        match event {
            SignalingEvent::Ready {
                self_id,
                peer_ids,
                ice_servers,
            } => self.on_roster(self_id, peer_ids, ice_servers),
            SignalingEvent::Signal { peer_id, payload } => {
                if !self.peers.contains(&peer_id) {
                    if let Err(e) = self.create_peer(peer_id.clone(), ConnectionRole::Responder) {
                        let err = Error::UnknownPeerSignal {
                            peer_id,
                            reason: e.to_string(),
                        };
                        error!(error = %err, "Dropping negotiation payload");
                        return;
                    }
                }

                debug!(peer_id = %peer_id, kind = payload.kind(), "Negotiation payload received");
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    if let Err(e) = peer.signal(payload) {
                        warn!(peer_id = %peer_id, error = %e, "Failed to apply negotiation payload");
                    }
                }
            }
            SignalingEvent::Reconnect => {
                info!(room = %self.room, "Rendezvous connection restored");
                self.rejoin();
            }
        }
    }

    fn on_roster(
        &mut self,
        self_id: PeerId,
        peer_ids: Vec<PeerId>,
        ice_servers: Option<Vec<IceServer>>,
    ) {
        self.ice = IceConfig::from_roster(ice_servers);

        for peer_id in &peer_ids {
            if *peer_id == self_id || self.peers.contains(peer_id) {
                continue;
            }
            if let Err(e) = self.create_peer(peer_id.clone(), ConnectionRole::Initiator) {
                error!(peer_id = %peer_id, error = %e, "Failed to create peer connection");
            }
        }

        info!(self_id = %self_id, peers = peer_ids.len(), "Roster received");
        self.self_id = Some(self_id.clone());
        self.emit(SessionEvent::Ready { self_id, peer_ids });
    }

    fn create_peer(&mut self, peer_id: PeerId, role: ConnectionRole) -> Result<()> {
        let options = self.connection_options();
        let sink = PeerEventSink::new(peer_id.clone(), self.peer_tx.clone());
        let transport = self.transports.create(&peer_id, role, options, sink)?;

        info!(peer_id = %peer_id, ?role, "Peer connection created");
        self.peers.insert(PeerConnection::new(peer_id, role, transport));
        Ok(())
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            ice: self.ice.clone(),
            extra: self.connection_extra.clone(),
            sdp_transform: self.sdp_transform.clone(),
            streams: self.local.streams().cloned().collect(),
        }
    }

    fn rejoin(&self) {
        match self.signaling.join(&self.room, self.local.user()) {
            Ok(()) => info!(room = %self.room, "Join request re-issued"),
            Err(e) => warn!(room = %self.room, error = %e, "Join request failed"),
        }
    }

    // ========== Transport events ==========

    pub fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { peer_id, kind } = event;
        if self.ended {
            debug!(peer_id = %peer_id, ?kind, "Session ended, ignoring transport event");
            return;
        }
        if !self.peers.contains(&peer_id) {
            debug!(peer_id = %peer_id, ?kind, "Ignoring event for unknown peer");
            return;
        }

        match kind {
            PeerEventKind::Signal(payload) => {
                if let Err(e) = self.signaling.signal(&peer_id, &payload) {
                    warn!(peer_id = %peer_id, error = %e, "Failed to relay negotiation payload");
                }
            }
            PeerEventKind::Connect => self.on_peer_connected(peer_id),
            PeerEventKind::Stream(stream) => {
                debug!(peer_id = %peer_id, stream_id = %stream.id, "Remote stream added");
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.insert_remote_stream(stream);
                }
                self.refresh_view();
            }
            PeerEventKind::StreamRemoved(stream_id) => {
                let removed = self
                    .peers
                    .get_mut(&peer_id)
                    .and_then(|peer| peer.remove_remote_stream(&stream_id));
                if removed.is_some() {
                    debug!(peer_id = %peer_id, stream_id = %stream_id, "Remote stream removed");
                    self.refresh_view();
                }
            }
            PeerEventKind::Data(bytes) => self.on_peer_data(peer_id, &bytes),
            PeerEventKind::Close => self.on_peer_closed(peer_id),
            PeerEventKind::Error(message) => {
                warn!(peer_id = %peer_id, error = %message, "Peer transport error");
            }
        }
    }

    fn on_peer_connected(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.mark_connected();

        for channel in self.channels.iter() {
            let sent = channel
                .wire_message()
                .encode()
                .and_then(|bytes| peer.send(bytes));
            if let Err(e) = sent {
                warn!(peer_id = %peer_id, tag = %channel.tag(), error = %e, "Failed to replay channel");
            }
        }

        info!(peer_id = %peer_id, "Peer connected");
        self.emit(SessionEvent::PeerConnected(peer_id));
    }

    fn on_peer_data(&mut self, peer_id: PeerId, bytes: &Bytes) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.record_received(bytes.len());

        let message = match WireMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Dropping malformed data channel message");
                return;
            }
        };

        match message {
            WireMessage::Channel { tag, data } => {
                let mut view_changed = false;
                if tag == USER_INFO_TAG {
                    match serde_json::from_value::<LocalUser>(data.clone()) {
                        Ok(profile) => {
                            peer.apply_profile(profile);
                            view_changed = true;
                        }
                        Err(e) => warn!(peer_id = %peer_id, error = %e, "Malformed user info"),
                    }
                }

                match self.channels.get_mut(&tag) {
                    Some(channel) => {
                        channel.record_peer_data(peer_id.clone(), data);
                        debug!(peer_id = %peer_id, tag = %tag, "Channel report received");
                        self.emit(SessionEvent::ChannelUpdated { tag, peer_id });
                    }
                    None => debug!(peer_id = %peer_id, tag = %tag, "Report for unregistered channel dropped"),
                }

                if view_changed {
                    self.refresh_view();
                }
            }
            WireMessage::Data { payload } => {
                self.emit(SessionEvent::Data { peer_id, payload });
            }
        }
    }

    fn on_peer_closed(&mut self, peer_id: PeerId) {
        if let Some(mut peer) = self.peers.remove(&peer_id) {
            peer.destroy();
        }
        self.channels.forget_peer(&peer_id);

        info!(peer_id = %peer_id, "Peer closed");
        self.refresh_view();
        self.emit(SessionEvent::PeerClosed(peer_id));
    }

    // ========== Connectivity ==========

    pub fn handle_network_transition(&mut self, transition: NetworkTransition) {
        if self.ended {
            debug!(?transition, "Session ended, ignoring network transition");
            return;
        }

        match transition {
            NetworkTransition::Disconnected => {
                warn!(room = %self.room, "Network unreachable");
                self.online = false;
                self.emit(SessionEvent::Disconnect);
            }
            NetworkTransition::Reconnected => {
                info!(room = %self.room, "Network reachable again");
                self.online = true;
                self.emit(SessionEvent::Reconnect);
                self.rejoin();
            }
        }
    }

    // ========== View ==========

    fn refresh_view(&mut self) {
        self.view = Arc::new(consolidate(&self.local, &self.peers));
        self.emit(SessionEvent::Update(Arc::clone(&self.view)));
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ========== Accessors ==========

    #[must_use]
    pub const fn local_user(&self) -> &LocalUser {
        self.local.user()
    }

    #[must_use]
    pub fn default_stream(&self) -> Option<&MediaStream> {
        self.local.default_stream()
    }

    /// Consolidated view as of the last mutation
    #[must_use]
    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.view
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.ids()
    }

    #[must_use]
    pub fn channel(&self, tag: &str) -> Option<&SharedChannel> {
        self.channels.get(tag)
    }

    #[must_use]
    pub const fn ice_config(&self) -> &IceConfig {
        &self.ice
    }

    /// Our id as assigned by the last roster
    #[must_use]
    pub const fn self_id(&self) -> Option<&PeerId> {
        self.self_id.as_ref()
    }

    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.online
    }

    #[must_use]
    pub const fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.end_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SignalPayload;
    use crate::test_helpers::{
        av_stream, FakeTransportFactory, ManualReachability, RecordingSignaling, TransportCall,
    };
    use serde_json::json;

    struct Harness {
        coordinator: SessionCoordinator,
        signaling: RecordingSignaling,
        factory: FakeTransportFactory,
        reachability: ManualReachability,
        events: broadcast::Receiver<SessionEvent>,
    }

    impl Harness {
        fn start(config: SessionConfig) -> Self {
            let signaling = RecordingSignaling::new();
            let factory = FakeTransportFactory::new();
            let reachability = ManualReachability::new(true);
            let collaborators = Collaborators::new(Arc::new(signaling.clone()), Arc::new(factory.clone()))
                .with_reachability(Arc::new(reachability.clone()));

            let coordinator = SessionCoordinator::initialize(config, collaborators).unwrap();
            let events = coordinator.subscribe();
            Self {
                coordinator,
                signaling,
                factory,
                reachability,
                events,
            }
        }

        fn pump(&mut self) -> usize {
            self.coordinator.process_pending()
        }

        fn drain_events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Roster with `peers`, then open the data channel of each
        fn connect(&mut self, peers: &[&str]) {
            let mut roster = vec!["a"];
            roster.extend_from_slice(peers);
            self.signaling.roster("a", &roster);
            self.pump();
            for peer in peers {
                self.factory.get(peer).unwrap().sink.emit(PeerEventKind::Connect);
            }
            self.pump();
            for peer in peers {
                self.factory.get(peer).unwrap().transport.clear();
            }
            self.drain_events();
        }

        fn emit(&self, peer: &str, kind: PeerEventKind) {
            self.factory.get(peer).unwrap().sink.emit(kind);
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::default().with_room("r1")
    }

    fn channel_bytes(tag: &str, data: Value) -> Bytes {
        WireMessage::Channel {
            tag: tag.to_string(),
            data,
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_joins_room() {
        let harness = Harness::start(config());

        assert_eq!(harness.signaling.opened(), vec![crate::config::DEFAULT_SERVER_ADDRESS]);
        let joins = harness.signaling.joins();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].0, "r1");
        assert_eq!(joins[0].1, harness.coordinator.local_user().id);

        let user_info = harness.coordinator.channel(USER_INFO_TAG).unwrap();
        assert_eq!(
            user_info.local_data()["id"],
            json!(harness.coordinator.local_user().id.as_str())
        );
        assert!(harness.coordinator.is_online());
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let config = SessionConfig {
            server_address: String::new(),
            ..Default::default()
        };
        let collaborators = Collaborators::new(
            Arc::new(RecordingSignaling::new()),
            Arc::new(FakeTransportFactory::new()),
        )
        .with_reachability(Arc::new(ManualReachability::default()));

        let result = SessionCoordinator::initialize(config, collaborators);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_initialize_requires_runtime() {
        let collaborators = Collaborators::new(
            Arc::new(RecordingSignaling::new()),
            Arc::new(FakeTransportFactory::new()),
        );
        let result = SessionCoordinator::initialize(config(), collaborators);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_initial_stream_becomes_default() {
        let harness = Harness::start(config().with_initial_stream(av_stream("cam")));

        assert_eq!(
            harness.coordinator.default_stream().map(|s| s.id.as_str()),
            Some("cam")
        );
        assert_eq!(harness.coordinator.streams().len(), 1);
        assert!(harness
            .coordinator
            .local_user()
            .stream_info
            .contains_key(&StreamId::from("cam")));
    }

    #[tokio::test]
    async fn test_duplicate_roster_keeps_records() {
        let mut harness = Harness::start(config());
        harness.signaling.roster("a", &["a", "b", "c"]);
        harness.signaling.roster("a", &["a", "b", "c"]);
        harness.pump();

        assert_eq!(harness.coordinator.peer_ids(), vec![PeerId::from("b"), PeerId::from("c")]);
        assert_eq!(harness.factory.created().len(), 2);
        assert_eq!(harness.factory.get("b").unwrap().transport.destroy_count(), 0);
    }

    #[tokio::test]
    async fn test_roster_stores_ice_servers() {
        let mut harness = Harness::start(config());
        let servers = vec![IceServer {
            urls: vec!["turn:relay.example.org:3478".to_string()],
            username: Some("u".to_string()),
            credential: Some("p".to_string()),
        }];
        harness.signaling.push(SignalingEvent::Ready {
            self_id: PeerId::from("a"),
            peer_ids: vec![PeerId::from("a"), PeerId::from("b")],
            ice_servers: Some(servers.clone()),
        });
        harness.pump();

        assert_eq!(harness.coordinator.ice_config().ice_servers, servers);
        assert_eq!(harness.factory.get("b").unwrap().options.ice.ice_servers, servers);
        assert_eq!(harness.coordinator.self_id(), Some(&PeerId::from("a")));
    }

    #[tokio::test]
    async fn test_responder_construction_failure_is_contained() {
        let mut harness = Harness::start(config());
        harness.factory.fail_for("c");

        harness
            .signaling
            .signal_from("c", SignalPayload::Offer { sdp: "v=0\n".to_string() });
        harness.pump();

        assert!(harness.coordinator.peer(&PeerId::from("c")).is_none());
        assert!(harness.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_signal_for_existing_peer_is_forwarded() {
        let mut harness = Harness::start(config());
        harness.signaling.roster("a", &["a", "b"]);
        let answer = SignalPayload::Answer { sdp: "v=0\n".to_string() };
        harness.signaling.signal_from("b", answer.clone());
        harness.pump();

        assert_eq!(harness.factory.created().len(), 1);
        assert_eq!(harness.factory.get("b").unwrap().transport.signals(), vec![answer]);
    }

    #[tokio::test]
    async fn test_local_signals_are_relayed() {
        let mut harness = Harness::start(config());
        harness.signaling.roster("a", &["a", "b"]);
        harness.pump();

        let offer = SignalPayload::Offer { sdp: "v=0\n".to_string() };
        harness.emit("b", PeerEventKind::Signal(offer.clone()));
        harness.pump();

        assert_eq!(harness.signaling.signals(), vec![(PeerId::from("b"), offer)]);
    }

    #[tokio::test]
    async fn test_ceilings_reach_connection_options() {
        let mut harness = Harness::start(SessionConfig {
            video_bitrate_ceiling: Some(800),
            audio_bitrate_ceiling: Some(64),
            ..config()
        });
        harness.signaling.roster("a", &["a", "b"]);
        harness
            .signaling
            .signal_from("c", SignalPayload::Offer { sdp: "v=0\n".to_string() });
        harness.pump();

        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        for peer in ["b", "c"] {
            let created = harness.factory.get(peer).unwrap();
            let transform = created.options.sdp_transform.unwrap();
            assert_eq!(
                transform(sdp),
                "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nb=AS:64\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\nb=AS:800\r\n"
            );
        }
    }

    #[tokio::test]
    async fn test_new_peers_receive_local_streams() {
        let mut harness = Harness::start(config());
        harness
            .coordinator
            .add_stream(av_stream("s1"), StreamOptions::default());
        harness.signaling.roster("a", &["a", "b"]);
        harness.pump();

        let created = harness.factory.get("b").unwrap();
        assert_eq!(created.options.streams.len(), 1);
        assert_eq!(created.options.streams[0].id, StreamId::from("s1"));
    }

    #[tokio::test]
    async fn test_add_stream_fans_out_and_republishes() {
        let mut harness = Harness::start(config());
        harness.connect(&["b"]);

        harness
            .coordinator
            .add_stream(av_stream("s1"), StreamOptions::default());

        let transport = harness.factory.get("b").unwrap().transport;
        assert_eq!(transport.calls()[0], TransportCall::AddStream(StreamId::from("s1")));
        let messages = transport.sent_messages();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WireMessage::Channel { tag, data } => {
                assert_eq!(tag, USER_INFO_TAG);
                assert!(data["streamInfo"].get("s1").is_some());
            }
            other => panic!("unexpected message {other:?}"),
        }

        let events = harness.drain_events();
        assert!(matches!(events.as_slice(), [SessionEvent::Update(view)] if view.len() == 1));
    }

    #[tokio::test]
    async fn test_remove_default_stream_clears_reference() {
        let mut harness = Harness::start(config().with_initial_stream(av_stream("cam")));
        harness.connect(&["b"]);

        let descriptor = harness.coordinator.streams()[0].clone();
        harness.coordinator.remove_stream(&descriptor);

        assert!(harness.coordinator.default_stream().is_none());
        assert!(harness.coordinator.streams().is_empty());
        assert!(harness.coordinator.local_user().stream_info.is_empty());
        assert!(harness
            .factory
            .get("b")
            .unwrap()
            .transport
            .calls()
            .contains(&TransportCall::RemoveStream(StreamId::from("cam"))));
    }

    #[tokio::test]
    async fn test_toggle_default_stream_mute() {
        let mut harness = Harness::start(config());
        assert_eq!(harness.coordinator.toggle_default_stream_mute(TrackKind::Audio), None);

        let mut harness = Harness::start(config().with_initial_stream(av_stream("cam")));
        assert_eq!(harness.coordinator.toggle_default_stream_mute(TrackKind::Video), Some(true));
        assert!(harness.coordinator.streams()[0].is_video_muted());
        assert!(!harness.coordinator.streams()[0].is_audio_muted());
        assert_eq!(harness.coordinator.toggle_default_stream_mute(TrackKind::Video), Some(false));
        assert!(!harness.coordinator.streams()[0].is_video_muted());
    }

    #[tokio::test]
    async fn test_update_unknown_stream_info_is_ignored() {
        let mut harness = Harness::start(config());
        assert!(!harness
            .coordinator
            .update_local_stream_info(&StreamId::from("ghost"), StreamInfoUpdate::audio_muted(true)));
        assert!(harness.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_connect_replays_channels() {
        let mut harness = Harness::start(config());
        harness
            .coordinator
            .add_channel("cursor", ChannelOptions { local_data: json!({ "x": 1 }) })
            .unwrap();
        harness.signaling.roster("a", &["a", "b"]);
        harness.pump();
        harness.drain_events();

        harness.emit("b", PeerEventKind::Connect);
        harness.pump();

        let tags: Vec<String> = harness
            .factory
            .get("b")
            .unwrap()
            .transport
            .sent_messages()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Channel { tag, .. } => Some(tag),
                WireMessage::Data { .. } => None,
            })
            .collect();
        assert_eq!(tags, vec![USER_INFO_TAG.to_string(), "cursor".to_string()]);
        assert_eq!(
            harness.drain_events(),
            vec![SessionEvent::PeerConnected(PeerId::from("b"))]
        );
        assert!(harness.coordinator.peer(&PeerId::from("b")).unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_channel_updates_reach_connected_peers_only() {
        let mut harness = Harness::start(config());
        harness.connect(&["b"]);
        harness.signaling.roster("a", &["a", "b", "c"]);
        harness.pump();

        harness
            .coordinator
            .add_channel("cursor", ChannelOptions { local_data: json!(0) })
            .unwrap();
        harness.coordinator.update_channel("cursor", json!(1)).unwrap();

        let sent = harness.factory.get("b").unwrap().transport.sent_messages();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[1],
            WireMessage::Channel {
                tag: "cursor".to_string(),
                data: json!(1)
            }
        );
        assert!(harness.factory.get("c").unwrap().transport.sent_messages().is_empty());
        assert!(matches!(
            harness.coordinator.update_channel("missing", json!(1)),
            Err(Error::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_channel_reports() {
        let mut harness = Harness::start(config());
        harness
            .coordinator
            .add_channel("cursor", ChannelOptions::default())
            .unwrap();
        harness.connect(&["b"]);

        harness.emit("b", PeerEventKind::Data(channel_bytes("cursor", json!({ "x": 9 }))));
        harness.emit("b", PeerEventKind::Data(channel_bytes("unknown", json!(true))));
        harness.pump();

        let view = harness.coordinator.channel("cursor").unwrap().view();
        assert_eq!(view.peers[&PeerId::from("b")], json!({ "x": 9 }));
        assert!(harness.coordinator.channel("unknown").is_none());
        assert_eq!(
            harness.drain_events(),
            vec![SessionEvent::ChannelUpdated {
                tag: "cursor".to_string(),
                peer_id: PeerId::from("b")
            }]
        );
        assert_eq!(
            harness.coordinator.peer(&PeerId::from("b")).unwrap().stats().messages_received,
            2
        );
    }

    #[tokio::test]
    async fn test_remote_user_info_overlays_streams() {
        let mut harness = Harness::start(config());
        harness.connect(&["b"]);

        harness.emit("b", PeerEventKind::Stream(av_stream("b-cam")));
        harness.pump();
        assert!(harness.coordinator.streams()[0].info.is_none());

        let mut remote = LocalUser::with_defaults(false);
        remote.nickname = "bob".to_string();
        remote.stream_info.insert(
            StreamId::from("b-cam"),
            crate::media::StreamInfo {
                is_audio_muted: true,
                name: "bob cam".to_string(),
                ..Default::default()
            },
        );
        harness.emit(
            "b",
            PeerEventKind::Data(channel_bytes(USER_INFO_TAG, serde_json::to_value(&remote).unwrap())),
        );
        harness.pump();

        let view = harness.coordinator.streams();
        assert_eq!(view.len(), 1);
        assert!(!view[0].is_local);
        assert!(view[0].is_audio_muted());
        assert_eq!(view[0].name(), "bob cam");
        assert_eq!(
            harness
                .coordinator
                .peer(&PeerId::from("b"))
                .unwrap()
                .profile()
                .map(|p| p.nickname.as_str()),
            Some("bob")
        );
    }

    #[tokio::test]
    async fn test_remote_stream_removed() {
        let mut harness = Harness::start(config());
        harness.connect(&["b"]);
        harness.emit("b", PeerEventKind::Stream(av_stream("b-cam")));
        harness.emit("b", PeerEventKind::StreamRemoved(StreamId::from("b-cam")));
        harness.emit("b", PeerEventKind::StreamRemoved(StreamId::from("b-cam")));
        harness.pump();

        assert!(harness.coordinator.streams().is_empty());
        let updates = harness
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Update(_)))
            .count();
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_send_to_all_and_receive_data() {
        let mut harness = Harness::start(config());
        harness.connect(&["b"]);
        harness.signaling.roster("a", &["a", "b", "c"]);
        harness.pump();
        harness.drain_events();

        assert_eq!(harness.coordinator.send_to_all(json!({ "chat": "hi" })), 1);
        assert_eq!(
            harness.factory.get("b").unwrap().transport.sent_messages(),
            vec![WireMessage::Data {
                payload: json!({ "chat": "hi" })
            }]
        );

        let bytes = (WireMessage::Data {
            payload: json!("pong"),
        })
        .encode()
        .unwrap();
        harness.emit("b", PeerEventKind::Data(bytes));
        harness.emit("b", PeerEventKind::Data(Bytes::from_static(b"garbage")));
        harness.pump();

        assert_eq!(
            harness.drain_events(),
            vec![SessionEvent::Data {
                peer_id: PeerId::from("b"),
                payload: json!("pong")
            }]
        );
    }

    #[tokio::test]
    async fn test_peer_close_purges_record() {
        let mut harness = Harness::start(config());
        harness
            .coordinator
            .add_channel("cursor", ChannelOptions::default())
            .unwrap();
        harness.connect(&["b"]);
        harness.emit("b", PeerEventKind::Stream(av_stream("b-cam")));
        harness.emit("b", PeerEventKind::Data(channel_bytes("cursor", json!(1))));
        harness.pump();
        harness.drain_events();

        harness.emit("b", PeerEventKind::Close);
        harness.emit("b", PeerEventKind::Stream(av_stream("late")));
        harness.pump();

        assert!(harness.coordinator.peer(&PeerId::from("b")).is_none());
        assert!(harness.coordinator.streams().is_empty());
        assert!(harness.coordinator.channel("cursor").unwrap().view().peers.is_empty());
        assert_eq!(harness.factory.get("b").unwrap().transport.destroy_count(), 1);

        let events = harness.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SessionEvent::Update(view) if view.is_empty()));
        assert_eq!(events[1], SessionEvent::PeerClosed(PeerId::from("b")));

        // A fresh roster recreates the peer
        harness.signaling.roster("a", &["a", "b"]);
        harness.pump();
        assert!(harness.coordinator.peer(&PeerId::from("b")).is_some());
        assert_eq!(harness.factory.created().len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_event_rejoins() {
        let mut harness = Harness::start(config());
        harness.signaling.push(SignalingEvent::Reconnect);
        harness.pump();

        assert_eq!(harness.signaling.joins().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_transitions() {
        let mut harness = Harness::start(config());
        harness.signaling.roster("a", &["a", "b"]);
        harness.pump();
        harness.drain_events();

        harness.reachability.set_online(false);
        assert!(harness.coordinator.process_next().await);
        assert_eq!(harness.drain_events(), vec![SessionEvent::Disconnect]);
        assert!(!harness.coordinator.is_online());

        harness.reachability.set_online(true);
        assert!(harness.coordinator.process_next().await);
        assert_eq!(harness.drain_events(), vec![SessionEvent::Reconnect]);
        assert!(harness.coordinator.is_online());
        assert_eq!(harness.signaling.joins().len(), 2);

        // Existing records survive a reconnect
        assert_eq!(harness.factory.get("b").unwrap().transport.destroy_count(), 0);
        assert!(harness.coordinator.peer(&PeerId::from("b")).is_some());
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let mut harness = Harness::start(config());
        harness.signaling.roster("a", &["a", "b", "c"]);
        harness.pump();

        harness.coordinator.end_session();
        harness.coordinator.end_session();

        assert!(harness.coordinator.is_ended());
        assert!(harness.coordinator.peer_ids().is_empty());
        assert_eq!(harness.signaling.close_count(), 1);
        for peer in ["b", "c"] {
            assert_eq!(harness.factory.get(peer).unwrap().transport.destroy_count(), 1);
        }
        assert!(!harness.coordinator.process_next().await);

        drop(harness.coordinator);
        assert_eq!(harness.signaling.close_count(), 1);
    }

    #[tokio::test]
    async fn test_handlers_ignore_events_after_end() {
        let mut harness = Harness::start(config());
        harness.signaling.roster("a", &["a", "b"]);
        harness.pump();
        harness.coordinator.end_session();
        harness.drain_events();

        harness.coordinator.handle_signaling_event(SignalingEvent::Signal {
            peer_id: PeerId::from("z"),
            payload: SignalPayload::Offer { sdp: "v=0\n".to_string() },
        });
        harness.coordinator.handle_signaling_event(SignalingEvent::Ready {
            self_id: PeerId::from("a"),
            peer_ids: vec![PeerId::from("a"), PeerId::from("y")],
            ice_servers: None,
        });
        harness.coordinator.handle_signaling_event(SignalingEvent::Reconnect);
        harness.coordinator.handle_peer_event(PeerEvent {
            peer_id: PeerId::from("b"),
            kind: PeerEventKind::Connect,
        });
        harness
            .coordinator
            .handle_network_transition(NetworkTransition::Disconnected);
        harness
            .coordinator
            .handle_network_transition(NetworkTransition::Reconnected);

        assert!(harness.coordinator.peer_ids().is_empty());
        assert_eq!(harness.factory.created().len(), 1);
        assert_eq!(harness.signaling.joins().len(), 1);
        assert!(harness.coordinator.is_online());
        assert!(harness.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_fails_when_rendezvous_unreachable() {
        let collaborators = Collaborators::new(
            Arc::new(RecordingSignaling::failing()),
            Arc::new(FakeTransportFactory::new()),
        )
        .with_reachability(Arc::new(ManualReachability::default()));

        let result = SessionCoordinator::initialize(config(), collaborators);
        assert!(matches!(result, Err(Error::Signaling(_))));
    }

    #[tokio::test]
    async fn test_mute_toggle_disables_tracks_on_peers() {
        let mut harness = Harness::start(config().with_initial_stream(av_stream("cam")));
        harness.connect(&["b"]);

        assert_eq!(harness.coordinator.toggle_default_stream_mute(TrackKind::Audio), Some(true));

        let stream = harness.coordinator.default_stream().unwrap();
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| !t.enabled));
        assert!(stream.tracks_of(TrackKind::Video).all(|t| t.enabled));

        let transport = harness.factory.get("b").unwrap().transport;
        assert_eq!(
            transport.calls()[0],
            TransportCall::SetTrackEnabled {
                stream_id: StreamId::from("cam"),
                track_id: "cam-audio".to_string(),
                enabled: false,
            }
        );
        assert!(harness.coordinator.streams()[0].is_audio_muted());

        transport.clear();
        assert_eq!(harness.coordinator.toggle_default_stream_mute(TrackKind::Audio), Some(false));
        assert_eq!(
            transport.calls()[0],
            TransportCall::SetTrackEnabled {
                stream_id: StreamId::from("cam"),
                track_id: "cam-audio".to_string(),
                enabled: true,
            }
        );
        assert!(harness
            .coordinator
            .default_stream()
            .unwrap()
            .tracks
            .iter()
            .all(|t| t.enabled));
    }

    #[tokio::test]
    async fn test_duplicate_channel_keeps_reports() {
        let mut harness = Harness::start(config());
        harness
            .coordinator
            .add_channel("cursor", ChannelOptions { local_data: json!(0) })
            .unwrap();
        harness.connect(&["b"]);
        harness.emit("b", PeerEventKind::Data(channel_bytes("cursor", json!(7))));
        harness.pump();

        let channel = harness
            .coordinator
            .add_channel("cursor", ChannelOptions { local_data: json!(1) })
            .unwrap();
        assert_eq!(channel.local_data(), &json!(1));
        assert_eq!(channel.view().peers[&PeerId::from("b")], json!(7));

        assert!(matches!(
            harness.coordinator.add_channel(USER_INFO_TAG, ChannelOptions::default()),
            Err(Error::ReservedChannel(_))
        ));
        assert_eq!(
            harness.coordinator.channel(USER_INFO_TAG).unwrap().local_data()["id"],
            json!(harness.coordinator.local_user().id.as_str())
        );
    }

    #[tokio::test]
    async fn test_drop_tears_down() {
        let harness = Harness::start(config());
        let Harness {
            coordinator,
            signaling,
            ..
        } = harness;
        drop(coordinator);
        assert_eq!(signaling.close_count(), 1);
    }
}
