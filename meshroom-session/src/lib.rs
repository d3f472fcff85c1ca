//! Meshroom session coordinator
//!
//! Coordinates one participant's membership in a full-mesh peer-to-peer room.
//! A rendezvous service hands out the roster and relays negotiation payloads;
//! every pair of participants then talks over its own point-to-point
//! connection carrying media and a data channel.
//!
//! ## Architecture
//!
//! - **`SessionCoordinator`**: owns the local user, local streams, peer records
//!   and shared channels, and handles inbound events one at a time
//! - **`PeerConnection`**: one remote participant and its connection handle
//! - **`SharedChannel`**: a tagged payload replicated to every connected peer
//! - **`ConnectivityMonitor`**: reachability poll reporting network edges
//! - **`set_media_bitrate`**: bandwidth ceiling rewrite for session descriptions
//!
//! The rendezvous client and the connection transport are traits
//! ([`SignalingClient`], [`TransportFactory`]); this crate contains no
//! ICE/DTLS stack of its own.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use meshroom_session::{Collaborators, SessionConfig, SessionCoordinator};
//!
//! let config = SessionConfig::load(Some("meshroom.toml"))?.with_room("studio");
//! let collaborators = Collaborators::new(signaling, transports);
//!
//! let mut session = SessionCoordinator::initialize(config, collaborators)?;
//! let mut events = session.subscribe();
//! session.run().await;
//! ```

pub mod channel;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod media;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod streams;
pub mod transport;
pub mod types;
pub mod user;

#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;

pub use channel::{ChannelOptions, ChannelView, SharedChannel, WireMessage, USER_INFO_TAG};
pub use config::{LoggingConfig, SessionConfig};
pub use connectivity::{ConnectivityMonitor, NetworkTransition, ReachabilitySource, RouteReachability};
pub use coordinator::{Collaborators, SessionCoordinator, SessionEvent};
pub use error::{Error, Result};
pub use media::{MediaStream, MediaTrack, StreamInfo, StreamInfoUpdate, StreamOptions, TrackSettings};
pub use peer::{PeerConnection, PeerState, PeerStats};
pub use sdp::{set_media_bitrate, BandwidthCeilings};
pub use signaling::{IceConfig, IceServer, SignalPayload, SignalingClient, SignalingEvent};
pub use streams::{StreamDescriptor, StreamOwner};
pub use transport::{
    ConnectionOptions, PeerEvent, PeerEventKind, PeerEventSink, PeerTransport, TransportFactory,
};
pub use types::{ConnectionRole, PeerId, StreamId, TrackKind, UserId};
pub use user::{DeviceInfo, LocalUser, LocalUserData};
