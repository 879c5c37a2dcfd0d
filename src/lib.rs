//! Paircall core - call-session signaling for real-time audio/video
//!
//! This library negotiates, maintains, and tears down a peer connection
//! between two endpoints over an external signaling channel. It covers
//! both anonymous random matchmaking and direct addressed calls, and it
//! holds the ordering and mutual-exclusion invariants that make that
//! hard: at most one live peer link per session, ICE candidates never
//! applied before the remote description, no duplicate offers, and
//! teardown that in-flight async work cannot race past.
//!
//! The signaling transport, the platform media engine, and the capture
//! stack are collaborators supplied by the application behind the
//! `SignalingTransport`, `PeerConnector`, and `MediaDevices` traits.
//!
//! # Examples
//!
//! ```ignore
//! use paircall_core::{
//!     CallSession, MediaAcquirer, PeerIdentityString, SessionConfig, TransportId,
//! };
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! let media = Arc::new(Mutex::new(MediaAcquirer::new(devices)));
//! let session = CallSession::<PeerIdentityString, _>::new(
//!     SessionConfig::random(TransportId::new("my-transport-id")),
//!     transport,
//!     connector,
//!     media,
//! )?;
//!
//! let mut events = session.subscribe_events();
//! session.start().await?;
//! // route inbound signaling:
//! // session.handle_signal(event).await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core identifiers and data structures
pub mod types;

/// Partner identity abstraction
pub mod identity;

/// Signaling events, commands, and the transport seam
pub mod signaling;

/// Local media acquisition and the capture seam
pub mod media;

/// Peer link and the connection-engine seam
pub mod link;

/// Early-candidate buffering
pub mod ice;

/// Offer preconditions and ICE-restart gating
pub mod negotiation;

/// Caller/receiver resolution
pub mod role;

/// The call-session state machine
pub mod session;

// Re-export main types at crate root
pub use ice::PendingIceQueue;
pub use identity::{PeerIdentity, PeerIdentityString};
pub use link::{
    LinkError, LocalCandidateCallback, PeerConnectionApi, PeerConnector, PeerLink,
    RemoteTrackCallback, TrackSenderApi, TransportStateCallback,
};
pub use media::{
    FacingMode, LocalMedia, MediaAcquirer, MediaDevices, MediaError, MediaTrackApi,
    StreamConstraints, TrackKind, TrackReadyState, VideoInputInfo, VideoSelector,
};
pub use negotiation::{Negotiator, RestartGate, MAX_RESTART_ATTEMPTS, RESTART_COOLDOWN};
pub use role::RoleResolver;
pub use session::{
    CallSession, CallSessionBuilder, DirectContext, SessionConfig, SessionError, SessionEvent,
    SessionSnapshot,
};
pub use signaling::{
    SignalCommand, SignalEvent, SignalingClient, SignalingError, SignalingTransport,
};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::link::{PeerConnectionApi, PeerConnector};
    pub use crate::media::{FacingMode, MediaAcquirer, MediaDevices};
    pub use crate::session::{
        CallSession, CallSessionBuilder, DirectContext, SessionConfig, SessionEvent,
    };
    pub use crate::signaling::{SignalCommand, SignalEvent, SignalingTransport};
    pub use crate::types::{
        CallId, CallMode, CallRole, RoomId, SessionState, TransportId,
    };
}
