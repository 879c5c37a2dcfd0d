//! Peer link: ownership of one underlying peer connection.
//!
//! The real-time media engine is an external collaborator behind
//! [`PeerConnectionApi`]; [`PeerLink`] wraps exactly one connection
//! together with its outbound senders and description flags, and owns
//! the ordered shutdown sequence. A session never holds two non-closed
//! links at once; the session enforces that by closing the previous link
//! before storing a new one.

use crate::media::{LocalMedia, MediaTrackApi};
use crate::types::{
    IceCandidate, NegotiationState, SessionDescription, TransportState,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors from the connection engine
#[derive(Error, Debug)]
pub enum LinkError {
    /// Creating a description failed
    #[error("description error: {0}")]
    Description(String),

    /// Applying a candidate failed
    #[error("candidate error: {0}")]
    Candidate(String),

    /// Engine-level failure
    #[error("connection engine error: {0}")]
    Engine(String),
}

/// Callback invoked when the transport state changes
pub type TransportStateCallback = Box<dyn Fn(TransportState) + Send + Sync>;

/// Callback invoked when the engine discovers a local ICE candidate
pub type LocalCandidateCallback = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// Callback invoked when a remote track arrives
pub type RemoteTrackCallback = Box<dyn Fn(Arc<dyn MediaTrackApi>) + Send + Sync>;

/// An outbound track sender owned by the connection
#[async_trait]
pub trait TrackSenderApi: Send + Sync {
    /// Replace the outgoing track; `None` detaches it
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the replacement
    async fn replace_track(
        &self,
        track: Option<Arc<dyn MediaTrackApi>>,
    ) -> Result<(), LinkError>;
}

/// The negotiated transport object carrying audio/video between two
/// endpoints.
#[async_trait]
pub trait PeerConnectionApi: Send + Sync {
    /// Current negotiation (signaling) state
    fn negotiation_state(&self) -> NegotiationState;

    /// Current transport state
    fn transport_state(&self) -> TransportState;

    /// Create an offer; `ice_restart` requests fresh credentials
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot produce a description
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, LinkError>;

    /// Create an answer to the applied remote offer
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot produce a description
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    /// Apply a local description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), LinkError>;

    /// Apply a remote description
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError>;

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Attach an outbound track, returning its sender
    ///
    /// # Errors
    ///
    /// Returns error if the track cannot be attached
    async fn add_track(
        &self,
        track: Arc<dyn MediaTrackApi>,
    ) -> Result<Arc<dyn TrackSenderApi>, LinkError>;

    /// Install or remove the transport-state callback
    fn set_transport_state_callback(&self, callback: Option<TransportStateCallback>);

    /// Install or remove the local-candidate callback
    fn set_local_candidate_callback(&self, callback: Option<LocalCandidateCallback>);

    /// Install or remove the remote-track callback
    fn set_remote_track_callback(&self, callback: Option<RemoteTrackCallback>);

    /// Close the connection
    async fn close(&self);
}

/// Factory seam for connection objects
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    /// Create a fresh, unconnected peer connection
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot create a connection
    async fn connect(&self) -> Result<Arc<dyn PeerConnectionApi>, LinkError>;
}

/// One peer connection plus its senders and negotiation bookkeeping
pub struct PeerLink {
    connection: Arc<dyn PeerConnectionApi>,
    senders: Vec<Arc<dyn TrackSenderApi>>,
    has_local_description: bool,
    has_remote_description: bool,
    closed: bool,
}

impl PeerLink {
    /// Wrap a freshly created connection
    #[must_use]
    pub fn new(connection: Arc<dyn PeerConnectionApi>) -> Self {
        Self {
            connection,
            senders: Vec::new(),
            has_local_description: false,
            has_remote_description: false,
            closed: false,
        }
    }

    /// Handle to the underlying connection
    #[must_use]
    pub fn connection(&self) -> Arc<dyn PeerConnectionApi> {
        Arc::clone(&self.connection)
    }

    /// Current negotiation state
    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.connection.negotiation_state()
    }

    /// Current transport state
    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        self.connection.transport_state()
    }

    /// Whether a local description has been applied
    #[must_use]
    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    /// Whether a remote description has been applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    /// Whether the link has been shut down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Attach every track of the local capture as an outbound sender
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects a track
    pub async fn attach_local_media(&mut self, media: &LocalMedia) -> Result<(), LinkError> {
        for track in media.tracks() {
            let sender = self.connection.add_track(Arc::clone(track)).await?;
            self.senders.push(sender);
        }
        tracing::debug!(senders = self.senders.len(), "local media attached to link");
        Ok(())
    }

    /// Apply a local description and record it
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the description
    pub async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        self.connection.set_local_description(description).await?;
        self.has_local_description = true;
        Ok(())
    }

    /// Apply a remote description and record it
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the description
    pub async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        self.connection.set_remote_description(description).await?;
        self.has_remote_description = true;
        Ok(())
    }

    /// Apply a remote ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the candidate
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.connection.add_ice_candidate(candidate).await
    }

    /// Shut the link down.
    ///
    /// Order is mandatory: callbacks are detached first so no handler
    /// fires against a half-torn-down session, every sender's track is
    /// replaced with `None` and awaited, and only then is the connection
    /// closed. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.connection.set_transport_state_callback(None);
        self.connection.set_local_candidate_callback(None);
        self.connection.set_remote_track_callback(None);

        for sender in self.senders.drain(..) {
            if let Err(e) = sender.replace_track(None).await {
                tracing::debug!(error = %e, "sender track detach failed during shutdown");
            }
        }

        self.connection.close().await;
        tracing::debug!("peer link closed");
    }
}
