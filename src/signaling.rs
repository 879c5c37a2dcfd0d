//! Signaling-channel events and the transport seam.
//!
//! The signaling channel itself (websocket, QUIC stream, whatever the
//! application supplies) is an external collaborator: the core only
//! emits [`SignalCommand`]s through a [`SignalingTransport`] and
//! consumes [`SignalEvent`]s routed in by the application. Payload
//! shapes follow the wire protocol; the exact framing is owned by the
//! transport.

use crate::types::{
    CallId, IceCandidate, PresenceStatus, RoomId, SessionDescription, TransportId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Signaling errors surfaced by the core itself
#[derive(Error, Debug)]
pub enum SignalingError {
    /// The transport rejected or failed to deliver a command
    #[error("transport error: {0}")]
    Transport(String),
}

/// Inbound signaling events consumed by the call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalEvent {
    /// Matchmaking paired this endpoint with a partner
    #[serde(rename = "match_found")]
    MatchFound {
        /// Signaling address of the partner
        partner_id: TransportId,
        /// Optional stable identity of the partner
        partner_identity: Option<String>,
        /// Room assigned by the server, if any
        room_id: Option<RoomId>,
    },

    /// Remote session description (offer)
    #[serde(rename = "offer")]
    Offer {
        /// Sender's transport id
        from: TransportId,
        /// The offer description
        description: SessionDescription,
        /// Optional stable identity of the sender
        source_identity: Option<String>,
    },

    /// Remote session description (answer)
    #[serde(rename = "answer")]
    Answer {
        /// Sender's transport id
        from: TransportId,
        /// The answer description
        description: SessionDescription,
    },

    /// Remote ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Sender's transport id
        from: TransportId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Partner explicitly stopped
    #[serde(rename = "peer:stopped")]
    PeerStopped {
        /// The partner that stopped
        peer_id: TransportId,
        /// Optional reason
        reason: Option<String>,
    },

    /// Partner dropped off the channel without stopping
    #[serde(rename = "peer:left")]
    PeerLeft {
        /// The partner that left
        peer_id: TransportId,
        /// Optional reason
        reason: Option<String>,
    },

    /// Incoming direct-call invitation (informational; call setup is
    /// handled by the application before the session is constructed)
    #[serde(rename = "call:incoming")]
    CallIncoming {
        /// Invitation call id
        call_id: CallId,
        /// Inviter's transport id
        from: TransportId,
        /// Inviter's display nickname
        from_nick: Option<String>,
    },

    /// Direct call accepted; carries the assigned room
    #[serde(rename = "call:accepted")]
    CallAccepted {
        /// The accepted call
        call_id: CallId,
        /// Room assigned for the call
        room_id: RoomId,
        /// Accepting endpoint's transport id
        from: TransportId,
        /// Accepting endpoint's stable user id
        from_user_id: Option<String>,
    },

    /// Callee is busy
    #[serde(rename = "call:busy")]
    CallBusy {
        /// The affected call
        call_id: CallId,
    },

    /// Callee declined
    #[serde(rename = "call:declined")]
    CallDeclined {
        /// The affected call
        call_id: CallId,
    },

    /// Invitation timed out
    #[serde(rename = "call:timeout")]
    CallTimeout {
        /// The affected call
        call_id: CallId,
    },

    /// Call ended by the other side or the server
    #[serde(rename = "call:ended")]
    CallEnded {
        /// The affected call
        call_id: CallId,
    },

    /// Partner toggled their camera
    #[serde(rename = "cam-toggle")]
    CamToggle {
        /// New camera state
        enabled: bool,
        /// Sender's transport id
        from: TransportId,
    },

    /// Partner entered or left picture-in-picture
    #[serde(rename = "pip:state")]
    PipState {
        /// Whether the partner is in PiP
        in_pip: bool,
        /// Sender's transport id
        from: TransportId,
        /// Room the state applies to
        room_id: RoomId,
    },
}

/// Outbound signaling commands produced by the call session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalCommand {
    /// Announce matchmaking intent
    #[serde(rename = "start")]
    Start,

    /// Stop and release any pairing
    #[serde(rename = "stop")]
    Stop,

    /// Release the current pairing and request the next one
    #[serde(rename = "next")]
    Next,

    /// Local session description (offer)
    #[serde(rename = "offer")]
    Offer {
        /// Partner's transport id
        target: TransportId,
        /// The offer description
        description: SessionDescription,
        /// Our stable identity, if shared
        source_identity: Option<String>,
    },

    /// Local session description (answer)
    #[serde(rename = "answer")]
    Answer {
        /// Partner's transport id
        target: TransportId,
        /// The answer description
        description: SessionDescription,
    },

    /// Local ICE candidate
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        /// Partner's transport id
        target: TransportId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Local camera toggled
    #[serde(rename = "cam-toggle")]
    CamToggle {
        /// New camera state
        enabled: bool,
        /// Partner's transport id, when bound
        target: Option<TransportId>,
        /// Room the state applies to, when bound
        room_id: Option<RoomId>,
    },

    /// Local picture-in-picture state changed
    #[serde(rename = "pip:state")]
    PipState {
        /// Whether we are in PiP
        in_pip: bool,
        /// Room the state applies to
        room_id: RoomId,
    },

    /// Acknowledge joining the assigned room
    #[serde(rename = "room:join:ack")]
    RoomJoinAck {
        /// The joined room
        room_id: RoomId,
    },

    /// Leave the current room
    #[serde(rename = "room:leave")]
    RoomLeave {
        /// The room being left
        room_id: RoomId,
    },

    /// Advertise availability to matchmaking/presence
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        /// Current availability
        status: PresenceStatus,
    },
}

/// Signaling transport seam.
///
/// Implement this for the application's channel (websocket, message bus,
/// ...). Delivery is assumed reliable and ordered; the core never
/// retries sends.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a command to the signaling server
    async fn send(&self, command: SignalCommand) -> Result<(), Self::Error>;
}

/// Thin wrapper adding structured logging around a transport
pub struct SignalingClient<T: SignalingTransport> {
    transport: Arc<T>,
}

impl<T: SignalingTransport> SignalingClient<T> {
    /// Wrap a transport
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Send a command, logging its type
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to deliver
    #[tracing::instrument(skip(self, command), fields(command_type = command_type(&command)))]
    pub async fn send(&self, command: SignalCommand) -> Result<(), SignalingError> {
        tracing::debug!("sending signaling command");
        self.transport
            .send(command)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Access the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }
}

/// Helper extracting a command's type name for tracing
fn command_type(command: &SignalCommand) -> &'static str {
    match command {
        SignalCommand::Start => "start",
        SignalCommand::Stop => "stop",
        SignalCommand::Next => "next",
        SignalCommand::Offer { .. } => "offer",
        SignalCommand::Answer { .. } => "answer",
        SignalCommand::IceCandidate { .. } => "ice-candidate",
        SignalCommand::CamToggle { .. } => "cam-toggle",
        SignalCommand::PipState { .. } => "pip:state",
        SignalCommand::RoomJoinAck { .. } => "room:join:ack",
        SignalCommand::RoomLeave { .. } => "room:leave",
        SignalCommand::PresenceUpdate { .. } => "presence:update",
    }
}
