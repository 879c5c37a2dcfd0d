//! Core identifiers and data structures shared across the session core.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signaling-channel address of an endpoint.
///
/// Transport ids are opaque strings handed out by the signaling
/// transport. They order lexicographically, which the role resolver
/// relies on for Random-mode symmetry breaking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportId(pub String);

impl TransportId {
    /// Create a transport id from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TransportId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque room identifier assigned once negotiation has begun
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    /// Create a room id from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direct-call identifier, present from the moment of invitation and
/// independent of room assignment.
///
/// Wire payloads carry call ids as opaque strings; locally initiated
/// calls generate a fresh UUID-backed id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Create a call id from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call id for a locally initiated call
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the session finds its partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// Anonymous server-side matchmaking between arbitrary waiting users
    Random,
    /// Addressed call to a known peer identity
    Direct,
}

/// Which endpoint initiates the offer for this session.
///
/// Resolved once per session and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Creates and sends the offer
    Caller,
    /// Awaits the inbound offer and answers
    Receiver,
}

/// Call session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Session constructed, nothing announced yet
    Idle,
    /// Waiting for a partner (Random) or for call acceptance (Direct)
    Searching,
    /// Partner bound, role resolved
    Matched,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Transport reports a connected state, media flowing
    Connected,
    /// Terminal; a new call constructs a new session
    Inactive,
}

impl SessionState {
    /// Whether a transition between two states is part of the session
    /// state machine.
    ///
    /// Random-mode auto-continue re-enters `Searching` from any active
    /// state; `Inactive` is reachable from everywhere and terminal.
    #[must_use]
    pub fn can_transition(from: Self, to: Self) -> bool {
        if from == Self::Inactive {
            return false;
        }
        matches!(
            (from, to),
            (Self::Idle, Self::Searching)
                | (Self::Searching, Self::Matched)
                | (Self::Matched, Self::Negotiating)
                | (Self::Negotiating, Self::Connected)
                // Random-mode continuation re-enters Searching
                | (Self::Searching, Self::Searching)
                | (Self::Matched, Self::Searching)
                | (Self::Negotiating, Self::Searching)
                | (Self::Connected, Self::Searching)
        ) || to == Self::Inactive
    }

    /// Terminal check
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Inactive
    }
}

/// The two halves of the session-description exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// First half, produced by the caller
    Offer,
    /// Second half, produced by the receiver
    Answer,
}

/// An SDP-like session description as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Opaque description body owned by the media engine
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A discovered network path descriptor exchanged to establish
/// connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Build a candidate with no media-line association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Mirror of the underlying connection's signaling (negotiation) state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No exchange in flight
    Stable,
    /// Local offer applied, awaiting the remote answer
    HaveLocalOffer,
    /// Remote offer applied, answer owed
    HaveRemoteOffer,
    /// Connection closed
    Closed,
}

/// Mirror of the underlying connection's transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Freshly created
    New,
    /// Connectivity checks running
    Connecting,
    /// Media path established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity lost, will not recover without an ICE restart
    Failed,
    /// Connection closed
    Closed,
}

impl TransportState {
    /// States that trigger the gated ICE-restart recovery path
    #[must_use]
    pub fn needs_recovery(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// Availability advertised to the matchmaking/presence collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Free to be matched or called
    Available,
    /// In a call or negotiating one
    Busy,
}
