//! The call session: one state machine per active or pending call.
//!
//! The session owns at most one [`PeerLink`], routes signaling events to
//! it, and exposes the lifecycle operations (`start`, `next`, `stop`,
//! `abort`) to the surrounding application. All mutation funnels through
//! the session; collaborators receive state snapshots over a broadcast
//! channel and never get mutable handles.
//!
//! Every multi-step async operation re-validates the session epoch and
//! partner binding after each suspension point. `abort` flips the
//! inactive flag before its first await, so in-flight steps observe it
//! and self-abort instead of completing.

use crate::ice::PendingIceQueue;
use crate::identity::PeerIdentity;
use crate::link::{PeerConnector, PeerLink};
use crate::media::{FacingMode, MediaAcquirer, MediaError, MediaTrackApi, TrackKind};
use crate::negotiation::{Negotiator, RestartGate};
use crate::role::RoleResolver;
use crate::signaling::{SignalCommand, SignalEvent, SignalingClient, SignalingTransport};
use crate::types::{
    CallId, CallMode, CallRole, IceCandidate, NegotiationState, PresenceStatus, RoomId, SdpKind,
    SessionDescription, SessionState, TransportId, TransportState,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

/// Debounce window for user-initiated `next`
const NEXT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Sampling period of the audio-level meter
const METER_INTERVAL: Duration = Duration::from_millis(200);

/// Session errors surfaced to the application
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session has already reached its terminal state
    #[error("session is inactive")]
    Inactive,

    /// The operation is not valid in the current state
    #[error("operation not valid in state {0:?}")]
    InvalidState(SessionState),

    /// The operation requires a different call mode
    #[error("operation requires {0:?} mode")]
    WrongMode(CallMode),

    /// Direct sessions must carry their call-setup context
    #[error("direct mode requires a DirectContext")]
    MissingDirectContext,

    /// Local capture failed; fatal for this call attempt
    #[error(transparent)]
    Media(#[from] MediaError),

    /// The connection engine failed
    #[error(transparent)]
    Link(#[from] crate::link::LinkError),
}

/// Call-setup context carried into a Direct session.
///
/// The invitation exchange happens before the session exists; what the
/// session needs from it is the call id and, crucially, who initiated.
/// The initiator flag is the only input to direct-mode role resolution.
#[derive(Debug, Clone)]
pub struct DirectContext {
    /// Call identifier, present from the moment of invitation
    pub call_id: CallId,
    /// Whether this endpoint sent the invitation
    pub initiated_locally: bool,
    /// Partner address when already known (invitee side)
    pub partner_hint: Option<TransportId>,
}

/// Static configuration of one session
#[derive(Debug, Clone)]
pub struct SessionConfig<I: PeerIdentity> {
    /// Matchmaking or addressed call
    pub mode: CallMode,
    /// Our signaling-channel address
    pub local_transport_id: TransportId,
    /// Our stable identity, shared with partners when present
    pub local_identity: Option<I>,
    /// Camera preference for acquisition fallback
    pub preferred_facing: FacingMode,
    /// Direct-call context; required when `mode` is Direct
    pub direct: Option<DirectContext>,
    /// Debounce window applied to `next`
    pub next_debounce: Duration,
}

impl<I: PeerIdentity> SessionConfig<I> {
    /// Configuration for a Random-mode session
    #[must_use]
    pub fn random(local_transport_id: TransportId) -> Self {
        Self {
            mode: CallMode::Random,
            local_transport_id,
            local_identity: None,
            preferred_facing: FacingMode::User,
            direct: None,
            next_debounce: NEXT_DEBOUNCE,
        }
    }

    /// Configuration for a Direct-mode session
    #[must_use]
    pub fn direct(local_transport_id: TransportId, context: DirectContext) -> Self {
        Self {
            mode: CallMode::Direct,
            local_transport_id,
            local_identity: None,
            preferred_facing: FacingMode::User,
            direct: Some(context),
            next_debounce: NEXT_DEBOUNCE,
        }
    }

    /// Attach our identity
    #[must_use]
    pub fn with_identity(mut self, identity: I) -> Self {
        self.local_identity = Some(identity);
        self
    }
}

/// State snapshots pushed to the rendering collaborator
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session state machine advanced
    StateChanged(SessionState),
    /// The loading indicator should show or hide
    LoadingChanged {
        /// Whether negotiation work is pending
        loading: bool,
    },
    /// The local capture was attached or released
    LocalStreamChanged {
        /// Whether a capture is attached
        attached: bool,
    },
    /// A remote track arrived
    RemoteTrackAdded {
        /// Audio or video
        kind: TrackKind,
    },
    /// All remote tracks were dropped
    RemoteStreamCleared,
    /// Local microphone presentation toggled
    MicStateChanged {
        /// New state
        enabled: bool,
    },
    /// Local camera presentation toggled
    CamStateChanged {
        /// New state
        enabled: bool,
    },
    /// Partner's camera toggled
    RemoteCamStateChanged {
        /// New state
        enabled: bool,
    },
    /// Partner entered or left picture-in-picture
    RemotePipChanged {
        /// Whether the partner is in PiP
        in_pip: bool,
    },
    /// Audio-level meter sample
    MicLevelChanged {
        /// Instantaneous input level
        level: f32,
    },
    /// Transport recovery gave up
    ConnectionLost,
    /// Local capture failed; user must retry start
    CaptureFailed {
        /// Human-readable cause
        reason: String,
    },
}

/// Read-only view of the session's identifiers and progress
#[derive(Debug, Clone)]
pub struct SessionSnapshot<I: PeerIdentity> {
    /// Call mode
    pub mode: CallMode,
    /// Current state
    pub state: SessionState,
    /// Resolved role, once matched
    pub role: Option<CallRole>,
    /// Bound partner address
    pub partner: Option<TransportId>,
    /// Partner's stable identity, when shared
    pub partner_identity: Option<I>,
    /// Assigned room
    pub room_id: Option<RoomId>,
    /// Direct-call id
    pub call_id: Option<CallId>,
    /// Last known state of the partner's camera
    pub remote_cam_enabled: bool,
}

/// Mutable session fields, guarded by the session's task queue
struct SessionCore<I: PeerIdentity> {
    state: SessionState,
    role: Option<CallRole>,
    partner: Option<TransportId>,
    partner_identity: Option<I>,
    room_id: Option<RoomId>,
    call_id: Option<CallId>,
    link: Option<PeerLink>,
    remote_tracks: Vec<Arc<dyn MediaTrackApi>>,
    remote_cam_enabled: bool,
}

/// One call session.
///
/// Construct with [`CallSession::new`] (or [`CallSessionBuilder`]),
/// subscribe to [`SessionEvent`]s, call [`start`](Self::start), and
/// route inbound signaling through
/// [`handle_signal`](Self::handle_signal). `Inactive` is terminal: a new
/// call always constructs a new session.
pub struct CallSession<I: PeerIdentity, T: SignalingTransport> {
    config: SessionConfig<I>,
    signaling: SignalingClient<T>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<AsyncMutex<MediaAcquirer>>,
    negotiator: Negotiator,
    ice: PendingIceQueue,
    core: RwLock<SessionCore<I>>,
    active: AtomicBool,
    torn_down: AtomicBool,
    epoch: AtomicU64,
    backgrounded: AtomicBool,
    in_pip: AtomicBool,
    pending_matches: parking_lot::Mutex<HashSet<TransportId>>,
    last_next: parking_lot::Mutex<Option<Instant>>,
    meter: parking_lot::Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
    self_weak: Weak<Self>,
}

impl<I: PeerIdentity, T: SignalingTransport> CallSession<I, T> {
    /// Create a session.
    ///
    /// The media acquirer is shared so the local capture survives from
    /// one session to the next.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MissingDirectContext`] for a Direct
    /// configuration without its call-setup context.
    pub fn new(
        config: SessionConfig<I>,
        transport: Arc<T>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<AsyncMutex<MediaAcquirer>>,
    ) -> Result<Arc<Self>, SessionError> {
        if config.mode == CallMode::Direct && config.direct.is_none() {
            return Err(SessionError::MissingDirectContext);
        }
        let (events, _) = broadcast::channel(256);
        let call_id = config.direct.as_ref().map(|d| d.call_id.clone());
        Ok(Arc::new_cyclic(|weak| Self {
            config,
            signaling: SignalingClient::new(transport),
            connector,
            media,
            negotiator: Negotiator::default(),
            ice: PendingIceQueue::new(),
            core: RwLock::new(SessionCore {
                state: SessionState::Idle,
                role: None,
                partner: None,
                partner_identity: None,
                room_id: None,
                call_id,
                link: None,
                remote_tracks: Vec::new(),
                remote_cam_enabled: true,
            }),
            active: AtomicBool::new(true),
            torn_down: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            backgrounded: AtomicBool::new(false),
            in_pip: AtomicBool::new(false),
            pending_matches: parking_lot::Mutex::new(HashSet::new()),
            last_next: parking_lot::Mutex::new(None),
            meter: parking_lot::Mutex::new(None),
            events,
            self_weak: weak.clone(),
        }))
    }

    /// Subscribe to state snapshots
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the session has not yet reached its terminal state
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        self.core.read().await.state
    }

    /// Read-only view of identifiers and progress
    pub async fn snapshot(&self) -> SessionSnapshot<I> {
        let core = self.core.read().await;
        SessionSnapshot {
            mode: self.config.mode,
            state: core.state,
            role: core.role,
            partner: core.partner.clone(),
            partner_identity: core.partner_identity.clone(),
            room_id: core.room_id.clone(),
            call_id: core.call_id.clone(),
            remote_cam_enabled: core.remote_cam_enabled,
        }
    }

    /// Start the session: acquire local media and announce intent.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not Idle or capture fails; a
    /// capture failure is fatal for this attempt and tears the session
    /// down.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }
        {
            let mut core = self.core.write().await;
            if core.state != SessionState::Idle {
                return Err(SessionError::InvalidState(core.state));
            }
            Self::transition(&mut core, SessionState::Searching);
        }
        self.emit(SessionEvent::StateChanged(SessionState::Searching));
        self.emit(SessionEvent::LoadingChanged { loading: true });

        let epoch = self.current_epoch();
        let acquired = {
            let mut acquirer = self.media.lock().await;
            acquirer.acquire(self.config.preferred_facing).await
        };
        if let Err(e) = acquired {
            self.emit(SessionEvent::CaptureFailed {
                reason: e.to_string(),
            });
            self.abort().await;
            return Err(e.into());
        }
        self.emit(SessionEvent::LocalStreamChanged { attached: true });

        if !self.is_active() || self.current_epoch() != epoch {
            // aborted while the capture request was in flight
            return Ok(());
        }

        if self.config.mode == CallMode::Random {
            self.send_signal(SignalCommand::Start).await;
            self.send_signal(SignalCommand::PresenceUpdate {
                status: PresenceStatus::Available,
            })
            .await;
        }
        Ok(())
    }

    /// Skip to the next partner (Random mode).
    ///
    /// Tears down only the peer link and remote-side state; the local
    /// capture is deliberately kept so consecutive matches do not
    /// flicker the camera. Rapid repeat calls inside the debounce window
    /// collapse into one.
    ///
    /// # Errors
    ///
    /// Returns error outside Random mode or after the session ended.
    #[tracing::instrument(skip(self))]
    pub async fn next(&self) -> Result<(), SessionError> {
        if self.config.mode != CallMode::Random {
            return Err(SessionError::WrongMode(CallMode::Random));
        }
        if !self.is_active() {
            return Err(SessionError::Inactive);
        }
        {
            let mut last = self.last_next.lock();
            if let Some(previous) = *last {
                if previous.elapsed() < self.config.next_debounce {
                    tracing::debug!("next debounced");
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        tracing::info!("skipping to next partner");
        let room = self.clear_peer_state().await;
        {
            let mut core = self.core.write().await;
            Self::transition(&mut core, SessionState::Searching);
        }
        self.emit(SessionEvent::StateChanged(SessionState::Searching));
        self.emit(SessionEvent::LoadingChanged { loading: true });

        if let Some(room_id) = room {
            self.send_signal(SignalCommand::RoomLeave { room_id }).await;
        }
        self.send_signal(SignalCommand::Next).await;
        self.send_signal(SignalCommand::PresenceUpdate {
            status: PresenceStatus::Available,
        })
        .await;
        Ok(())
    }

    /// User-initiated stop: release the pairing and tear down
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        self.bump_epoch();
        if was_active {
            self.send_signal(SignalCommand::Stop).await;
        }
        self.teardown().await;
    }

    /// Abort the session.
    ///
    /// The inactive flag flips before the first await, so any in-flight
    /// async step observes it and self-aborts. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.bump_epoch();
        self.teardown().await;
    }

    /// Route an inbound signaling event to the session
    #[tracing::instrument(skip(self, event))]
    pub async fn handle_signal(&self, event: SignalEvent) {
        match event {
            SignalEvent::MatchFound {
                partner_id,
                partner_identity,
                room_id,
            } => self.on_match(partner_id, partner_identity, room_id).await,
            SignalEvent::Offer {
                from,
                description,
                source_identity,
            } => self.on_offer(from, description, source_identity).await,
            SignalEvent::Answer { from, description } => self.on_answer(from, description).await,
            SignalEvent::IceCandidate { from, candidate } => self.on_ice(from, candidate).await,
            SignalEvent::PeerStopped { peer_id, reason } | SignalEvent::PeerLeft { peer_id, reason } => {
                self.on_peer_gone(peer_id, reason).await;
            }
            SignalEvent::CallIncoming { call_id, from, .. } => {
                // call setup happens before the session exists
                tracing::debug!(%call_id, %from, "incoming call event observed");
            }
            SignalEvent::CallAccepted {
                call_id,
                room_id,
                from,
                from_user_id,
            } => {
                if self.config.mode == CallMode::Direct && self.is_our_call(&call_id).await {
                    self.on_match(from, from_user_id, Some(room_id)).await;
                } else {
                    tracing::debug!(%call_id, "call acceptance for unknown call ignored");
                }
            }
            SignalEvent::CallBusy { call_id } => self.on_call_terminal(call_id, "busy").await,
            SignalEvent::CallDeclined { call_id } => {
                self.on_call_terminal(call_id, "declined").await;
            }
            SignalEvent::CallTimeout { call_id } => self.on_call_terminal(call_id, "timeout").await,
            SignalEvent::CallEnded { call_id } => self.on_call_terminal(call_id, "ended").await,
            SignalEvent::CamToggle { enabled, from } => self.on_remote_cam(from, enabled).await,
            SignalEvent::PipState { in_pip, from, .. } => self.on_remote_pip(from, in_pip).await,
        }
    }

    /// Record the app's foreground state; regaining the foreground
    /// retries transport recovery if the link degraded meanwhile.
    pub async fn set_foreground(&self, foregrounded: bool) {
        self.backgrounded.store(!foregrounded, Ordering::SeqCst);
        if !foregrounded || !self.is_active() {
            return;
        }
        let degraded = {
            let core = self.core.read().await;
            core.link
                .as_ref()
                .is_some_and(|link| link.transport_state().needs_recovery())
        };
        if degraded {
            self.recover_transport(self.current_epoch()).await;
        }
    }

    /// Record and relay the local picture-in-picture state
    pub async fn set_picture_in_picture(&self, in_pip: bool) {
        self.in_pip.store(in_pip, Ordering::SeqCst);
        let room = { self.core.read().await.room_id.clone() };
        if let Some(room_id) = room {
            self.send_signal(SignalCommand::PipState { in_pip, room_id })
                .await;
        }
    }

    /// Toggle camera presentation without re-acquiring the device
    pub async fn set_camera_enabled(&self, enabled: bool) {
        if let Some(media) = self.media.lock().await.current() {
            media.set_video_enabled(enabled);
        }
        self.emit(SessionEvent::CamStateChanged { enabled });
        let (target, room_id) = {
            let core = self.core.read().await;
            (core.partner.clone(), core.room_id.clone())
        };
        self.send_signal(SignalCommand::CamToggle {
            enabled,
            target,
            room_id,
        })
        .await;
    }

    /// Toggle microphone presentation without re-acquiring the device
    pub async fn set_microphone_enabled(&self, enabled: bool) {
        if let Some(media) = self.media.lock().await.current() {
            media.set_audio_enabled(enabled);
        }
        self.emit(SessionEvent::MicStateChanged { enabled });
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    async fn on_match(
        &self,
        partner: TransportId,
        identity: Option<String>,
        room_id: Option<RoomId>,
    ) {
        if !self.is_active() {
            tracing::debug!(%partner, "match ignored, session inactive");
            return;
        }
        // duplicate-delivery guard, keyed by partner id
        if !self.pending_matches.lock().insert(partner.clone()) {
            tracing::debug!(%partner, "match for this partner already in flight");
            return;
        }
        let outcome = self.process_match(&partner, identity, room_id).await;
        self.pending_matches.lock().remove(&partner);

        if let Err(e) = outcome {
            tracing::warn!(%partner, error = %e, "match processing failed");
            match (&e, self.config.mode) {
                // capture failure already tore the session down
                (SessionError::Media(_), _) => {}
                (_, CallMode::Random) => self.auto_continue().await,
                (_, CallMode::Direct) => self.abort().await,
            }
        }
    }

    async fn process_match(
        &self,
        partner: &TransportId,
        identity: Option<String>,
        room_id: Option<RoomId>,
    ) -> Result<(), SessionError> {
        let epoch = self.current_epoch();
        let role;
        {
            let mut core = self.core.write().await;
            if core.partner.as_ref() == Some(partner) {
                tracing::debug!(%partner, "match re-delivered for bound partner, ignoring");
                return Ok(());
            }
            if core.partner.is_some() && core.state != SessionState::Searching {
                tracing::warn!(%partner, state = ?core.state, "partner reassignment past match rejected");
                return Ok(());
            }
            if core.state != SessionState::Searching {
                tracing::debug!(state = ?core.state, "match outside Searching ignored");
                return Ok(());
            }
            core.partner = Some(partner.clone());
            core.partner_identity = identity
                .as_deref()
                .and_then(|s| I::from_string_repr(s).ok());
            core.room_id = room_id.clone();
            role = match self.config.mode {
                CallMode::Random => {
                    RoleResolver::resolve_random(&self.config.local_transport_id, partner)
                }
                CallMode::Direct => {
                    // enforced at construction
                    let initiated = self
                        .config
                        .direct
                        .as_ref()
                        .map_or(false, |d| d.initiated_locally);
                    RoleResolver::resolve_direct(initiated)
                }
            };
            core.role = Some(role);
            Self::transition(&mut core, SessionState::Matched);
            Self::transition(&mut core, SessionState::Negotiating);
        }
        self.emit(SessionEvent::StateChanged(SessionState::Matched));
        self.emit(SessionEvent::StateChanged(SessionState::Negotiating));
        tracing::info!(%partner, ?role, "partner matched");

        if let Some(room_id) = room_id.clone() {
            self.send_signal(SignalCommand::RoomJoinAck { room_id }).await;
        }
        self.send_signal(SignalCommand::PresenceUpdate {
            status: PresenceStatus::Busy,
        })
        .await;

        // local media: lazily acquired, reused across matches
        let media = {
            let mut acquirer = self.media.lock().await;
            match acquirer.acquire(self.config.preferred_facing).await {
                Ok(media) => media,
                Err(e) => {
                    drop(acquirer);
                    self.emit(SessionEvent::CaptureFailed {
                        reason: e.to_string(),
                    });
                    self.abort().await;
                    return Err(e.into());
                }
            }
        };
        self.emit(SessionEvent::LocalStreamChanged { attached: true });
        if !self.still_current(epoch, partner).await {
            return Ok(());
        }

        let connection = self.connector.connect().await?;
        if !self.still_current(epoch, partner).await {
            connection.close().await;
            return Ok(());
        }

        let mut link = PeerLink::new(connection);
        link.attach_local_media(&media).await?;
        self.install_callbacks(&link, partner.clone(), epoch);

        {
            let mut core = self.core.write().await;
            // a session never holds two non-closed links
            if let Some(mut previous) = core.link.take() {
                previous.shutdown().await;
            }
            if !self.is_active()
                || self.current_epoch() != epoch
                || core.partner.as_ref() != Some(partner)
            {
                drop(core);
                link.shutdown().await;
                return Ok(());
            }
            core.link = Some(link);
        }

        if role == CallRole::Caller {
            self.send_offer(epoch, partner, false).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Offer / answer / candidates
    // ------------------------------------------------------------------

    async fn send_offer(
        &self,
        epoch: u64,
        partner: &TransportId,
        ice_restart: bool,
    ) -> Result<(), SessionError> {
        let connection = {
            let core = self.core.read().await;
            let Some(link) = core.link.as_ref() else {
                return Ok(());
            };
            if !ice_restart && !Negotiator::offer_preconditions_met(link) {
                if link.has_remote_description() {
                    // the partner's offer won the race; normal outcome
                    tracing::debug!("remote description already applied, skipping offer");
                } else {
                    tracing::debug!(
                        state = ?link.negotiation_state(),
                        "offer preconditions not met, skipping"
                    );
                }
                return Ok(());
            }
            link.connection()
        };

        let offer = connection.create_offer(ice_restart).await?;
        if !self.still_current(epoch, partner).await {
            return Ok(());
        }

        {
            let mut core = self.core.write().await;
            if core.partner.as_ref() != Some(partner) {
                return Ok(());
            }
            let Some(link) = core.link.as_mut() else {
                return Ok(());
            };
            if !ice_restart && link.has_remote_description() {
                // the partner's offer landed while ours was being created;
                // both sides may race to be caller, so this is a normal
                // outcome, not an error
                tracing::debug!("remote offer arrived during offer creation, discarding ours");
                return Ok(());
            }
            link.set_local_description(offer.clone()).await?;
        }
        if !self.still_current(epoch, partner).await {
            return Ok(());
        }

        self.send_signal(SignalCommand::Offer {
            target: partner.clone(),
            description: offer,
            source_identity: self
                .config
                .local_identity
                .as_ref()
                .map(PeerIdentity::to_string_repr),
        })
        .await;
        Ok(())
    }

    async fn on_offer(
        &self,
        from: TransportId,
        description: SessionDescription,
        source_identity: Option<String>,
    ) {
        if !self.is_active() {
            return;
        }
        if description.kind != SdpKind::Offer {
            tracing::debug!("non-offer description on offer event ignored");
            return;
        }
        let epoch = self.current_epoch();
        let connection = {
            let mut core = self.core.write().await;
            if core.partner.as_ref() != Some(&from) {
                tracing::debug!(%from, "offer from unbound peer ignored");
                return;
            }
            if let Some(identity) = source_identity.as_deref() {
                core.partner_identity = I::from_string_repr(identity).ok();
            }
            let Some(link) = core.link.as_mut() else {
                tracing::debug!("offer arrived before the link exists, ignoring");
                return;
            };
            if link.has_remote_description() {
                // duplicate offer once negotiated is benign
                tracing::debug!(%from, "duplicate offer ignored");
                return;
            }
            if let Err(e) = link.set_remote_description(description).await {
                tracing::warn!(error = %e, "applying remote offer failed");
                return;
            }
            link.connection()
        };

        self.drain_candidates(epoch, &from).await;
        if !self.still_current(epoch, &from).await {
            return;
        }

        if connection.negotiation_state() == NegotiationState::HaveRemoteOffer {
            let answer = match connection.create_answer().await {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!(error = %e, "answer creation failed");
                    return;
                }
            };
            if !self.still_current(epoch, &from).await {
                return;
            }
            {
                let mut core = self.core.write().await;
                if core.partner.as_ref() != Some(&from) {
                    return;
                }
                let Some(link) = core.link.as_mut() else {
                    return;
                };
                if let Err(e) = link.set_local_description(answer.clone()).await {
                    tracing::warn!(error = %e, "applying local answer failed");
                    return;
                }
            }
            if !self.still_current(epoch, &from).await {
                return;
            }
            self.send_signal(SignalCommand::Answer {
                target: from,
                description: answer,
            })
            .await;
        }
    }

    async fn on_answer(&self, from: TransportId, description: SessionDescription) {
        if !self.is_active() {
            return;
        }
        if description.kind != SdpKind::Answer {
            tracing::debug!("non-answer description on answer event ignored");
            return;
        }
        let epoch = self.current_epoch();
        {
            let mut core = self.core.write().await;
            if core.partner.as_ref() != Some(&from) {
                tracing::debug!(%from, "answer from unbound peer ignored");
                return;
            }
            let Some(link) = core.link.as_mut() else {
                tracing::debug!("answer arrived before the link exists, ignoring");
                return;
            };
            if link.negotiation_state() != NegotiationState::HaveLocalOffer
                || link.has_remote_description()
            {
                tracing::debug!("answer without matching local offer ignored");
                return;
            }
            if let Err(e) = link.set_remote_description(description).await {
                tracing::warn!(error = %e, "applying remote answer failed");
                return;
            }
        }
        self.drain_candidates(epoch, &from).await;
    }

    async fn on_ice(&self, from: TransportId, candidate: IceCandidate) {
        if !self.is_active() {
            return;
        }
        let connection = {
            let core = self.core.read().await;
            if core.partner.as_ref() == Some(&from) {
                core.link
                    .as_ref()
                    .filter(|link| link.has_remote_description())
                    .map(PeerLink::connection)
            } else {
                None
            }
        };
        match connection {
            Some(connection) => {
                if let Err(e) = connection.add_ice_candidate(candidate).await {
                    tracing::debug!(error = %e, "candidate application failed");
                }
            }
            None => self.ice.enqueue(&from, candidate),
        }
    }

    /// Apply every buffered candidate for a partner, in arrival order
    async fn drain_candidates(&self, epoch: u64, partner: &TransportId) {
        let queued = self.ice.drain(partner);
        if queued.is_empty() {
            return;
        }
        tracing::debug!(%partner, count = queued.len(), "applying buffered ice candidates");
        for candidate in queued {
            if !self.still_current(epoch, partner).await {
                return;
            }
            let connection = {
                let core = self.core.read().await;
                if core.partner.as_ref() != Some(partner) {
                    return;
                }
                core.link.as_ref().map(PeerLink::connection)
            };
            let Some(connection) = connection else {
                return;
            };
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::debug!(error = %e, "buffered candidate application failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport state and recovery
    // ------------------------------------------------------------------

    async fn on_transport_state(&self, state: TransportState, epoch: u64) {
        if !self.is_active() || self.current_epoch() != epoch {
            return;
        }
        tracing::debug!(?state, "transport state changed");
        match state {
            TransportState::Connected => {
                {
                    let mut core = self.core.write().await;
                    if core.state != SessionState::Negotiating
                        && core.state != SessionState::Connected
                    {
                        return;
                    }
                    Self::transition(&mut core, SessionState::Connected);
                }
                self.negotiator.reset();
                self.emit(SessionEvent::StateChanged(SessionState::Connected));
                self.emit(SessionEvent::LoadingChanged { loading: false });
                self.start_meter();
            }
            state if state.needs_recovery() => self.recover_transport(epoch).await,
            _ => {}
        }
    }

    async fn recover_transport(&self, epoch: u64) {
        let partner = { self.core.read().await.partner.clone() };
        let Some(partner) = partner else {
            return;
        };
        let foregrounded = !self.backgrounded.load(Ordering::SeqCst);
        match self.negotiator.begin_restart(foregrounded) {
            RestartGate::Granted => {
                tracing::info!(attempt = self.negotiator.attempts(), "attempting ice restart");
                let result = self.send_offer(epoch, &partner, true).await;
                self.negotiator.finish_restart();
                if let Err(e) = result {
                    tracing::warn!(error = %e, "ice restart offer failed");
                    self.connection_lost().await;
                }
            }
            RestartGate::Exhausted => {
                tracing::warn!("ice restart budget exhausted");
                self.connection_lost().await;
            }
            gate => tracing::debug!(?gate, "ice restart gated"),
        }
    }

    async fn connection_lost(&self) {
        self.emit(SessionEvent::ConnectionLost);
        match self.config.mode {
            CallMode::Random => self.auto_continue().await,
            CallMode::Direct => self.abort().await,
        }
    }

    async fn on_peer_gone(&self, peer: TransportId, reason: Option<String>) {
        if !self.is_active() {
            return;
        }
        {
            let core = self.core.read().await;
            if core.partner.as_ref() != Some(&peer) {
                tracing::debug!(%peer, "departure of non-partner ignored");
                return;
            }
        }
        tracing::info!(%peer, reason = reason.as_deref().unwrap_or("none"), "partner left");
        match self.config.mode {
            CallMode::Random => self.auto_continue().await,
            CallMode::Direct => self.abort().await,
        }
    }

    async fn on_call_terminal(&self, call_id: CallId, outcome: &str) {
        if !self.is_our_call(&call_id).await {
            tracing::debug!(%call_id, outcome, "terminal event for unknown call ignored");
            return;
        }
        tracing::info!(%call_id, outcome, "call terminated externally");
        self.abort().await;
    }

    async fn on_remote_cam(&self, from: TransportId, enabled: bool) {
        let bound = {
            let mut core = self.core.write().await;
            if core.partner.as_ref() == Some(&from) {
                core.remote_cam_enabled = enabled;
                true
            } else {
                false
            }
        };
        if bound {
            self.emit(SessionEvent::RemoteCamStateChanged { enabled });
        }
    }

    async fn on_remote_pip(&self, from: TransportId, in_pip: bool) {
        let bound = { self.core.read().await.partner.as_ref() == Some(&from) };
        if bound {
            self.emit(SessionEvent::RemotePipChanged { in_pip });
        }
    }

    async fn on_remote_track(&self, track: Arc<dyn MediaTrackApi>, epoch: u64) {
        if !self.is_active() || self.current_epoch() != epoch {
            track.stop();
            return;
        }
        let kind = track.kind();
        {
            let mut core = self.core.write().await;
            core.remote_tracks.push(track);
        }
        self.emit(SessionEvent::RemoteTrackAdded { kind });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Re-enter Searching after the partner dropped (Random mode)
    async fn auto_continue(&self) {
        if !self.is_active() {
            return;
        }
        tracing::info!("partner gone, continuing search");
        let room = self.clear_peer_state().await;
        {
            let mut core = self.core.write().await;
            Self::transition(&mut core, SessionState::Searching);
        }
        self.emit(SessionEvent::StateChanged(SessionState::Searching));
        self.emit(SessionEvent::LoadingChanged { loading: true });
        if let Some(room_id) = room {
            self.send_signal(SignalCommand::RoomLeave { room_id }).await;
        }
        self.send_signal(SignalCommand::Start).await;
        self.send_signal(SignalCommand::PresenceUpdate {
            status: PresenceStatus::Available,
        })
        .await;
    }

    /// Drop the peer link and remote-side state, keeping local media
    async fn clear_peer_state(&self) -> Option<RoomId> {
        self.bump_epoch();
        self.stop_meter();
        let (link, room, remote_tracks) = {
            let mut core = self.core.write().await;
            core.partner = None;
            core.partner_identity = None;
            core.role = None;
            core.remote_cam_enabled = true;
            (
                core.link.take(),
                core.room_id.take(),
                std::mem::take(&mut core.remote_tracks),
            )
        };
        if let Some(mut link) = link {
            link.shutdown().await;
        }
        for track in remote_tracks {
            track.set_enabled(false);
            track.stop();
        }
        self.ice.discard_all();
        self.emit(SessionEvent::RemoteStreamCleared);
        room
    }

    /// Full teardown to the terminal state. Idempotent.
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_meter();
        let (link, room, remote_tracks) = {
            let mut core = self.core.write().await;
            Self::transition(&mut core, SessionState::Inactive);
            (
                core.link.take(),
                core.room_id.clone(),
                std::mem::take(&mut core.remote_tracks),
            )
        };
        self.emit(SessionEvent::StateChanged(SessionState::Inactive));

        // detach callbacks, null out senders, close the connection
        if let Some(mut link) = link {
            link.shutdown().await;
        }
        // stop remote tracks, disable first
        for track in remote_tracks {
            track.set_enabled(false);
            track.stop();
        }
        // release the capture device
        {
            let mut acquirer = self.media.lock().await;
            acquirer.release().await;
        }
        self.emit(SessionEvent::LocalStreamChanged { attached: false });
        // clear identifiers last
        {
            let mut core = self.core.write().await;
            core.partner = None;
            core.partner_identity = None;
            core.room_id = None;
            core.call_id = None;
            core.role = None;
        }
        self.ice.discard_all();
        self.pending_matches.lock().clear();

        if let Some(room_id) = room {
            self.send_signal(SignalCommand::RoomLeave { room_id }).await;
        }
        self.send_signal(SignalCommand::PresenceUpdate {
            status: PresenceStatus::Available,
        })
        .await;
        tracing::info!("session torn down");
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn install_callbacks(&self, link: &PeerLink, partner: TransportId, epoch: u64) {
        let connection = link.connection();
        let weak = self.self_weak.clone();

        connection.set_transport_state_callback(Some(Box::new({
            let weak = weak.clone();
            move |state| {
                if let Some(session) = weak.upgrade() {
                    tokio::spawn(async move {
                        session.on_transport_state(state, epoch).await;
                    });
                }
            }
        })));

        connection.set_local_candidate_callback(Some(Box::new({
            let weak = weak.clone();
            move |candidate| {
                if let Some(session) = weak.upgrade() {
                    let target = partner.clone();
                    tokio::spawn(async move {
                        session
                            .send_signal(SignalCommand::IceCandidate { target, candidate })
                            .await;
                    });
                }
            }
        })));

        connection.set_remote_track_callback(Some(Box::new(move |track| {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move {
                    session.on_remote_track(track, epoch).await;
                });
            }
        })));
    }

    fn start_meter(&self) {
        let weak = self.self_weak.clone();
        let mut guard = self.meter.lock();
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(METER_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                if !session.is_active() {
                    break;
                }
                let level = {
                    let acquirer = session.media.lock().await;
                    acquirer.current().map_or(0.0, |media| media.audio_level())
                };
                session.emit(SessionEvent::MicLevelChanged { level });
            }
        }));
    }

    fn stop_meter(&self) {
        if let Some(handle) = self.meter.lock().take() {
            handle.abort();
        }
    }

    async fn is_our_call(&self, call_id: &CallId) -> bool {
        self.core.read().await.call_id.as_ref() == Some(call_id)
    }

    /// Re-validation guard invoked after every suspension point
    async fn still_current(&self, epoch: u64, partner: &TransportId) -> bool {
        if !self.is_active() || self.current_epoch() != epoch {
            return false;
        }
        let core = self.core.read().await;
        core.partner.as_ref() == Some(partner)
    }

    /// Advance the state machine, logging the transition
    fn transition(core: &mut SessionCore<I>, to: SessionState) {
        let from = core.state;
        if from == to {
            return;
        }
        debug_assert!(
            SessionState::can_transition(from, to),
            "invalid session transition {from:?} -> {to:?}"
        );
        core.state = to;
        tracing::debug!(old_state = ?from, new_state = ?to, "session state transition");
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn send_signal(&self, command: SignalCommand) {
        if let Err(e) = self.signaling.send(command).await {
            tracing::warn!(error = %e, "signaling send failed");
        }
    }
}

/// Builder for wiring a session to its collaborators
pub struct CallSessionBuilder<I: PeerIdentity, T: SignalingTransport> {
    config: SessionConfig<I>,
    transport: Arc<T>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<AsyncMutex<MediaAcquirer>>,
}

impl<I: PeerIdentity, T: SignalingTransport> CallSessionBuilder<I, T> {
    /// Start a builder from the mandatory collaborators
    #[must_use]
    pub fn new(
        config: SessionConfig<I>,
        transport: Arc<T>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<AsyncMutex<MediaAcquirer>>,
    ) -> Self {
        Self {
            config,
            transport,
            connector,
            media,
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig<I>) -> Self {
        self.config = config;
        self
    }

    /// Build the session
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is inconsistent
    pub fn build(self) -> Result<Arc<CallSession<I, T>>, SessionError> {
        CallSession::new(self.config, self.transport, self.connector, self.media)
    }
}
