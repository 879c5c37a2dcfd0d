//! Shared mock collaborators for the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use paircall_core::link::{
    LinkError, LocalCandidateCallback, PeerConnectionApi, PeerConnector, RemoteTrackCallback,
    TrackSenderApi, TransportStateCallback,
};
use paircall_core::media::{
    MediaAcquirer, MediaDevices, MediaError, MediaTrackApi, StreamConstraints, TrackKind,
    TrackReadyState, VideoInputInfo,
};
use paircall_core::session::{CallSession, SessionConfig};
use paircall_core::signaling::{SignalCommand, SignalingTransport};
use paircall_core::types::{
    IceCandidate, NegotiationState, SdpKind, SessionDescription, TransportId, TransportState,
};
use paircall_core::PeerIdentityString;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MockSignalingError;

impl std::fmt::Display for MockSignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock signaling error")
    }
}

impl std::error::Error for MockSignalingError {}

/// Records every outbound command
#[derive(Default)]
pub struct MockSignaling {
    pub sent: Mutex<Vec<SignalCommand>>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<SignalCommand> {
        self.sent.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&SignalCommand) -> bool) -> usize {
        self.sent.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn find(&self, predicate: impl Fn(&SignalCommand) -> bool) -> Option<SignalCommand> {
        self.sent.lock().iter().find(|c| predicate(c)).cloned()
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    type Error = MockSignalingError;

    async fn send(&self, command: SignalCommand) -> Result<(), MockSignalingError> {
        self.sent.lock().push(command);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

pub struct MockTrack {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: AtomicBool,
    pub stopped: AtomicBool,
    pub stop_calls: AtomicUsize,
}

impl MockTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
        })
    }
}

impl MediaTrackApi for MockTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackReadyState {
        if self.stopped.load(Ordering::SeqCst) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn audio_level(&self) -> f32 {
        0.5
    }
}

/// Capture stack handing out fresh track pairs
#[derive(Default)]
pub struct MockDevices {
    pub fail_all: AtomicBool,
    pub requests: AtomicUsize,
    pub made_tracks: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let devices = Self::default();
        devices.fail_all.store(true, Ordering::SeqCst);
        Arc::new(devices)
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn request_stream(
        &self,
        _constraints: &StreamConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrackApi>>, MediaError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(MediaError::AttemptFailed("denied".to_string()));
        }
        let audio = MockTrack::new(&format!("audio-{n}"), TrackKind::Audio);
        let video = MockTrack::new(&format!("video-{n}"), TrackKind::Video);
        self.made_tracks.lock().push(audio.clone());
        self.made_tracks.lock().push(video.clone());
        Ok(vec![audio, video])
    }

    async fn enumerate_video_inputs(&self) -> Result<Vec<VideoInputInfo>, MediaError> {
        Ok(vec![VideoInputInfo {
            device_id: "mock-front".to_string(),
            label: "Front Camera".to_string(),
        }])
    }
}

// ---------------------------------------------------------------------------
// Connection engine
// ---------------------------------------------------------------------------

pub struct MockSender {
    pub replaced_with_null: AtomicBool,
}

#[async_trait]
impl TrackSenderApi for MockSender {
    async fn replace_track(
        &self,
        track: Option<Arc<dyn MediaTrackApi>>,
    ) -> Result<(), LinkError> {
        if track.is_none() {
            self.replaced_with_null.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Scripted peer connection following the offer/answer state machine
pub struct MockConnection {
    negotiation: Mutex<NegotiationState>,
    transport: Mutex<TransportState>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    /// (candidate, remote description present at application time)
    pub applied_candidates: Mutex<Vec<(IceCandidate, bool)>>,
    pub close_calls: AtomicUsize,
    pub offer_calls: AtomicUsize,
    pub restart_offer_calls: AtomicUsize,
    pub offer_delay: Mutex<Duration>,
    state_callback: Mutex<Option<TransportStateCallback>>,
    candidate_callback: Mutex<Option<LocalCandidateCallback>>,
    track_callback: Mutex<Option<RemoteTrackCallback>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            negotiation: Mutex::new(NegotiationState::Stable),
            transport: Mutex::new(TransportState::New),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            applied_candidates: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            offer_calls: AtomicUsize::new(0),
            restart_offer_calls: AtomicUsize::new(0),
            offer_delay: Mutex::new(Duration::ZERO),
            state_callback: Mutex::new(None),
            candidate_callback: Mutex::new(None),
            track_callback: Mutex::new(None),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.lock().is_some()
    }

    pub fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock() = delay;
    }

    /// Drive the transport state, invoking the installed callback
    pub fn fire_transport_state(&self, state: TransportState) {
        *self.transport.lock() = state;
        let callback = self.state_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(state);
        }
    }

    /// Surface a discovered local candidate
    pub fn fire_local_candidate(&self, candidate: IceCandidate) {
        let callback = self.candidate_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(candidate);
        }
    }

    /// Surface an inbound remote track
    pub fn fire_remote_track(&self, track: Arc<dyn MediaTrackApi>) {
        let callback = self.track_callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(track);
        }
    }
}

#[async_trait]
impl PeerConnectionApi for MockConnection {
    fn negotiation_state(&self) -> NegotiationState {
        *self.negotiation.lock()
    }

    fn transport_state(&self) -> TransportState {
        *self.transport.lock()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, LinkError> {
        let delay = *self.offer_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let n = self.offer_calls.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restart_offer_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!("v=0 mock-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        if self.remote_description.lock().is_none() {
            return Err(LinkError::Description(
                "no remote offer to answer".to_string(),
            ));
        }
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let mut negotiation = self.negotiation.lock();
        *negotiation = match (description.kind, *negotiation) {
            (SdpKind::Offer, NegotiationState::Stable) => NegotiationState::HaveLocalOffer,
            (SdpKind::Answer, NegotiationState::HaveRemoteOffer) => NegotiationState::Stable,
            (kind, state) => {
                return Err(LinkError::Description(format!(
                    "local {kind:?} invalid in {state:?}"
                )))
            }
        };
        *self.local_description.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        let mut negotiation = self.negotiation.lock();
        *negotiation = match (description.kind, *negotiation) {
            (SdpKind::Offer, NegotiationState::Stable) => NegotiationState::HaveRemoteOffer,
            (SdpKind::Answer, NegotiationState::HaveLocalOffer) => NegotiationState::Stable,
            (kind, state) => {
                return Err(LinkError::Description(format!(
                    "remote {kind:?} invalid in {state:?}"
                )))
            }
        };
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let remote_present = self.remote_description.lock().is_some();
        self.applied_candidates
            .lock()
            .push((candidate, remote_present));
        Ok(())
    }

    async fn add_track(
        &self,
        _track: Arc<dyn MediaTrackApi>,
    ) -> Result<Arc<dyn TrackSenderApi>, LinkError> {
        Ok(Arc::new(MockSender {
            replaced_with_null: AtomicBool::new(false),
        }))
    }

    fn set_transport_state_callback(&self, callback: Option<TransportStateCallback>) {
        *self.state_callback.lock() = callback;
    }

    fn set_local_candidate_callback(&self, callback: Option<LocalCandidateCallback>) {
        *self.candidate_callback.lock() = callback;
    }

    fn set_remote_track_callback(&self, callback: Option<RemoteTrackCallback>) {
        *self.track_callback.lock() = callback;
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        *self.transport.lock() = TransportState::Closed;
    }
}

/// Factory that records every connection it creates
#[derive(Default)]
pub struct MockConnector {
    pub created: Mutex<Vec<Arc<MockConnection>>>,
    pub offer_delay: Mutex<Duration>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Apply an offer-creation delay to every connection created from now on
    pub fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock() = delay;
    }

    pub fn live_count(&self) -> usize {
        self.created
            .lock()
            .iter()
            .filter(|connection| !connection.is_closed())
            .count()
    }

    pub fn latest(&self) -> Option<Arc<MockConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerConnectionApi>, LinkError> {
        let connection = MockConnection::new();
        connection.set_offer_delay(*self.offer_delay.lock());
        self.created.lock().push(connection.clone());
        Ok(connection)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub type TestSession = Arc<CallSession<PeerIdentityString, MockSignaling>>;

pub struct Harness {
    pub session: TestSession,
    pub signaling: Arc<MockSignaling>,
    pub connector: Arc<MockConnector>,
    pub devices: Arc<MockDevices>,
    pub media: Arc<AsyncMutex<MediaAcquirer>>,
}

impl Harness {
    pub fn with_config(
        config: SessionConfig<PeerIdentityString>,
        devices: Arc<MockDevices>,
    ) -> Self {
        init_tracing();
        let signaling = MockSignaling::new();
        let connector = MockConnector::new();
        let media = Arc::new(AsyncMutex::new(
            MediaAcquirer::new(devices.clone()).with_release_grace(Duration::from_millis(1)),
        ));
        let session = CallSession::new(
            config,
            signaling.clone(),
            connector.clone(),
            media.clone(),
        )
        .unwrap();
        Self {
            session,
            signaling,
            connector,
            devices,
            media,
        }
    }

    pub fn random(local_id: &str) -> Self {
        Self::with_config(
            SessionConfig::random(TransportId::new(local_id)),
            MockDevices::new(),
        )
    }

    /// Pull the first offer this endpoint sent, as the partner's inbound event
    pub fn sent_offer_for(&self, local_id: &str) -> Option<paircall_core::SignalEvent> {
        self.signaling.find(|command| matches!(command, SignalCommand::Offer { .. })).map(
            |command| match command {
                SignalCommand::Offer {
                    description,
                    source_identity,
                    ..
                } => paircall_core::SignalEvent::Offer {
                    from: TransportId::new(local_id),
                    description,
                    source_identity,
                },
                _ => unreachable!(),
            },
        )
    }

    /// Pull the first answer this endpoint sent, as the partner's inbound event
    pub fn sent_answer_for(&self, local_id: &str) -> Option<paircall_core::SignalEvent> {
        self.signaling
            .find(|command| matches!(command, SignalCommand::Answer { .. }))
            .map(|command| match command {
                SignalCommand::Answer { description, .. } => paircall_core::SignalEvent::Answer {
                    from: TransportId::new(local_id),
                    description,
                },
                _ => unreachable!(),
            })
    }
}

/// Give spawned callback tasks a chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!("candidate:{n} 1 UDP 2122 192.0.2.1 4242 typ host"))
}
