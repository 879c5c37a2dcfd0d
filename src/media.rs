//! Local media acquisition and the capture-device seam.
//!
//! The platform capture stack is an external collaborator behind
//! [`MediaDevices`]; the acquirer layers the constraint fallback chain,
//! capture reuse across consecutive matches, and the careful release
//! sequence on top of it.
//!
//! Mute/camera-off state is layered above acquisition: tracks come back
//! with `enabled = true` and the application toggles them afterwards, so
//! presenting or hiding media never re-acquires the device.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Media acquisition and release errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// A single constraint attempt failed
    #[error("capture attempt failed: {0}")]
    AttemptFailed(String),

    /// Every attempt in the fallback chain failed
    #[error("no capture configuration produced a live video track")]
    CaptureExhausted,

    /// Device enumeration failed
    #[error("device enumeration failed: {0}")]
    Enumeration(String),
}

/// Which camera the user prefers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    /// Front/self-view camera
    User,
    /// Rear/world-facing camera
    Environment,
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    /// Audio capture
    Audio,
    /// Video capture
    Video,
}

/// Liveness of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReadyState {
    /// Producing frames/samples
    Live,
    /// Stopped, will never produce again
    Ended,
}

/// Video-input selection passed to the capture stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSelector {
    /// Any available camera
    Any,
    /// Constrain by facing mode
    Facing(FacingMode),
    /// Constrain to an explicit device
    DeviceId(String),
}

/// Constraints for a single capture request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConstraints {
    /// Request an audio track
    pub audio: bool,
    /// Video selection
    pub video: VideoSelector,
}

/// A video input reported by device enumeration
#[derive(Debug, Clone)]
pub struct VideoInputInfo {
    /// Platform device id
    pub device_id: String,
    /// Human-readable label
    pub label: String,
}

/// A single captured track, owned by the platform capture stack
pub trait MediaTrackApi: Send + Sync {
    /// Track identifier
    fn id(&self) -> String;

    /// Audio or video
    fn kind(&self) -> TrackKind;

    /// Whether the track is currently presented
    fn enabled(&self) -> bool;

    /// Toggle presentation without touching the device
    fn set_enabled(&self, enabled: bool);

    /// Live or ended
    fn ready_state(&self) -> TrackReadyState;

    /// Stop the track, releasing its slice of the device
    fn stop(&self);

    /// Instantaneous input level, meaningful for audio tracks
    fn audio_level(&self) -> f32 {
        0.0
    }
}

/// Platform capture seam
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Request a capture matching the constraints
    ///
    /// # Errors
    ///
    /// Returns error if the platform denies or cannot satisfy the request
    async fn request_stream(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrackApi>>, MediaError>;

    /// Enumerate available video inputs
    ///
    /// # Errors
    ///
    /// Returns error if enumeration is not possible
    async fn enumerate_video_inputs(&self) -> Result<Vec<VideoInputInfo>, MediaError>;
}

/// One local capture: the set of tracks from a successful acquisition
pub struct LocalMedia {
    tracks: Vec<Arc<dyn MediaTrackApi>>,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

impl LocalMedia {
    /// Wrap the tracks of an acquisition
    #[must_use]
    pub fn new(tracks: Vec<Arc<dyn MediaTrackApi>>) -> Self {
        Self { tracks }
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[Arc<dyn MediaTrackApi>] {
        &self.tracks
    }

    /// Audio tracks only
    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrackApi>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    /// Video tracks only
    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrackApi>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    /// Whether any video track is still live
    #[must_use]
    pub fn has_live_video(&self) -> bool {
        self.video_tracks()
            .any(|t| t.ready_state() == TrackReadyState::Live)
    }

    /// Whether every track is still live
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.tracks.is_empty()
            && self
                .tracks
                .iter()
                .all(|t| t.ready_state() == TrackReadyState::Live)
    }

    /// Toggle all audio tracks
    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Toggle all video tracks
    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.video_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Current input level of the first audio track
    #[must_use]
    pub fn audio_level(&self) -> f32 {
        self.audio_tracks()
            .next()
            .map_or(0.0, |t| t.audio_level())
    }
}

/// Grace period after stopping tracks before the device counts as free.
/// Recreating a capture immediately after release on some platforms
/// silently reuses a half-released device.
const RELEASE_GRACE: Duration = Duration::from_millis(250);

/// Exclusive owner of the local capture.
///
/// Holds at most one [`LocalMedia`] at a time. The capture is created on
/// first need, reused across consecutive matches while it stays live,
/// and released only on explicit stop.
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
    current: Option<Arc<LocalMedia>>,
    release_grace: Duration,
}

impl MediaAcquirer {
    /// Create an acquirer over a capture stack
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            current: None,
            release_grace: RELEASE_GRACE,
        }
    }

    /// Override the release grace period (tests)
    #[must_use]
    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    /// The capture currently held, if any
    #[must_use]
    pub fn current(&self) -> Option<Arc<LocalMedia>> {
        self.current.clone()
    }

    /// Acquire a capture, reusing the held one while it remains live.
    ///
    /// Tries, in order: a generic audio+video request, audio plus
    /// facing-constrained video, and audio plus an explicit device id
    /// found by matching the requested facing against device labels.
    /// The first attempt producing a live video track wins.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::CaptureExhausted`] when all three attempts
    /// fail; fatal for the current call attempt.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&mut self, preferred: FacingMode) -> Result<Arc<LocalMedia>, MediaError> {
        if let Some(current) = &self.current {
            if current.is_live() {
                tracing::debug!("reusing live local capture");
                return Ok(Arc::clone(current));
            }
            tracing::debug!("held capture no longer live, re-acquiring");
            self.current = None;
        }

        let mut attempts = vec![
            StreamConstraints {
                audio: true,
                video: VideoSelector::Any,
            },
            StreamConstraints {
                audio: true,
                video: VideoSelector::Facing(preferred),
            },
        ];
        if let Some(device_id) = self.find_device_by_label(preferred).await {
            attempts.push(StreamConstraints {
                audio: true,
                video: VideoSelector::DeviceId(device_id),
            });
        }

        for (index, constraints) in attempts.iter().enumerate() {
            match self.devices.request_stream(constraints).await {
                Ok(tracks) => {
                    let media = LocalMedia::new(tracks);
                    if media.has_live_video() {
                        tracing::info!(attempt = index + 1, "local capture acquired");
                        let media = Arc::new(media);
                        self.current = Some(Arc::clone(&media));
                        return Ok(media);
                    }
                    tracing::debug!(attempt = index + 1, "capture had no live video, discarding");
                    for track in media.tracks() {
                        track.set_enabled(false);
                        track.stop();
                    }
                }
                Err(e) => {
                    tracing::debug!(attempt = index + 1, error = %e, "capture attempt failed");
                }
            }
        }

        tracing::warn!("all capture attempts failed");
        Err(MediaError::CaptureExhausted)
    }

    /// Release the held capture.
    ///
    /// Each track is disabled before it is stopped; stop-before-disable
    /// can leave platform capture indicators lit on some devices. Waits
    /// the grace period before returning so a follow-up acquisition sees
    /// a fully released device.
    #[tracing::instrument(skip(self))]
    pub async fn release(&mut self) {
        let Some(media) = self.current.take() else {
            return;
        };
        tracing::info!("releasing local capture");
        for track in media.tracks() {
            track.set_enabled(false);
            track.stop();
        }
        tokio::time::sleep(self.release_grace).await;
    }

    async fn find_device_by_label(&self, preferred: FacingMode) -> Option<String> {
        match self.devices.enumerate_video_inputs().await {
            Ok(inputs) => inputs
                .into_iter()
                .find(|input| label_matches_facing(&input.label, preferred))
                .map(|input| input.device_id),
            Err(e) => {
                tracing::debug!(error = %e, "video input enumeration failed");
                None
            }
        }
    }
}

/// Label heuristic used when facing-mode constraints are not honored
fn label_matches_facing(label: &str, facing: FacingMode) -> bool {
    let label = label.to_lowercase();
    match facing {
        FacingMode::User => label.contains("front") || label.contains("user"),
        FacingMode::Environment => {
            label.contains("back") || label.contains("rear") || label.contains("environment")
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTrack {
        id: String,
        kind: TrackKind,
        enabled: AtomicBool,
        stopped: AtomicBool,
        disable_order: Mutex<Vec<&'static str>>,
    }

    impl FakeTrack {
        fn new(id: &str, kind: TrackKind) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                disable_order: Mutex::new(Vec::new()),
            })
        }
    }

    impl MediaTrackApi for FakeTrack {
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
            if !enabled {
                self.disable_order.lock().push("disable");
            }
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
            self.disable_order.lock().push("stop");
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct FakeDevices {
        fail_first_attempts: usize,
        requests: AtomicUsize,
        made: Mutex<Vec<Arc<FakeTrack>>>,
    }

    impl FakeDevices {
        fn failing(fail_first_attempts: usize) -> Self {
            Self {
                fail_first_attempts,
                requests: AtomicUsize::new(0),
                made: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaDevices for FakeDevices {
        async fn request_stream(
            &self,
            _constraints: &StreamConstraints,
        ) -> Result<Vec<Arc<dyn MediaTrackApi>>, MediaError> {
            let n = self.requests.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_attempts {
                return Err(MediaError::AttemptFailed("denied".to_string()));
            }
            let audio = FakeTrack::new("a0", TrackKind::Audio);
            let video = FakeTrack::new("v0", TrackKind::Video);
            self.made.lock().push(audio.clone());
            self.made.lock().push(video.clone());
            Ok(vec![audio, video])
        }

        async fn enumerate_video_inputs(&self) -> Result<Vec<VideoInputInfo>, MediaError> {
            Ok(vec![VideoInputInfo {
                device_id: "dev-front".to_string(),
                label: "Front Camera".to_string(),
            }])
        }
    }

    #[tokio::test]
    async fn first_attempt_wins() {
        let devices = Arc::new(FakeDevices::failing(0));
        let mut acquirer =
            MediaAcquirer::new(devices.clone()).with_release_grace(Duration::from_millis(1));
        let media = acquirer.acquire(FacingMode::User).await.unwrap();
        assert!(media.has_live_video());
        assert_eq!(devices.requests.load(Ordering::SeqCst), 1);
        // tracks come back enabled
        assert!(media.tracks().iter().all(|t| t.enabled()));
    }

    #[tokio::test]
    async fn fallback_chain_reaches_device_id_attempt() {
        let devices = Arc::new(FakeDevices::failing(2));
        let mut acquirer =
            MediaAcquirer::new(devices.clone()).with_release_grace(Duration::from_millis(1));
        let media = acquirer.acquire(FacingMode::User).await.unwrap();
        assert!(media.has_live_video());
        assert_eq!(devices.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_chain_is_fatal() {
        let devices = Arc::new(FakeDevices::failing(3));
        let mut acquirer =
            MediaAcquirer::new(devices.clone()).with_release_grace(Duration::from_millis(1));
        let err = acquirer.acquire(FacingMode::User).await.unwrap_err();
        assert!(matches!(err, MediaError::CaptureExhausted));
        assert!(acquirer.current().is_none());
    }

    #[tokio::test]
    async fn acquire_reuses_live_capture() {
        let devices = Arc::new(FakeDevices::failing(0));
        let mut acquirer =
            MediaAcquirer::new(devices.clone()).with_release_grace(Duration::from_millis(1));
        let first = acquirer.acquire(FacingMode::User).await.unwrap();
        let second = acquirer.acquire(FacingMode::User).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(devices.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_disables_before_stopping() {
        let devices = Arc::new(FakeDevices::failing(0));
        let mut acquirer =
            MediaAcquirer::new(devices.clone()).with_release_grace(Duration::from_millis(1));
        acquirer.acquire(FacingMode::User).await.unwrap();
        acquirer.release().await;

        for track in devices.made.lock().iter() {
            let order = track.disable_order.lock();
            assert_eq!(order.as_slice(), ["disable", "stop"]);
        }
        assert!(acquirer.current().is_none());
    }

    #[tokio::test]
    async fn release_without_capture_is_noop() {
        let devices = Arc::new(FakeDevices::failing(0));
        let mut acquirer = MediaAcquirer::new(devices).with_release_grace(Duration::from_millis(1));
        acquirer.release().await;
        assert!(acquirer.current().is_none());
    }

    #[test]
    fn label_heuristic() {
        assert!(label_matches_facing("Front Camera", FacingMode::User));
        assert!(label_matches_facing("USB rear cam", FacingMode::Environment));
        assert!(!label_matches_facing("Integrated Webcam", FacingMode::User));
    }
}
