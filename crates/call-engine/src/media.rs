//! Local and remote media handles.
//!
//! Tracks are cheap-to-clone handles. Stopping a track fires its `ended`
//! token, which is how an OS-level "stop sharing" reaches the engine.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Capture failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access to the device.
    #[error("Media access denied: {0}")]
    Denied(String),

    /// The device does not exist or is busy.
    #[error("Media unavailable: {0}")]
    Unavailable(String),
}

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl TrackKind {
    /// Label used for ids and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Screen => "screen",
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: CancellationToken,
}

/// Handle to a single captured media track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live, enabled track.
    #[must_use]
    pub fn new(kind: TrackKind) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let short = suffix.get(..8).unwrap_or("00000000");
        Self {
            inner: Arc::new(TrackInner {
                id: format!("{}-{short}", kind.as_str()),
                kind,
                enabled: AtomicBool::new(true),
                ended: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag (mute without releasing the device).
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the device. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.cancel();
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.inner.ended.is_cancelled()
    }

    /// Token cancelled when the track ends, whoever ended it.
    #[must_use]
    pub fn ended_token(&self) -> CancellationToken {
        self.inner.ended.clone()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// The local capture handed to every Connection.
#[derive(Debug, Clone)]
pub struct MediaBundle {
    pub audio: MediaTrack,
    pub video: MediaTrack,
}

impl MediaBundle {
    /// Stop every track in the bundle.
    pub fn stop(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

#[derive(Debug, Default)]
struct StreamTracks {
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
}

/// Live view of the tracks a remote peer is currently sending.
///
/// Reads always return the freshest track. A sender-side track replacement
/// changes what `video()` returns without any notification, which is why the
/// data link carries explicit `track-update` frames.
#[derive(Clone, Default)]
pub struct MediaStream {
    inner: Arc<RwLock<StreamTracks>>,
}

impl MediaStream {
    #[must_use]
    pub fn new(audio: Option<MediaTrack>, video: Option<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StreamTracks { audio, video })),
        }
    }

    #[must_use]
    pub fn audio(&self) -> Option<MediaTrack> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .audio
            .clone()
    }

    #[must_use]
    pub fn video(&self) -> Option<MediaTrack> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .video
            .clone()
    }

    /// Swap the video track seen by every holder of this stream.
    pub fn set_video(&self, track: Option<MediaTrack>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .video = track;
    }

    /// Whether two handles observe the same underlying stream.
    #[must_use]
    pub fn same_stream(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("audio", &self.audio().map(|t| t.id().to_string()))
            .field("video", &self.video().map(|t| t.id().to_string()))
            .finish()
    }
}

/// Capture devices available to a session.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture microphone and camera together.
    async fn capture_user_media(&self) -> Result<MediaBundle, MediaError>;

    /// Capture a fresh camera track (used when a screen share ends).
    async fn capture_camera(&self) -> Result<MediaTrack, MediaError>;

    /// Prompt for and capture a screen source.
    async fn capture_screen(&self) -> Result<MediaTrack, MediaError>;
}

/// Availability switch for one synthetic device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAvailability {
    #[default]
    Available,
    Denied,
    Missing,
}

impl DeviceAvailability {
    fn check(self, device: &str) -> Result<(), MediaError> {
        match self {
            DeviceAvailability::Available => Ok(()),
            DeviceAvailability::Denied => Err(MediaError::Denied(device.to_string())),
            DeviceAvailability::Missing => Err(MediaError::Unavailable(device.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    microphone: DeviceAvailability,
    camera: DeviceAvailability,
    screen: DeviceAvailability,
    issued: Vec<MediaTrack>,
}

/// Device set producing synthetic tracks.
///
/// Used by the loopback harness and by tests. Keeps every issued track so
/// callers can count how many are still live.
#[derive(Debug, Default)]
pub struct SyntheticDevices {
    state: Mutex<DeviceState>,
}

impl SyntheticDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_microphone(self, availability: DeviceAvailability) -> Self {
        self.lock().microphone = availability;
        self
    }

    #[must_use]
    pub fn with_camera(self, availability: DeviceAvailability) -> Self {
        self.lock().camera = availability;
        self
    }

    #[must_use]
    pub fn with_screen(self, availability: DeviceAvailability) -> Self {
        self.lock().screen = availability;
        self
    }

    /// Change screen availability at runtime.
    pub fn set_screen(&self, availability: DeviceAvailability) {
        self.lock().screen = availability;
    }

    /// Change camera availability at runtime.
    pub fn set_camera(&self, availability: DeviceAvailability) {
        self.lock().camera = availability;
    }

    /// Stop every live screen track, as the OS "stop sharing" control does.
    pub fn end_screen_capture(&self) {
        for track in self
            .lock()
            .issued
            .iter()
            .filter(|t| t.kind() == TrackKind::Screen)
        {
            track.stop();
        }
    }

    /// Number of issued tracks of `kind` that have not been stopped.
    #[must_use]
    pub fn live_tracks(&self, kind: TrackKind) -> usize {
        self.lock()
            .issued
            .iter()
            .filter(|t| t.kind() == kind && t.is_live())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn issue(&self, kind: TrackKind) -> MediaTrack {
        let track = MediaTrack::new(kind);
        self.lock().issued.push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn capture_user_media(&self) -> Result<MediaBundle, MediaError> {
        {
            let state = self.lock();
            state.microphone.check("microphone")?;
            state.camera.check("camera")?;
        }
        Ok(MediaBundle {
            audio: self.issue(TrackKind::Audio),
            video: self.issue(TrackKind::Video),
        })
    }

    async fn capture_camera(&self) -> Result<MediaTrack, MediaError> {
        self.lock().camera.check("camera")?;
        Ok(self.issue(TrackKind::Video))
    }

    async fn capture_screen(&self) -> Result<MediaTrack, MediaError> {
        self.lock().screen.check("screen")?;
        Ok(self.issue(TrackKind::Screen))
    }
}
