//! Media acquisition — local capture streams, constraints, and the
//! device-runtime boundary.
//!
//! The runtime behind [`MediaRuntime`] is cpal/V4L2 on a real machine and a
//! mock in tests. Whatever the backend throws is mapped to a closed
//! [`MediaErrorKind`] here; raw device errors never leave this module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use super::noise::NoiseReducer;
use super::CallType;

/// Ceiling for requested video width.
pub const MAX_VIDEO_WIDTH: u32 = 1280;
/// Ceiling for requested video height.
pub const MAX_VIDEO_HEIGHT: u32 = 720;
/// Ceiling for requested video frame rate.
pub const MAX_VIDEO_FPS: u32 = 30;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Closed classification of device-runtime failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    Unknown,
}

impl std::fmt::Display for MediaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaErrorKind::PermissionDenied => write!(f, "permission denied"),
            MediaErrorKind::DeviceNotFound => write!(f, "device not found"),
            MediaErrorKind::DeviceBusy => write!(f, "device busy"),
            MediaErrorKind::Unknown => write!(f, "unknown device error"),
        }
    }
}

/// A classified media-device failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::PermissionDenied, message)
    }

    pub fn device_not_found(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::DeviceNotFound, message)
    }

    pub fn device_busy(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::DeviceBusy, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(MediaErrorKind::Unknown, message)
    }

    /// Short instruction shown to the user when a call fails on this error.
    pub fn user_hint(&self) -> &'static str {
        match self.kind {
            MediaErrorKind::PermissionDenied => {
                "grant microphone/camera access to this user and try again"
            }
            MediaErrorKind::DeviceNotFound => "no capture device found — plug one in",
            MediaErrorKind::DeviceBusy => "the capture device is in use by another program",
            MediaErrorKind::Unknown => "the capture device failed — try again",
        }
    }
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Audio capture constraints. All three processing flags are requested for
/// every call; backends that cannot honor them capture raw.
#[derive(Debug, Clone)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Video capture constraints — ceilings, not exact targets.
#[derive(Debug, Clone)]
pub struct VideoConstraints {
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: u32,
}

/// What to request from the device runtime. Audio is always requested;
/// video only for video calls.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub audio: AudioConstraints,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            video: call_type.is_video().then_some(VideoConstraints {
                max_width: MAX_VIDEO_WIDTH,
                max_height: MAX_VIDEO_HEIGHT,
                max_fps: MAX_VIDEO_FPS,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracks and streams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured I420 video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Frames produced by a capture backend. Held by the track until the
/// transport takes it over.
pub enum FrameSource {
    /// 20ms PCM frames, mono i16.
    Audio(mpsc::Receiver<Vec<i16>>),
    Video(mpsc::Receiver<VideoFrame>),
}

/// One captured track. Capture backends keep their device thread alive
/// through the `keep_alive` sender; `stop()` drops it, which releases the
/// hardware without waiting for garbage collection of anything.
pub struct MediaTrack {
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source: Mutex<Option<FrameSource>>,
    keep_alive: Mutex<Option<mpsc::Sender<()>>>,
}

impl MediaTrack {
    pub fn new(
        kind: TrackKind,
        label: impl Into<String>,
        source: Option<FrameSource>,
        keep_alive: Option<mpsc::Sender<()>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            source: Mutex::new(source),
            keep_alive: Mutex::new(keep_alive),
        })
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn toggle_enabled(&self) {
        self.enabled.fetch_xor(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop capture and release the device. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.keep_alive.lock().unwrap().take();
        self.source.lock().unwrap().take();
    }

    /// Hand the frame receiver to the transport. Returns `None` if already
    /// taken or stopped.
    pub fn take_source(&self) -> Option<FrameSource> {
        self.source.lock().unwrap().take()
    }

    pub fn has_source(&self) -> bool {
        self.source.lock().unwrap().is_some()
    }

    /// Move this track's capture internals into a replacement track and mark
    /// it stopped. Used when a processing stage wraps the raw capture.
    pub(crate) fn take_parts(&self) -> (Option<FrameSource>, Option<mpsc::Sender<()>>) {
        let source = self.source.lock().unwrap().take();
        let keep_alive = self.keep_alive.lock().unwrap().take();
        self.stopped.store(true, Ordering::SeqCst);
        (source, keep_alive)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Locally captured stream. Clones share the underlying tracks; the session
/// controller is the sole owner for lifecycle purposes and stops every track
/// at teardown.
#[derive(Debug, Clone)]
pub struct LocalStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.tracks.iter().map(|t| t.kind()).collect()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Set or flip `enabled` on every track of `kind`. Returns false when no
    /// such track exists (audio-only call, camera toggle).
    pub fn set_enabled(&self, kind: TrackKind, enabled: Option<bool>) -> bool {
        let mut found = false;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            found = true;
            match enabled {
                Some(on) => track.set_enabled(on),
                None => track.toggle_enabled(),
            }
        }
        found
    }

    /// Stop every track. Idempotent.
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A frame delivered from the counterpart.
#[derive(Debug, Clone)]
pub enum RemoteFrame {
    Audio(Vec<i16>),
    Video(VideoFrame),
}

/// Stream received from the peer connection once negotiation completes.
/// Read-only from the session controller's perspective.
pub struct RemoteStream {
    id: String,
    kinds: Vec<TrackKind>,
    frames: Mutex<Option<tokio::sync::mpsc::Receiver<RemoteFrame>>>,
    stopped: AtomicBool,
}

impl RemoteStream {
    pub fn new(
        id: impl Into<String>,
        kinds: Vec<TrackKind>,
        frames: Option<tokio::sync::mpsc::Receiver<RemoteFrame>>,
    ) -> Self {
        Self {
            id: id.into(),
            kinds,
            frames: Mutex::new(frames),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kinds(&self) -> &[TrackKind] {
        &self.kinds
    }

    /// Hand the inbound frame channel to a playback task. `None` if already
    /// taken or the transport delivered no frames.
    pub fn take_frames(&self) -> Option<tokio::sync::mpsc::Receiver<RemoteFrame>> {
        self.frames.lock().unwrap().take()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Drop the inbound channel. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.frames.lock().unwrap().take();
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("kinds", &self.kinds)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime boundary
// ---------------------------------------------------------------------------

/// Device runtime: opens capture devices per the constraints. The returned
/// stream always carries an audio track, plus a video track when requested.
#[async_trait]
pub trait MediaRuntime: Send + Sync {
    async fn get_user_media(&self, constraints: &MediaConstraints)
        -> Result<LocalStream, MediaError>;
}

/// Acquire local media for a call, applying the optional noise-reduction
/// collaborator to the captured audio.
///
/// A failing reducer is not a failing call: the raw stream is used as-is and
/// the failure is only logged.
pub async fn acquire_media(
    runtime: &dyn MediaRuntime,
    reducer: Option<&dyn NoiseReducer>,
    call_type: CallType,
) -> Result<LocalStream, MediaError> {
    let constraints = MediaConstraints::for_call(call_type);
    let stream = runtime.get_user_media(&constraints).await?;

    let Some(reducer) = reducer else {
        return Ok(stream);
    };

    match reducer.process(stream) {
        Ok(processed) => Ok(processed),
        Err(failed) => {
            tracing::warn!(
                "Noise reduction failed, using raw capture: {:#}",
                failed.source
            );
            Ok(failed.stream)
        }
    }
}

/// Runtime used when the binary is built without any capture feature: every
/// request is a classified device-not-found.
pub struct NullMediaRuntime;

#[async_trait]
impl MediaRuntime for NullMediaRuntime {
    async fn get_user_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        Err(MediaError::device_not_found(
            "built without audio/video capture support",
        ))
    }
}
