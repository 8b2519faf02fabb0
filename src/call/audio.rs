//! Audio capture and playback using cpal.
//!
//! Opens the default input/output devices at 48000 Hz mono i16. If the device
//! doesn't support 48 kHz, captures/plays at the device's native rate and
//! resamples with simple linear interpolation.
//!
//! Gated behind `#[cfg(feature = "audio")]` — without the feature,
//! [`super::media::NullMediaRuntime`] stands in and every acquisition fails
//! classified.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};

use super::media::{
    AudioConstraints, FrameSource, LocalStream, MediaConstraints, MediaError, MediaErrorKind,
    MediaRuntime, MediaTrack, TrackKind,
};

/// Number of PCM samples per 20ms frame at 48000 Hz.
const FRAME_SAMPLES: usize = 960;

/// Capture/playback target rate.
const TARGET_RATE: u32 = 48_000;

/// How long to wait for the capture thread to report readiness.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Resampling helper
// ---------------------------------------------------------------------------

/// Resample from `src_rate` to `dst_rate` using linear interpolation.
pub fn resample(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    if out_len == 0 {
        return vec![];
    }
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let s0 = samples[idx.min(samples.len() - 1)] as f64;
        let s1 = samples[(idx + 1).min(samples.len() - 1)] as f64;
        let val = s0 + frac * (s1 - s0);
        out.push(val.round() as i16);
    }
    out
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map a backend error message onto the closed error taxonomy. ALSA and
/// PulseAudio report permission and busy conditions only through message
/// text.
fn classify_backend_message(message: &str) -> MediaErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        MediaErrorKind::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        MediaErrorKind::DeviceBusy
    } else if lower.contains("not found") || lower.contains("no such") {
        MediaErrorKind::DeviceNotFound
    } else {
        MediaErrorKind::Unknown
    }
}

fn classify_build_error(e: &cpal::BuildStreamError) -> MediaError {
    let kind = match e {
        cpal::BuildStreamError::DeviceNotAvailable => MediaErrorKind::DeviceNotFound,
        cpal::BuildStreamError::StreamConfigNotSupported => MediaErrorKind::Unknown,
        cpal::BuildStreamError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
        _ => MediaErrorKind::Unknown,
    };
    MediaError::new(kind, format!("input stream: {e}"))
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Open the default input device and start delivering 960-sample (20ms at
/// 48 kHz) frames through the returned track.
///
/// The cpal stream lives on a dedicated OS thread, kept alive by the track's
/// keep-alive sender; stopping the track releases the device.
pub fn start_capture(constraints: &AudioConstraints) -> Result<std::sync::Arc<MediaTrack>, MediaError> {
    // Echo cancellation / noise suppression / AGC are requested from the
    // platform driver; capture proceeds raw when it cannot honor them.
    tracing::debug!(
        "Opening mic (aec={}, ns={}, agc={})",
        constraints.echo_cancellation,
        constraints.noise_suppression,
        constraints.auto_gain_control
    );

    let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<i16>>(50);
    // Dropping this sender ends the stream-owning thread.
    let (keep_tx, keep_rx) = mpsc::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel::<Result<String, MediaError>>();

    thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err(MediaError::device_not_found(
                    "no audio input device",
                )));
                return;
            }
        };

        let dev_name = device.name().unwrap_or_else(|_| "unknown".into());

        let (config, device_rate) = match pick_config(&device, true) {
            Some(c) => c,
            None => {
                let _ = ready_tx.send(Err(MediaError::unknown(format!(
                    "no usable input config for {dev_name}"
                ))));
                return;
            }
        };

        let frame_device_samples = (device_rate as usize * 20) / 1000;
        let need_resample = device_rate != TARGET_RATE;

        let mut acc: Vec<i16> = Vec::with_capacity(frame_device_samples * 2);
        let stream = match device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                acc.extend_from_slice(data);
                while acc.len() >= frame_device_samples {
                    let chunk: Vec<i16> = acc.drain(..frame_device_samples).collect();
                    let frame = if need_resample {
                        resample(&chunk, device_rate, TARGET_RATE)
                    } else {
                        chunk
                    };
                    let _ = frame_tx.try_send(frame);
                }
            },
            move |err| {
                tracing::warn!("Audio input stream error: {}", err);
            },
            None,
        ) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(classify_build_error(&e)));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let kind = match &e {
                cpal::PlayStreamError::DeviceNotAvailable => MediaErrorKind::DeviceNotFound,
                cpal::PlayStreamError::BackendSpecific { err } => {
                    classify_backend_message(&err.description)
                }
            };
            let _ = ready_tx.send(Err(MediaError::new(kind, format!("mic start: {e}"))));
            return;
        }

        let _ = ready_tx.send(Ok(dev_name));
        // Park this thread; the stream stays alive until keep_rx is dropped.
        let _ = keep_rx.recv();
        drop(stream);
    });

    let dev_name = match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
        Ok(Ok(name)) => name,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MediaError::unknown("mic did not start in time")),
    };

    tracing::info!("Audio capture started on {} ({}Hz target)", dev_name, TARGET_RATE);
    Ok(MediaTrack::new(
        TrackKind::Audio,
        dev_name,
        Some(FrameSource::Audio(frame_rx)),
        Some(keep_tx),
    ))
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Plays remote audio on the default output device. Accepts 960-sample
/// (20ms at 48 kHz) frames via the returned channel.
pub struct AudioPlayback {
    _keep_alive: mpsc::Sender<()>,
}

impl AudioPlayback {
    /// Try to open the default output device. Returns `None` (with a warning
    /// log) if no device is available — a call without a speaker still works.
    pub fn start() -> Option<(Self, mpsc::SyncSender<Vec<i16>>)> {
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<i16>>(50);
        let (keep_tx, keep_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<bool>();

        thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_output_device() {
                Some(d) => d,
                None => {
                    tracing::warn!("No audio output device — playback disabled");
                    let _ = ready_tx.send(false);
                    return;
                }
            };

            let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
            let (config, device_rate) = match pick_config(&device, false) {
                Some(c) => c,
                None => {
                    tracing::warn!("No usable output config for {}", dev_name);
                    let _ = ready_tx.send(false);
                    return;
                }
            };
            let need_resample = device_rate != TARGET_RATE;

            // Ring buffer fed by a feeder thread, drained by the callback.
            let ring = std::sync::Arc::new(std::sync::Mutex::new(
                std::collections::VecDeque::<i16>::with_capacity(
                    (device_rate as usize / 1000) * 200,
                ),
            ));
            let ring2 = ring.clone();

            thread::spawn(move || {
                while let Ok(frame) = frame_rx.recv() {
                    let samples = if need_resample {
                        resample(&frame, TARGET_RATE, device_rate)
                    } else {
                        frame
                    };
                    let mut r = ring2.lock().unwrap();
                    r.extend(samples.iter());
                }
            });

            let stream = match device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut r = ring.lock().unwrap();
                    for sample in data.iter_mut() {
                        *sample = r.pop_front().unwrap_or(0);
                    }
                },
                move |err| {
                    tracing::warn!("Audio output stream error: {}", err);
                },
                None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to build output stream: {}", e);
                    let _ = ready_tx.send(false);
                    return;
                }
            };

            if let Err(e) = stream.play() {
                tracing::warn!("Failed to start output stream: {}", e);
                let _ = ready_tx.send(false);
                return;
            }

            tracing::info!("Audio playback started on {} ({}Hz)", dev_name, device_rate);
            let _ = ready_tx.send(true);
            let _ = keep_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(true) => Some((
                AudioPlayback {
                    _keep_alive: keep_tx,
                },
                frame_tx,
            )),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Device runtime
// ---------------------------------------------------------------------------

/// [`MediaRuntime`] backed by the machine's real capture devices.
pub struct DeviceMediaRuntime;

#[async_trait]
impl MediaRuntime for DeviceMediaRuntime {
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalStream, MediaError> {
        // Device probing blocks; keep it off the async threads.
        let audio_constraints = constraints.audio.clone();
        let mic = tokio::task::spawn_blocking(move || start_capture(&audio_constraints))
            .await
            .map_err(|e| MediaError::unknown(format!("capture task panicked: {e}")))??;

        let mut tracks = vec![mic];

        if constraints.video.is_some() {
            #[cfg(feature = "video-capture")]
            {
                let video_constraints = constraints.video.clone().expect("checked above");
                let camera = tokio::task::spawn_blocking(move || {
                    super::camera::start_capture(&video_constraints)
                })
                .await
                .map_err(|e| MediaError::unknown(format!("capture task panicked: {e}")));
                match camera {
                    Ok(Ok(track)) => tracks.push(track),
                    Ok(Err(e)) | Err(e) => {
                        // Release the mic before surfacing the camera failure.
                        for t in &tracks {
                            t.stop();
                        }
                        return Err(e);
                    }
                }
            }
            #[cfg(not(feature = "video-capture"))]
            {
                for t in &tracks {
                    t.stop();
                }
                return Err(MediaError::device_not_found(
                    "built without camera support (video-capture feature)",
                ));
            }
        }

        Ok(LocalStream::new(tracks))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pick a mono i16 stream config, preferring 48000 Hz but falling back to
/// the device's native rate.
fn pick_config(device: &Device, input: bool) -> Option<(StreamConfig, u32)> {
    // Collect into Vec since input/output iterators are different types.
    let configs: Vec<cpal::SupportedStreamConfigRange> = if input {
        device.supported_input_configs().ok()?.collect()
    } else {
        device.supported_output_configs().ok()?.collect()
    };

    for cfg in &configs {
        if cfg.sample_format() == SampleFormat::I16
            && cfg.channels() == 1
            && cfg.min_sample_rate() <= SampleRate(TARGET_RATE)
            && cfg.max_sample_rate() >= SampleRate(TARGET_RATE)
        {
            let sc = cfg.clone().with_sample_rate(SampleRate(TARGET_RATE));
            return Some((sc.into(), TARGET_RATE));
        }
    }

    // Second pass: any i16 config; we'll resample from its best rate.
    for cfg in &configs {
        if cfg.sample_format() == SampleFormat::I16 {
            let rate = if cfg.min_sample_rate() <= SampleRate(44100)
                && cfg.max_sample_rate() >= SampleRate(44100)
            {
                44100
            } else {
                cfg.max_sample_rate().0
            };
            let mut sc: StreamConfig = cfg.clone().with_sample_rate(SampleRate(rate)).into();
            sc.channels = 1;
            return Some((sc, rate));
        }
    }

    // Third pass: any format, force mono i16 and hope for the best.
    if let Some(cfg) = configs.first() {
        let rate = cfg.max_sample_rate().0.clamp(8000, 48000);
        let sc = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };
        return Some((sc, rate));
    }

    None
}

// ---------------------------------------------------------------------------
// mic_test — capture 3 seconds, then play back
// ---------------------------------------------------------------------------

/// Capture 3 seconds of microphone audio, then play it back through the
/// speaker. Prints a VU meter bar every 100ms during capture.
pub fn mic_test() -> anyhow::Result<()> {
    use anyhow::bail;

    println!("=== Microphone Test ===");
    println!("Recording for 3 seconds — speak now!\n");

    let track = match start_capture(&MediaConstraints::for_call(super::CallType::Audio).audio) {
        Ok(t) => t,
        Err(e) => bail!("{} ({})", e, e.user_hint()),
    };
    let Some(FrameSource::Audio(mic_rx)) = track.take_source() else {
        bail!("mic track has no frame source");
    };

    let mut frames: Vec<Vec<i16>> = Vec::with_capacity(150);
    let start = std::time::Instant::now();
    let mut last_vu = start;

    while start.elapsed() < Duration::from_secs(3) {
        match mic_rx.recv_timeout(Duration::from_millis(25)) {
            Ok(frame) => {
                if last_vu.elapsed() >= Duration::from_millis(100) {
                    let rms = rms_level(&frame);
                    let db = if rms > 0.0 { 20.0 * rms.log10() } else { -60.0 };
                    let bar_len = ((db + 60.0) / 60.0 * 30.0).clamp(0.0, 30.0) as usize;
                    let bar: String = "█".repeat(bar_len) + &"░".repeat(30 - bar_len);
                    print!("\r  [{bar}] {db:5.1} dBFS ");
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                    last_vu = std::time::Instant::now();
                }
                frames.push(frame);
            }
            Err(_) => continue,
        }
    }
    track.stop();
    println!(
        "\n\nCaptured {} frames ({:.1}s)",
        frames.len(),
        frames.len() as f64 * 0.02
    );

    println!("Playing back...\n");
    let (playback, speaker_tx) = match AudioPlayback::start() {
        Some(p) => p,
        None => bail!("No audio output device found"),
    };

    for frame in &frames {
        let _ = speaker_tx.send(frame.clone());
        thread::sleep(Duration::from_millis(20));
    }
    // Drain: let playback finish.
    thread::sleep(Duration::from_millis(200));
    drop(playback);

    println!("Done.");
    Ok(())
}

/// Compute RMS level of a frame, normalized to 0.0–1.0 range.
fn rms_level(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() / 32768.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let input: Vec<i16> = (0..FRAME_SAMPLES as i16).collect();
        let out = resample(&input, TARGET_RATE, TARGET_RATE);
        assert_eq!(out, input);
    }

    #[test]
    fn test_resample_upsample_6x() {
        // 8000 -> 48000 = 6x
        let input: Vec<i16> = vec![0, 1000, 2000, 0];
        let out = resample(&input, 8000, 48000);
        assert_eq!(out.len(), 24);
        assert_eq!(out[0], 0);
        // Midpoint-ish samples should interpolate.
        assert!(out[3] > 0 && out[3] < 1000);
    }

    #[test]
    fn test_resample_downsample_6x() {
        let input: Vec<i16> = (0..48).map(|i| (i * 100) as i16).collect();
        let out = resample(&input, 48000, 8000);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_resample_empty() {
        let out = resample(&[], 48000, 8000);
        assert!(out.is_empty());
    }

    #[test]
    fn backend_messages_classify() {
        assert_eq!(
            classify_backend_message("ALSA: Permission denied"),
            MediaErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_backend_message("Device or resource busy"),
            MediaErrorKind::DeviceBusy
        );
        assert_eq!(
            classify_backend_message("No such device"),
            MediaErrorKind::DeviceNotFound
        );
        assert_eq!(
            classify_backend_message("something exploded"),
            MediaErrorKind::Unknown
        );
    }

    #[test]
    fn capture_errors_are_classified_on_headless() {
        // On CI/headless this returns a classified error; with a real mic it
        // returns a live track. Either way, never a panic.
        let constraints = MediaConstraints::for_call(crate::call::CallType::Audio).audio;
        match start_capture(&constraints) {
            Ok(track) => track.stop(),
            Err(e) => {
                assert!(matches!(
                    e.kind,
                    MediaErrorKind::DeviceNotFound
                        | MediaErrorKind::DeviceBusy
                        | MediaErrorKind::PermissionDenied
                        | MediaErrorKind::Unknown
                ));
            }
        }
    }
}
