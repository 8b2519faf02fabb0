//! Noise reduction for captured audio — gate threshold + high-pass filter.
//!
//! Runs as a post-processing stage over the raw capture: each audio track's
//! frame channel is rethreaded through a filter worker and replaced with the
//! processed output. The stage is strictly optional; callers fall back to the
//! raw stream when processing fails.

use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};

use super::media::{FrameSource, LocalStream, MediaTrack, TrackKind};

/// Tuning for the default gate + high-pass chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NoiseGateOptions {
    /// Frames whose RMS falls below this level (dBFS) are muted.
    pub gate_threshold_db: f32,
    /// One-pole high-pass cutoff, removes rumble below this frequency.
    pub high_pass_hz: f32,
    /// Sample rate of the frames being processed.
    pub sample_rate: u32,
}

impl Default for NoiseGateOptions {
    fn default() -> Self {
        Self {
            gate_threshold_db: -50.0,
            high_pass_hz: 120.0,
            sample_rate: 48_000,
        }
    }
}

/// Returned when processing cannot start; carries the untouched input stream
/// so the caller can fall back to it.
#[derive(Debug)]
pub struct ProcessingFailed {
    pub stream: LocalStream,
    pub source: anyhow::Error,
}

/// Audio post-processing collaborator. Implementations must either return a
/// fully processed replacement stream or hand the input back unmodified
/// inside [`ProcessingFailed`].
pub trait NoiseReducer: Send + Sync {
    fn process(&self, stream: LocalStream) -> Result<LocalStream, ProcessingFailed>;
}

/// Default reducer: per-frame RMS gate behind a one-pole high-pass filter.
pub struct NoiseGate {
    options: NoiseGateOptions,
}

impl NoiseGate {
    pub fn new(options: NoiseGateOptions) -> Self {
        Self { options }
    }
}

impl NoiseReducer for NoiseGate {
    fn process(&self, stream: LocalStream) -> Result<LocalStream, ProcessingFailed> {
        if !(self.options.gate_threshold_db.is_finite()
            && self.options.high_pass_hz.is_finite()
            && self.options.high_pass_hz >= 0.0
            && self.options.sample_rate > 0)
        {
            return Err(ProcessingFailed {
                stream,
                source: anyhow::anyhow!("invalid noise gate options: {:?}", self.options),
            });
        }

        // Validate before consuming anything: every audio track must still
        // own its frame source, otherwise the input is handed back intact.
        for track in stream.tracks() {
            if track.kind() == TrackKind::Audio && !track.has_source() {
                return Err(ProcessingFailed {
                    stream,
                    source: anyhow::anyhow!("audio track has no frame source to process"),
                });
            }
        }

        let mut tracks = Vec::with_capacity(stream.tracks().len());
        for track in stream.tracks() {
            if track.kind() != TrackKind::Audio {
                tracks.push(track.clone());
                continue;
            }

            // Move the capture internals into the processed track; the raw
            // handle is marked stopped so it cannot be read afterwards.
            let (source, keep_alive) = track.take_parts();
            let Some(FrameSource::Audio(raw_rx)) = source else {
                // Checked above; a non-audio source here is a backend bug.
                tracks.push(track.clone());
                continue;
            };

            let (tx, rx) = mpsc::sync_channel::<Vec<i16>>(50);
            let opts = self.options;
            thread::spawn(move || {
                let mut filter = HighPass::new(opts.high_pass_hz, opts.sample_rate);
                while let Ok(frame) = raw_rx.recv() {
                    let frame = apply_gate(filter.run(&frame), opts.gate_threshold_db);
                    match tx.try_send(frame) {
                        Ok(()) => {}
                        Err(mpsc::TrySendError::Full(_)) => {
                            // Receiver is behind — drop the frame, keep going.
                        }
                        Err(mpsc::TrySendError::Disconnected(_)) => break,
                    }
                }
            });

            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                format!("{} (gated)", track.label()),
                Some(FrameSource::Audio(rx)),
                keep_alive,
            ));
        }

        Ok(LocalStream::new(tracks))
    }
}

/// One-pole high-pass filter with state carried across frames.
struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, sample_rate: u32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz.max(1.0));
        let dt = 1.0 / sample_rate as f32;
        Self {
            alpha: rc / (rc + dt),
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn run(&mut self, frame: &[i16]) -> Vec<i16> {
        let mut out = Vec::with_capacity(frame.len());
        for &s in frame {
            let x = s as f32;
            let y = self.alpha * (self.prev_out + x - self.prev_in);
            self.prev_in = x;
            self.prev_out = y;
            out.push(y.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
        }
        out
    }
}

/// Mute the frame entirely when its RMS sits below the gate threshold.
fn apply_gate(frame: Vec<i16>, threshold_db: f32) -> Vec<i16> {
    if rms_dbfs(&frame) < threshold_db {
        vec![0; frame.len()]
    } else {
        frame
    }
}

fn rms_dbfs(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum_sq: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / frame.len() as f64).sqrt() / 32768.0;
    if rms > 0.0 {
        20.0 * (rms as f32).log10()
    } else {
        f32::NEG_INFINITY
    }
}
