//! V4L2 camera capture — reads YUYV frames from /dev/video0 and converts to
//! I420.
//!
//! The requested format is bounded by the call's video constraints (width,
//! height, fps ceilings); the driver may negotiate down. Runs a capture
//! thread that sends I420 frames over the track's frame channel.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::media::{
    FrameSource, MediaError, MediaErrorKind, MediaTrack, TrackKind, VideoConstraints, VideoFrame,
};

const DEVICE_PATH: &str = "/dev/video0";

/// How long to wait for the capture thread to report readiness.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);

fn classify_io_error(e: &std::io::Error) -> MediaErrorKind {
    match e.kind() {
        std::io::ErrorKind::NotFound => MediaErrorKind::DeviceNotFound,
        std::io::ErrorKind::PermissionDenied => MediaErrorKind::PermissionDenied,
        _ => {
            // EBUSY surfaces without a dedicated ErrorKind.
            if e.raw_os_error() == Some(16) || e.to_string().to_ascii_lowercase().contains("busy") {
                MediaErrorKind::DeviceBusy
            } else {
                MediaErrorKind::Unknown
            }
        }
    }
}

/// Open the camera and start capturing frames within the given ceilings.
pub fn start_capture(
    constraints: &VideoConstraints,
) -> Result<std::sync::Arc<MediaTrack>, MediaError> {
    let (frame_tx, frame_rx) = mpsc::sync_channel::<VideoFrame>(2); // small buffer, drop old frames
    let (keep_tx, keep_rx) = mpsc::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel::<Result<String, MediaError>>();

    let constraints = constraints.clone();
    thread::spawn(move || {
        let dev = match Device::with_path(DEVICE_PATH) {
            Ok(d) => d,
            Err(e) => {
                let _ = ready_tx.send(Err(MediaError::new(
                    classify_io_error(&e),
                    format!("open {DEVICE_PATH}: {e}"),
                )));
                return;
            }
        };

        let mut fmt = match dev.format() {
            Ok(f) => f,
            Err(e) => {
                let _ = ready_tx.send(Err(MediaError::new(
                    classify_io_error(&e),
                    format!("query camera format: {e}"),
                )));
                return;
            }
        };
        fmt.width = constraints.max_width;
        fmt.height = constraints.max_height;
        fmt.fourcc = FourCC::new(b"YUYV");

        let actual = match dev.set_format(&fmt) {
            Ok(f) => f,
            Err(e) => {
                let _ = ready_tx.send(Err(MediaError::new(
                    classify_io_error(&e),
                    format!("set camera format: {e}"),
                )));
                return;
            }
        };
        let (width, height, fourcc) = (actual.width, actual.height, actual.fourcc);
        tracing::info!(
            "Camera opened: {}x{} fourcc={} (ceiling {}x{} @ {}fps)",
            width,
            height,
            fourcc,
            constraints.max_width,
            constraints.max_height,
            constraints.max_fps,
        );

        // Bound the frame rate; drivers that can't honor it just run native.
        if let Ok(mut params) = dev.params() {
            params.interval = v4l::Fraction::new(1, constraints.max_fps);
            let _ = dev.set_params(&params);
        }

        let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, 4) {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(MediaError::new(
                    classify_io_error(&e),
                    format!("start mmap stream: {e}"),
                )));
                return;
            }
        };

        let _ = ready_tx.send(Ok(format!("camera {width}x{height}")));

        loop {
            // Track stopped (keep-alive dropped) — release the device.
            if let Err(mpsc::TryRecvError::Disconnected) = keep_rx.try_recv() {
                break;
            }

            let (buf, _meta) = match stream.next() {
                Ok(x) => x,
                Err(e) => {
                    tracing::warn!("Camera read failed: {}", e);
                    break;
                }
            };

            let data = if fourcc == FourCC::new(b"YUYV") {
                yuyv_to_i420(buf, width, height)
            } else {
                // Already planar (YU12 and friends) — pass through.
                buf.to_vec()
            };

            match frame_tx.try_send(VideoFrame {
                width,
                height,
                data,
            }) {
                Ok(()) => {}
                Err(mpsc::TrySendError::Full(_)) => {
                    // Receiver is behind — drop the frame, keep going.
                }
                Err(mpsc::TrySendError::Disconnected(_)) => break,
            }
        }
    });

    let label = match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
        Ok(Ok(label)) => label,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MediaError::unknown("camera did not start in time")),
    };

    Ok(MediaTrack::new(
        TrackKind::Video,
        label,
        Some(FrameSource::Video(frame_rx)),
        Some(keep_tx),
    ))
}

/// Convert YUYV (YUV 4:2:2 packed) to I420 (YUV 4:2:0 planar).
fn yuyv_to_i420(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut out = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for row in 0..h {
        for col in (0..w).step_by(2) {
            let yuyv_offset = (row * w + col) * 2;
            if yuyv_offset + 3 >= yuyv.len() {
                break;
            }
            let y0 = yuyv[yuyv_offset];
            let u = yuyv[yuyv_offset + 1];
            let y1 = yuyv[yuyv_offset + 2];
            let v = yuyv[yuyv_offset + 3];

            y_plane[row * w + col] = y0;
            y_plane[row * w + col + 1] = y1;

            // Subsample U/V by 2x2.
            if row % 2 == 0 {
                let uv_row = row / 2;
                let uv_col = col / 2;
                u_plane[uv_row * (w / 2) + uv_col] = u;
                v_plane[uv_row * (w / 2) + uv_col] = v;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_conversion_layout() {
        // 4x2 YUYV frame: per pixel pair [Y0 U Y1 V].
        let w = 4u32;
        let h = 2u32;
        let yuyv: Vec<u8> = vec![
            10, 100, 20, 200, 30, 101, 40, 201, // row 0
            50, 102, 60, 202, 70, 103, 80, 203, // row 1
        ];
        let out = yuyv_to_i420(&yuyv, w, h);
        assert_eq!(out.len(), (w * h + (w / 2) * (h / 2) * 2) as usize);

        // Y plane keeps every luma sample in order.
        assert_eq!(&out[..8], &[10, 20, 30, 40, 50, 60, 70, 80]);
        // U/V subsampled from even rows only.
        assert_eq!(&out[8..10], &[100, 101]);
        assert_eq!(&out[10..12], &[200, 201]);
    }

    #[test]
    fn io_errors_classify() {
        use std::io::{Error, ErrorKind};
        assert_eq!(
            classify_io_error(&Error::new(ErrorKind::NotFound, "x")),
            MediaErrorKind::DeviceNotFound
        );
        assert_eq!(
            classify_io_error(&Error::new(ErrorKind::PermissionDenied, "x")),
            MediaErrorKind::PermissionDenied
        );
        assert_eq!(
            classify_io_error(&Error::from_raw_os_error(16)),
            MediaErrorKind::DeviceBusy
        );
        assert_eq!(
            classify_io_error(&Error::new(ErrorKind::Other, "kaput")),
            MediaErrorKind::Unknown
        );
    }
}
