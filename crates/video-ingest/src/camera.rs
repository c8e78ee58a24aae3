//! OpenCV-backed camera capture.

use std::thread;

use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use opencv::{
    core::MatTraitConstManual,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    ChannelSource, parse_device_index,
    normalize::transform_to_target,
    types::{CaptureError, Frame, FrameFormat},
};

/// Spawns a background thread that continually captures frames from `uri`.
///
/// Frames are normalised to `target_size` before being forwarded. The channel
/// holds two frames so a slow consumer backpressures the capture thread.
pub fn spawn_camera_reader(
    uri: &str,
    target_size: (i32, i32),
) -> Result<ChannelSource, CaptureError> {
    let (tx, rx) = bounded(2);
    let cap = open_video_capture(uri)?;
    let label = format!("opencv:{uri}");

    thread::Builder::new()
        .name("opencv-capture".into())
        .spawn(move || {
            if let Err(err) = capture_loop(cap, target_size, tx.clone()) {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(ChannelSource::new(label, rx))
}

fn capture_loop(
    mut cap: VideoCapture,
    target_size: (i32, i32),
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    configure_camera(&mut cap, target_size, 30.0);
    let mut mat = Mat::default();

    loop {
        let grabbed = cap
            .read(&mut mat)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Err(CaptureError::Disconnected);
        }

        let size = mat.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 {
            continue;
        }

        let data = mat
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();
        let frame = Frame {
            data,
            width: size.width,
            height: size.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        };
        let frame = transform_to_target(frame, target_size.0, target_size.1)?;

        if tx.send(Ok(frame)).is_err() {
            break;
        }
    }

    Ok(())
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                Ok(_) => debug!("device #{index} did not open with backend {backend}"),
                Err(err) => warn!("failed to open device #{index} with backend {backend}: {err}"),
            }
        }
    }

    for backend in [videoio::CAP_FFMPEG, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
            Ok(_) => debug!("{uri} did not open with backend {backend}"),
            Err(err) => warn!("failed to open {uri} with backend {backend}: {err}"),
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Request the target resolution up front so normalisation is usually a no-op.
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        let _ = cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64);
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
