//! Frame acquisition for the detection bridge.
//!
//! Every source hands out owned BGR8 [`Frame`]s through the [`FrameSource`]
//! trait. Threaded readers (ffmpeg, OpenCV) push into a small bounded channel
//! so a stalled consumer backpressures the decoder instead of buffering.

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod normalize;
mod synthetic;
mod types;

use crossbeam_channel::Receiver;

#[cfg(feature = "opencv")]
pub use camera::spawn_camera_reader;
pub use ffmpeg::{spawn_device_reader, spawn_rtsp_reader, spawn_udp_reader};
pub use normalize::transform_to_target;
pub use synthetic::SyntheticSource;
pub use types::{CaptureError, Frame, FrameFormat};

/// Pull-style access to a camera. `next_frame` may block until a frame is
/// available; any error is treated as fatal by the caller.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Human readable description used in logs.
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Adapts a reader thread's channel into a [`FrameSource`].
pub struct ChannelSource {
    label: String,
    rx: Receiver<Result<Frame, CaptureError>>,
}

impl ChannelSource {
    pub fn new(label: impl Into<String>, rx: Receiver<Result<Frame, CaptureError>>) -> Self {
        Self {
            label: label.into(),
            rx,
        }
    }
}

impl FrameSource for ChannelSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Disconnected),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Parse a `/dev/videoX` style URI (or a bare index) and return the index.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}
