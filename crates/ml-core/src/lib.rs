//! Detector abstraction used by the capture loop.
//!
//! The capture loop only sees the [`Detector`] trait. Two implementations
//! ship here: a scripted detector that replays detection counts (demo mode and
//! tests) and, behind the `with-tch` feature, a TorchScript YOLO detector.

#[cfg(feature = "with-tch")]
pub mod detector;
pub mod postprocess;
mod scripted;

use thiserror::Error;
use video_ingest::Frame;

pub use scripted::ScriptedDetector;

#[cfg(feature = "with-tch")]
pub use tch;

/// Single detection in pixel coordinates of the frame it was computed on.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[x, y, width, height]`, top-left origin.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class: String,
}

impl Detection {
    /// Area of the part of the box inside a `width` x `height` frame.
    pub fn visible_area(&self, width: f32, height: f32) -> f32 {
        let [x, y, w, h] = self.bbox;
        let visible_w = (x + w).min(width) - x.max(0.0);
        let visible_h = (y + h).min(height) - y.max(0.0);
        visible_w.max(0.0) * visible_h.max(0.0)
    }
}

/// Thresholds applied by the detector for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.45,
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid detector input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait Detector: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        params: DetectParams,
    ) -> Result<Vec<Detection>, DetectError>;

    /// Run one throwaway inference so the first real frame is not slowed by
    /// lazy initialisation.
    fn warm_up(&mut self, width: i32, height: i32) -> Result<(), DetectError> {
        self.detect(&Frame::blank(width, height), DetectParams::default())
            .map(|_| ())
    }

    fn describe(&self) -> String;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(
        &mut self,
        frame: &Frame,
        params: DetectParams,
    ) -> Result<Vec<Detection>, DetectError> {
        (**self).detect(frame, params)
    }

    fn warm_up(&mut self, width: i32, height: i32) -> Result<(), DetectError> {
        (**self).warm_up(width, height)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
