//! Failure taxonomy of the bridge.
//!
//! Only [`BridgeError::CaptureFatal`] ends a capture loop run. Every other
//! variant is logged, counted under `vision_errors_total{kind}` and absorbed by
//! the stage that raised it.

use ml_core::DetectError;
use thiserror::Error;
use video_ingest::CaptureError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("capture failed: {0}")]
    CaptureFatal(#[from] CaptureError),
    #[error("detection failed for frame {sequence}: {source}")]
    DetectionTransient {
        sequence: u64,
        #[source]
        source: DetectError,
    },
    #[error("encoding frame {sequence} failed: {source}")]
    EncodeTransient {
        sequence: u64,
        #[source]
        source: EncodeError,
    },
    #[error("subscriber {subscriber} failed on event {sequence}: {message}")]
    SubscriberDeliveryFailure {
        subscriber: String,
        sequence: u64,
        message: String,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a frame could not be turned into a JPEG part.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("malformed {width}x{height} frame with {len} bytes")]
    Malformed { width: i32, height: i32, len: usize },
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
    #[error("encode task failed: {0}")]
    Task(#[from] actix_web::rt::task::JoinError),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::CaptureFatal(_) => "capture_fatal",
            BridgeError::DetectionTransient { .. } => "detection_transient",
            BridgeError::EncodeTransient { .. } => "encode_transient",
            BridgeError::SubscriberDeliveryFailure { .. } => "subscriber_delivery",
            BridgeError::InvalidConfig(_) => "invalid_config",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::CaptureFatal(_))
    }

    pub(crate) fn record(&self) {
        metrics::counter!("vision_errors_total", "kind" => self.kind()).increment(1);
    }
}
