//! Single-camera vehicle detection bridge.
//!
//! A capture loop publishes frames and detection events into single-slot
//! stores and an event bus; any number of HTTP clients read them at their own
//! pace through MJPEG streams and a polling JSON API.
//!
//! - `capture`: the producer loop (capture, detect, annotate, publish).
//! - `data`: single-slot stores and the shared event types.
//! - `bus`: drop-oldest fan-out of detection events.
//! - `encoding`: per-client JPEG multipart encoders.
//! - `server`: Actix Web endpoints.
//! - `pipeline`: configuration, health, telemetry and the restart supervisor.

pub mod alert;
pub mod annotation;
pub mod bridge;
pub mod bus;
pub mod capture;
pub mod data;
pub mod encoding;
pub mod error;
pub mod pipeline;
pub mod server;

pub use alert::{AlertLevel, AlertThresholds};
pub use bridge::Bridge;
pub use bus::{DetectionEventBus, SubscriptionHandle};
pub use capture::{CaptureLoop, CycleOutcome, LoopExit};
pub use data::{DetectionEvent, FrameStore, MetricsSnapshot, MetricsStore, PublishedFrame};
pub use error::{BridgeError, EncodeError};
/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub use pipeline::config::{LiveConfig, SourceKind, VisionCliArgs, VisionConfig};
/// Launch the bridge with a ready-made configuration.
pub use pipeline::run;
