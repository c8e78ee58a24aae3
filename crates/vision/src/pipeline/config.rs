//! Configuration parsing for the detection bridge.
//!
//! CLI arguments are translated once into a validated [`VisionConfig`]. The
//! handful of values operators may tune while the service runs live in
//! [`LiveConfig`], which the capture loop copies out at the start of every
//! cycle.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{alert::AlertThresholds, error::BridgeError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Ingress transport used to source frames.
pub enum SourceKind {
    /// Local V4L devices, device indices or pre-recorded files.
    Device,
    /// Real-time streaming protocol feeds.
    Rtsp,
    /// UDP socket carrying H.264 via RTP.
    Udp,
    /// Generated test pattern, no camera required.
    Synthetic,
}

impl SourceKind {
    /// Infer the transport kind from a URI.
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.starts_with("udp://") {
            SourceKind::Udp
        } else if uri.eq_ignore_ascii_case("synthetic") {
            SourceKind::Synthetic
        } else {
            SourceKind::Device
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration shared by every component of the bridge.
pub struct VisionConfig {
    /// Camera URI or device identifier.
    pub camera_uri: String,
    pub source_kind: SourceKind,
    /// TorchScript model. Without one the scripted detector replays
    /// `demo_counts`.
    pub model_path: Option<PathBuf>,
    pub demo_counts: Vec<usize>,
    /// Target width every frame is normalised to.
    pub width: i32,
    /// Target height every frame is normalised to.
    pub height: i32,
    pub confidence: f32,
    pub iou_threshold: f32,
    /// Box area fraction above which the overlay flags an area alert.
    pub area_threshold: f32,
    pub alert: AlertThresholds,
    pub bind: SocketAddr,
    /// Pause after each part on the annotated stream.
    pub stream_interval: Duration,
    /// Pause after each part on the raw stream.
    pub raw_interval: Duration,
    pub jpeg_quality: u8,
    /// Per-subscriber queue depth on the event bus.
    pub bus_capacity: usize,
    /// Capture loop restarts allowed after fatal errors; `None` is unlimited.
    pub max_restarts: Option<u32>,
    /// Emit per-cycle debug logging.
    pub verbose: bool,
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the bridge.
#[derive(Debug, Default, Args)]
pub struct VisionCliArgs {
    /// Camera URI or device identifier.
    #[arg(value_name = "CAMERA_URI")]
    pub camera_uri: Option<String>,

    /// Camera URI flag (overrides positional): index, /dev/videoN, rtsp://, udp:// or `synthetic`.
    #[arg(long = "source", value_name = "URI")]
    pub source_uri: Option<String>,
    /// TorchScript model path (requires the `with-tch` feature).
    #[arg(long = "model", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Comma separated detection counts replayed when no model is given.
    #[arg(long = "demo-counts", value_name = "LIST")]
    pub demo_counts: Option<String>,
    /// Target frame width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<i32>,
    /// Target frame height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<i32>,
    /// Detection confidence threshold (0-1).
    #[arg(long = "confidence", value_name = "VALUE")]
    pub confidence: Option<f32>,
    /// Non-maximum suppression IoU threshold (0-1).
    #[arg(long = "iou", value_name = "VALUE")]
    pub iou: Option<f32>,
    /// Box area fraction that turns the overlay red (0-1).
    #[arg(long = "area-threshold", value_name = "VALUE")]
    pub area_threshold: Option<f32>,
    /// Minimum detection count for a low alert.
    #[arg(long = "alert-low", value_name = "N")]
    pub alert_low: Option<usize>,
    /// Minimum detection count for a high alert.
    #[arg(long = "alert-high", value_name = "N")]
    pub alert_high: Option<usize>,
    /// HTTP bind address.
    #[arg(long = "bind", value_name = "ADDR")]
    pub bind: Option<String>,
    /// Delay between annotated stream parts in milliseconds.
    #[arg(long = "stream-interval-ms", value_name = "MS")]
    pub stream_interval_ms: Option<u64>,
    /// Delay between raw stream parts in milliseconds.
    #[arg(long = "raw-interval-ms", value_name = "MS")]
    pub raw_interval_ms: Option<u64>,
    /// JPEG quality used by the stream encoders (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<i32>,
    /// Queue depth per event bus subscriber.
    #[arg(long = "bus-capacity", value_name = "N")]
    pub bus_capacity: Option<usize>,
    /// Give up after this many capture restarts.
    #[arg(long = "max-restarts", value_name = "N")]
    pub max_restarts: Option<u32>,
    /// Enable verbose per-cycle logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let defaults = VisionConfig::default();

        let camera_uri = args
            .source_uri
            .or(args.camera_uri)
            .unwrap_or(defaults.camera_uri);
        if camera_uri.trim().is_empty() {
            bail!("Source must not be empty");
        }

        let width = args.width.unwrap_or(defaults.width);
        let height = args.height.unwrap_or(defaults.height);
        if width <= 0 || height <= 0 {
            bail!("Target width and height must be positive integers");
        }

        let confidence = unit_interval("--confidence", args.confidence, defaults.confidence)?;
        let iou_threshold = unit_interval("--iou", args.iou, defaults.iou_threshold)?;
        let area_threshold = unit_interval(
            "--area-threshold",
            args.area_threshold,
            defaults.area_threshold,
        )?;

        let alert = AlertThresholds::new(
            args.alert_low.unwrap_or(defaults.alert.low_min()),
            args.alert_high.unwrap_or(defaults.alert.high_min()),
        )
        .map_err(|err| anyhow!("{err}"))?;

        let bind = match args.bind {
            Some(addr) => addr
                .parse::<SocketAddr>()
                .with_context(|| format!("--bind expects host:port, got {addr:?}"))?,
            None => defaults.bind,
        };

        let jpeg_quality = args.jpeg_quality.unwrap_or(i32::from(defaults.jpeg_quality));
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let bus_capacity = args.bus_capacity.unwrap_or(defaults.bus_capacity);
        if bus_capacity == 0 {
            bail!("--bus-capacity must be at least 1");
        }

        let demo_counts = match args.demo_counts {
            Some(list) => parse_counts(&list)?,
            None => defaults.demo_counts,
        };

        let telemetry = TelemetryOptions {
            chrome_trace_path: args.chrome_trace,
        };

        let source_kind = SourceKind::from_uri(&camera_uri);

        Ok(Self {
            camera_uri,
            source_kind,
            model_path: args.model_path,
            demo_counts,
            width,
            height,
            confidence,
            iou_threshold,
            area_threshold,
            alert,
            bind,
            stream_interval: args
                .stream_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stream_interval),
            raw_interval: args
                .raw_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.raw_interval),
            jpeg_quality: jpeg_quality as u8,
            bus_capacity,
            max_restarts: args.max_restarts,
            verbose: args.verbose,
            telemetry,
        })
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            camera_uri: "0".to_string(),
            source_kind: SourceKind::Device,
            model_path: None,
            demo_counts: vec![0, 0, 1, 3, 3, 9, 0],
            width: 544,
            height: 960,
            confidence: 0.25,
            iou_threshold: 0.45,
            area_threshold: 0.3,
            alert: AlertThresholds::default(),
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            stream_interval: Duration::from_millis(10),
            raw_interval: Duration::from_millis(33),
            jpeg_quality: 85,
            bus_capacity: 8,
            max_restarts: None,
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }
}

fn unit_interval(flag: &str, value: Option<f32>, default: f32) -> Result<f32> {
    let value = value.unwrap_or(default);
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        bail!("{flag} must be between 0 and 1, got {value}");
    }
    Ok(value)
}

fn parse_counts(list: &str) -> Result<Vec<usize>> {
    let counts = list
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<usize>()
                .with_context(|| format!("--demo-counts entry {item:?} is not a count"))
        })
        .collect::<Result<Vec<_>>>()?;
    if counts.is_empty() {
        bail!("--demo-counts needs at least one value");
    }
    Ok(counts)
}

/// Detection thresholds read by the capture loop each cycle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Thresholds {
    pub confidence: f32,
    pub iou_threshold: f32,
    pub area_threshold: f32,
}

/// Body of `GET /api/config`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ConfigView {
    pub confidence: f32,
    pub iou_threshold: f32,
    pub area_threshold: f32,
    pub target_width: i32,
    pub target_height: i32,
    pub alert_low_min: usize,
    pub alert_high_min: usize,
}

/// Runtime-tunable settings shared by the capture loop and the HTTP layer.
#[derive(Clone)]
pub struct LiveConfig {
    thresholds: Arc<RwLock<Thresholds>>,
    alert: AlertThresholds,
    target: (i32, i32),
}

impl LiveConfig {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            thresholds: Arc::new(RwLock::new(Thresholds {
                confidence: config.confidence,
                iou_threshold: config.iou_threshold,
                area_threshold: config.area_threshold,
            })),
            alert: config.alert,
            target: (config.width, config.height),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        *self
            .thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn alert(&self) -> AlertThresholds {
        self.alert
    }

    /// Target `(width, height)` frames are normalised to.
    pub fn target(&self) -> (i32, i32) {
        self.target
    }

    /// Apply a partial update. Keys outside the allow-list are ignored; any
    /// invalid value for an allowed key rejects the whole update.
    pub fn apply_update(
        &self,
        update: &Map<String, Value>,
    ) -> Result<Vec<&'static str>, BridgeError> {
        let mut next = self.thresholds();
        let mut applied = Vec::new();
        for key in ["confidence", "iou_threshold", "area_threshold"] {
            let Some(raw) = update.get(key) else {
                continue;
            };
            let value = raw
                .as_f64()
                .filter(|value| value.is_finite() && (0.0..=1.0).contains(value))
                .ok_or_else(|| {
                    BridgeError::InvalidConfig(format!(
                        "{key} must be a number between 0 and 1, got {raw}"
                    ))
                })? as f32;
            match key {
                "confidence" => next.confidence = value,
                "iou_threshold" => next.iou_threshold = value,
                _ => next.area_threshold = value,
            }
            applied.push(key);
        }
        if !applied.is_empty() {
            *self
                .thresholds
                .write()
                .unwrap_or_else(PoisonError::into_inner) = next;
        }
        Ok(applied)
    }

    pub fn view(&self) -> ConfigView {
        let thresholds = self.thresholds();
        ConfigView {
            confidence: thresholds.confidence,
            iou_threshold: thresholds.iou_threshold,
            area_threshold: thresholds.area_threshold,
            target_width: self.target.0,
            target_height: self.target.1,
            alert_low_min: self.alert.low_min(),
            alert_high_min: self.alert.high_min(),
        }
    }
}
