//! Supervisor wiring the capture loop, the HTTP server and the event bus.
//!
//! The HTTP server is started once and outlives capture restarts, so clients
//! keep receiving the last published data while the camera reconnects.

pub mod config;
pub mod health;
pub mod telemetry;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use ml_core::{Detector, ScriptedDetector};
use tracing::{error, info, warn};
use video_ingest::{FrameSource, SyntheticSource};

use crate::{
    bridge::Bridge,
    bus::SubscriptionHandle,
    capture::{CaptureLoop, LoopExit, spawn_capture_loop},
    data::DetectionEvent,
    server::{ServerState, spawn_http_server},
};
use config::{LiveConfig, SourceKind, VisionConfig};
use health::CaptureState;

const RESTART_DELAY: Duration = Duration::from_secs(1);
const SYNC_LOG_EVERY: u64 = 30;
const SYNTHETIC_FPS: u32 = 30;
#[cfg(feature = "with-tch")]
const MODEL_INPUT_SIZE: (i64, i64) = (640, 640);

/// Launch the bridge with a ready-made configuration and block until Ctrl+C
/// or until the capture loop gives up.
pub fn run(config: VisionConfig) -> Result<()> {
    let _telemetry = telemetry::init_tracing(&config.telemetry, config.verbose);
    if telemetry::init_metrics_recorder().is_none() {
        warn!("Prometheus exposition disabled; /metrics will answer 204");
    }

    let supervisor = Supervisor::new(config.clone());
    let shutdown = supervisor.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl+C handler")?;

    let source_config = config.clone();
    supervisor.run(
        move || open_source(&source_config),
        move || open_detector(&config),
    )
}

/// Owns the bridge and restarts the capture loop after fatal capture errors.
pub struct Supervisor {
    config: VisionConfig,
    bridge: Bridge,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(config: VisionConfig) -> Self {
        let bridge = Bridge::new(LiveConfig::new(&config), config.bus_capacity);
        Self {
            config,
            bridge,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Setting the flag stops the capture loop at its next cycle.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Serve HTTP and keep a capture loop running until shutdown.
    ///
    /// `sources` and `detectors` are called again for every restart.
    pub fn run<S, D>(self, mut sources: S, mut detectors: D) -> Result<()>
    where
        S: FnMut() -> Result<Box<dyn FrameSource>>,
        D: FnMut() -> Result<Box<dyn Detector>>,
    {
        let sync_log = subscribe_sync_log(&self.bridge)?;
        let server = spawn_http_server(
            ServerState {
                bridge: self.bridge.clone(),
                stream_interval: self.config.stream_interval,
                raw_interval: self.config.raw_interval,
                jpeg_quality: self.config.jpeg_quality,
            },
            self.config.bind,
        )?;

        let outcome = self.supervise(&mut sources, &mut detectors);

        self.bridge.bus.unsubscribe(sync_log);
        server.stop();
        match &outcome {
            Ok(()) => info!("bridge stopped"),
            Err(err) => error!("bridge stopped: {err:#}"),
        }
        outcome
    }

    fn supervise<S, D>(&self, sources: &mut S, detectors: &mut D) -> Result<()>
    where
        S: FnMut() -> Result<Box<dyn FrameSource>>,
        D: FnMut() -> Result<Box<dyn Detector>>,
    {
        let health = &self.bridge.health;
        let mut restarts: u32 = 0;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                health.set_state(CaptureState::Stopped);
                return Ok(());
            }

            let failure = match self.run_once(sources, detectors) {
                Ok(LoopExit::Shutdown) => return Ok(()),
                Ok(LoopExit::Failed(err)) => anyhow::Error::new(err),
                Err(err) => {
                    health.set_state(CaptureState::Failed);
                    err
                }
            };
            error!("capture loop failed: {failure:#}");

            if self.config.max_restarts.is_some_and(|max| restarts >= max) {
                bail!("capture failed after {restarts} restarts: {failure:#}");
            }
            restarts += 1;
            health.record_restart();
            metrics::counter!("vision_capture_restarts_total").increment(1);
            warn!(
                attempt = restarts,
                "restarting capture in {}s",
                RESTART_DELAY.as_secs_f32()
            );
            if !self.wait_restart_delay() {
                health.set_state(CaptureState::Stopped);
                return Ok(());
            }
        }
    }

    fn run_once<S, D>(&self, sources: &mut S, detectors: &mut D) -> Result<LoopExit>
    where
        S: FnMut() -> Result<Box<dyn FrameSource>>,
        D: FnMut() -> Result<Box<dyn Detector>>,
    {
        let source = sources().context("Failed to open frame source")?;
        let detector = detectors().context("Failed to load detector")?;
        info!(
            source = %source.describe(),
            detector = %detector.describe(),
            "starting capture loop"
        );
        let capture = CaptureLoop::new(source, detector, self.bridge.clone(), self.shutdown.clone())
            .with_verbose(self.config.verbose);
        let handle = spawn_capture_loop(capture).context("Failed to spawn capture thread")?;
        handle
            .join()
            .map_err(|_| anyhow!("capture thread panicked"))
    }

    /// Sleep for the restart delay. Returns `false` if shutdown was requested
    /// meanwhile.
    fn wait_restart_delay(&self) -> bool {
        let deadline = Instant::now() + RESTART_DELAY;
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(Duration::from_millis(50));
        }
        !self.shutdown.load(Ordering::SeqCst)
    }
}

/// Periodic "data sync" log line fed by the event bus.
fn subscribe_sync_log(bridge: &Bridge) -> Result<SubscriptionHandle> {
    let mut seen: u64 = 0;
    bridge
        .bus
        .subscribe(
            "sync-log",
            Box::new(move |event: &DetectionEvent| {
                seen += 1;
                if seen % SYNC_LOG_EVERY == 0 {
                    info!(
                        sequence = event.sequence,
                        vehicles = event.detections.len(),
                        alert = event.alert_level.label(),
                        "data sync"
                    );
                }
                Ok(())
            }),
        )
        .context("Failed to spawn sync log subscriber")
}

/// Open the frame source named by the configuration.
pub fn open_source(config: &VisionConfig) -> Result<Box<dyn FrameSource>> {
    let target = (config.width, config.height);
    let uri = config.camera_uri.as_str();
    let source: Box<dyn FrameSource> = match config.source_kind {
        SourceKind::Synthetic => Box::new(
            SyntheticSource::new(config.width, config.height).with_fps(SYNTHETIC_FPS),
        ),
        SourceKind::Rtsp => Box::new(video_ingest::spawn_rtsp_reader(uri, target)?),
        SourceKind::Udp => Box::new(video_ingest::spawn_udp_reader(uri, target)?),
        SourceKind::Device => open_device(uri, target)?,
    };
    Ok(source)
}

#[cfg(feature = "opencv")]
fn open_device(uri: &str, target: (i32, i32)) -> Result<Box<dyn FrameSource>> {
    if video_ingest::parse_device_index(uri).is_some() {
        match video_ingest::spawn_camera_reader(uri, target) {
            Ok(source) => return Ok(Box::new(source)),
            Err(err) => warn!("OpenCV capture unavailable ({err}); falling back to ffmpeg"),
        }
    }
    Ok(Box::new(video_ingest::spawn_device_reader(uri, target)?))
}

#[cfg(not(feature = "opencv"))]
fn open_device(uri: &str, target: (i32, i32)) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(video_ingest::spawn_device_reader(uri, target)?))
}

/// Load the TorchScript detector, or the scripted one when no model is set.
pub fn open_detector(config: &VisionConfig) -> Result<Box<dyn Detector>> {
    match &config.model_path {
        None => Ok(Box::new(ScriptedDetector::new(config.demo_counts.clone()))),
        Some(path) => load_model(path),
    }
}

#[cfg(feature = "with-tch")]
fn load_model(path: &std::path::Path) -> Result<Box<dyn Detector>> {
    let device = ml_core::tch::Device::cuda_if_available();
    let detector = ml_core::detector::TorchDetector::new(path, device, MODEL_INPUT_SIZE)
        .with_context(|| format!("Failed to load model {}", path.display()))?;
    info!(model = %path.display(), ?device, "TorchScript detector loaded");
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn load_model(path: &std::path::Path) -> Result<Box<dyn Detector>> {
    bail!(
        "--model {} requires a build with the `with-tch` feature",
        path.display()
    )
}
