//! The producer side: capture, detect, annotate, publish.
//!
//! One [`CaptureLoop`] runs on a dedicated thread. Each cycle publishes the
//! raw frame, the annotated frame, the metrics snapshot and finally the
//! detection event, so an event never names a frame readers cannot fetch yet.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use ml_core::{DetectParams, Detector};
use tracing::{debug, info, warn};
use video_ingest::{CaptureError, FrameSource, transform_to_target};

use crate::{
    alert::AlertLevel,
    annotation::render_overlays,
    bridge::Bridge,
    data::DetectionEvent,
    error::BridgeError,
    pipeline::{health::CaptureState, telemetry},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Published {
        sequence: u64,
        detections: usize,
        alert_level: AlertLevel,
    },
    /// Shutdown was requested; the loop is now stopped.
    Shutdown,
}

#[derive(Debug)]
pub enum LoopExit {
    Shutdown,
    Failed(BridgeError),
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    bridge: Bridge,
    shutdown: Arc<AtomicBool>,
    next_sequence: u64,
    initialized: bool,
    verbose: bool,
    last_cycle: Option<Instant>,
}

impl CaptureLoop {
    /// Sequence numbering continues after whatever the bridge already shows,
    /// so a restarted loop never republishes an old sequence.
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        bridge: Bridge,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let next_sequence = bridge
            .annotated
            .latest_sequence()
            .map_or(1, |sequence| sequence + 1);
        Self {
            source,
            detector,
            bridge,
            shutdown,
            next_sequence,
            initialized: false,
            verbose: false,
            last_cycle: None,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Warm the detector and enter `Running`. Warm-up failure only costs the
    /// first real frame some latency, so it is logged and ignored.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }
        let health = &self.bridge.health;
        health.set_state(CaptureState::Init);
        let (width, height) = self.bridge.live.target();
        let started = Instant::now();
        match self.detector.warm_up(width, height) {
            Ok(()) => info!(
                detector = %self.detector.describe(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "detector warmed up"
            ),
            Err(err) => warn!("detector warm-up failed: {err}"),
        }
        health.set_model_loaded(true);
        health.set_state(CaptureState::Running);
        info!(source = %self.source.describe(), "capture loop running");
        self.initialized = true;
    }

    /// Run one capture cycle. Only capture failures are returned as errors;
    /// the loop is `Failed` afterwards.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, BridgeError> {
        self.init();
        let health = self.bridge.health.clone();

        if self.shutdown.load(Ordering::Relaxed) {
            health.set_state(CaptureState::Stopping);
            info!("shutdown requested, stopping capture loop");
            health.set_state(CaptureState::Stopped);
            return Ok(CycleOutcome::Shutdown);
        }

        let sequence = self.next_sequence;
        let span = tracing::info_span!("capture.cycle", sequence);
        let _guard = span.enter();
        let cycle_start = Instant::now();

        let frame = match self.acquire() {
            Ok(frame) => frame,
            Err(err) => {
                let err = BridgeError::from(err);
                err.record();
                health.set_state(CaptureState::Failed);
                return Err(err);
            }
        };
        health.beat();

        let thresholds = self.bridge.live.thresholds();
        let params = DetectParams {
            confidence: thresholds.confidence,
            iou: thresholds.iou_threshold,
        };
        let detect_start = Instant::now();
        let (detections, inference_ms) = match self.detector.detect(&frame, params) {
            Ok(detections) => (detections, detect_start.elapsed().as_secs_f64() * 1_000.0),
            Err(source) => {
                let err = BridgeError::DetectionTransient { sequence, source };
                err.record();
                warn!("{err}");
                (Vec::new(), 0.0)
            }
        };

        let alert_level = self.bridge.live.alert().classify(detections.len());
        let (annotated, area_alert) =
            render_overlays(&frame, &detections, thresholds.area_threshold);
        let captured_at_ms = frame.timestamp_ms;

        self.bridge.publish_frame(sequence, frame, annotated);
        let count = detections.len();
        self.bridge.publish_event(DetectionEvent {
            sequence,
            detections,
            alert_level,
            inference_ms,
            captured_at_ms,
            published_at: unix_seconds(),
            area_alert,
        });
        self.next_sequence += 1;

        self.record_timing(cycle_start, count);
        if self.verbose {
            info!(
                count,
                alert = alert_level.label(),
                area_alert,
                inference_ms,
                "cycle published"
            );
        } else {
            debug!(count, alert = alert_level.label(), "cycle published");
        }

        Ok(CycleOutcome::Published {
            sequence,
            detections: count,
            alert_level,
        })
    }

    /// Drive cycles until shutdown or a capture failure.
    pub fn run(mut self) -> LoopExit {
        loop {
            match self.run_cycle() {
                Ok(CycleOutcome::Published { .. }) => {}
                Ok(CycleOutcome::Shutdown) => return LoopExit::Shutdown,
                Err(err) => return LoopExit::Failed(err),
            }
        }
    }

    fn acquire(&mut self) -> Result<video_ingest::Frame, CaptureError> {
        let frame = self.source.next_frame()?;
        if !frame.is_well_formed() {
            return Err(CaptureError::Malformed(format!(
                "{}x{} frame carries {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }
        let (width, height) = self.bridge.live.target();
        transform_to_target(frame, width, height)
    }

    fn record_timing(&mut self, cycle_start: Instant, count: usize) {
        let now = Instant::now();
        metrics::histogram!("vision_capture_cycle_seconds")
            .record(now.duration_since(cycle_start).as_secs_f64());
        metrics::gauge!("vision_detections").set(count as f64);
        if let Some(previous) = self.last_cycle {
            let interval = now.duration_since(previous).as_secs_f64();
            if interval > 0.0 {
                metrics::gauge!("vision_pipeline_fps").set(1.0 / interval);
            }
        }
        self.last_cycle = Some(now);
    }
}

/// Start `capture` on its own named thread.
pub fn spawn_capture_loop(capture: CaptureLoop) -> io::Result<thread::JoinHandle<LoopExit>> {
    telemetry::spawn_thread("vision-capture", move || capture.run())
}

fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1_000.0
}
