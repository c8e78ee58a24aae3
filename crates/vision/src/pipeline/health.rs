//! Liveness of the capture loop as seen by the status endpoint.
//!
//! The capture loop writes its state and a heartbeat after every frame; the
//! HTTP layer only reads atomics, so status polling never contends with
//! capture.

use std::{
    sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

/// Time without a capture heartbeat before the camera is reported disconnected.
pub const CAPTURE_STALE_THRESHOLD_MS: u64 = 1_500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Init,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Running,
            2 => CaptureState::Stopping,
            3 => CaptureState::Stopped,
            4 => CaptureState::Failed,
            _ => CaptureState::Init,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CaptureState::Init => "init",
            CaptureState::Running => "running",
            CaptureState::Stopping => "stopping",
            CaptureState::Stopped => "stopped",
            CaptureState::Failed => "failed",
        }
    }
}

/// Body of `GET /api/status`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct StatusView {
    pub camera_connected: bool,
    pub model_loaded: bool,
    pub processing: bool,
    /// Seconds since the bridge was created.
    pub uptime: f64,
}

pub struct PipelineHealth {
    state: AtomicU8,
    last_capture_ms: AtomicU64,
    model_loaded: AtomicBool,
    restarts: AtomicU64,
    started: Instant,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CaptureState::Init as u8),
            last_capture_ms: AtomicU64::new(0),
            model_loaded: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Register a capture heartbeat.
    pub fn beat(&self) {
        self.last_capture_ms.store(current_millis(), Ordering::Relaxed);
    }

    pub fn set_state(&self, state: CaptureState) {
        let previous = self.state.swap(state as u8, Ordering::SeqCst);
        if previous != state as u8 {
            tracing::debug!(
                from = CaptureState::from_u8(previous).label(),
                to = state.label(),
                "capture state changed"
            );
        }
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_model_loaded(&self, loaded: bool) {
        self.model_loaded.store(loaded, Ordering::Relaxed);
    }

    pub fn model_loaded(&self) -> bool {
        self.model_loaded.load(Ordering::Relaxed)
    }

    pub fn record_restart(&self) -> u64 {
        self.restarts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Whether a frame arrived within [`CAPTURE_STALE_THRESHOLD_MS`] of `now`.
    pub fn capture_fresh(&self, now: u64) -> bool {
        let last = self.last_capture_ms.load(Ordering::Relaxed);
        last != 0 && now.saturating_sub(last) <= CAPTURE_STALE_THRESHOLD_MS
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn status(&self) -> StatusView {
        let processing = self.state() == CaptureState::Running;
        StatusView {
            camera_connected: processing && self.capture_fresh(current_millis()),
            model_loaded: self.model_loaded(),
            processing,
            uptime: self.uptime_secs(),
        }
    }
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
