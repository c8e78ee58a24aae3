//! Shared values passed between the capture loop and HTTP consumers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ml_core::Detection;
use serde::Serialize;
use tracing::debug;
use video_ingest::Frame;

use crate::alert::AlertLevel;

/// Holds exactly one current value. The lock only guards a pointer swap or
/// clone, so readers never wait on encoding or network I/O.
pub struct LatestSlot<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<T>>> {
        // The critical sections cannot panic, so a poisoned slot still holds a
        // complete value.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace(&self, value: Arc<T>) {
        *self.lock() = Some(value);
    }

    /// Store `value` only when `accept` approves of the current one.
    pub fn replace_if(&self, value: Arc<T>, accept: impl FnOnce(Option<&T>) -> bool) -> bool {
        let mut guard = self.lock();
        if accept(guard.as_deref()) {
            *guard = Some(value);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.lock().clone()
    }
}

/// A frame made visible to consumers, tagged with its capture sequence.
#[derive(Debug)]
pub struct PublishedFrame {
    pub sequence: u64,
    pub frame: Frame,
}

/// Single-slot store for the most recent frame of one kind.
#[derive(Clone, Default)]
pub struct FrameStore {
    slot: Arc<LatestSlot<PublishedFrame>>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame. Frames whose sequence is not newer than the
    /// stored one are discarded so readers never see a cycle twice.
    pub fn publish(&self, frame: PublishedFrame) -> bool {
        let sequence = frame.sequence;
        let accepted = self.slot.replace_if(Arc::new(frame), |current| {
            current.map_or(true, |current| sequence > current.sequence)
        });
        if !accepted {
            debug!(sequence, "discarding stale frame publish");
        }
        accepted
    }

    pub fn read(&self) -> Option<Arc<PublishedFrame>> {
        self.slot.get()
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.slot.get().map(|frame| frame.sequence)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub vehicle_count: usize,
    /// Seconds spent in the detector during the last completed cycle.
    pub last_inference_time: f64,
}

#[derive(Clone, Default)]
pub struct MetricsStore {
    slot: Arc<LatestSlot<MetricsSnapshot>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, vehicle_count: usize, inference_time: f64) {
        self.slot.replace(Arc::new(MetricsSnapshot {
            vehicle_count,
            last_inference_time: inference_time.max(0.0),
        }));
    }

    pub fn get(&self) -> MetricsSnapshot {
        self.slot.get().map(|snapshot| *snapshot).unwrap_or_default()
    }
}

/// One capture cycle's detection result, tied to its frame by `sequence`.
#[derive(Clone, Debug, Default)]
pub struct DetectionEvent {
    pub sequence: u64,
    pub detections: Vec<Detection>,
    pub alert_level: AlertLevel,
    /// Detector wall time in milliseconds.
    pub inference_ms: f64,
    pub captured_at_ms: i64,
    /// Unix seconds at publish time.
    pub published_at: f64,
    /// Some box covered more than the configured area fraction.
    pub area_alert: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class: String,
}

impl From<&Detection> for DetectionRecord {
    fn from(det: &Detection) -> Self {
        Self {
            bbox: det.bbox,
            confidence: det.confidence,
            class: det.class.clone(),
        }
    }
}

/// Body of `GET /api/detections`.
#[derive(Debug, Default, Serialize)]
pub struct DetectionsResponse {
    pub detections: Vec<DetectionRecord>,
    pub vehicle_count: usize,
    pub alert_triggered: u8,
    pub alert_level: AlertLevel,
    pub area_alert: bool,
    /// Milliseconds.
    pub processing_time: f64,
    pub frame_sequence: Option<u64>,
    pub last_update: f64,
}

impl DetectionsResponse {
    pub fn from_event(event: Option<&DetectionEvent>) -> Self {
        let Some(event) = event else {
            return Self::default();
        };
        Self {
            detections: event.detections.iter().map(DetectionRecord::from).collect(),
            vehicle_count: event.detections.len(),
            alert_triggered: event.alert_level.as_u8(),
            alert_level: event.alert_level,
            area_alert: event.area_alert,
            processing_time: event.inference_ms,
            frame_sequence: Some(event.sequence),
            last_update: event.published_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use video_ingest::FrameFormat;

    use super::*;

    fn filled(sequence: u64, len: usize) -> PublishedFrame {
        PublishedFrame {
            sequence,
            frame: Frame {
                data: vec![(sequence % 251) as u8; len],
                width: (len / 3) as i32,
                height: 1,
                timestamp_ms: sequence as i64,
                format: FrameFormat::Bgr8,
            },
        }
    }

    #[test]
    fn empty_store_reads_none() {
        assert!(FrameStore::new().read().is_none());
        assert_eq!(MetricsStore::new().get(), MetricsSnapshot::default());
    }

    #[test]
    fn read_returns_last_published_frame() {
        let store = FrameStore::new();
        for sequence in 1..=5 {
            assert!(store.publish(filled(sequence, 12)));
        }
        let latest = store.read().unwrap();
        assert_eq!(latest.sequence, 5);
        assert!(latest.frame.data.iter().all(|b| *b == 5));
    }

    #[test]
    fn stale_publish_is_ignored() {
        let store = FrameStore::new();
        store.publish(filled(7, 3));
        assert!(!store.publish(filled(7, 3)));
        assert!(!store.publish(filled(3, 3)));
        assert_eq!(store.latest_sequence(), Some(7));
    }

    #[test]
    fn concurrent_readers_never_see_torn_frames() {
        let store = FrameStore::new();
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for sequence in 1..=2_000u64 {
                    store.publish(filled(sequence, 3 * 256));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..5_000 {
                        if let Some(frame) = store.read() {
                            let expected = (frame.sequence % 251) as u8;
                            assert!(frame.frame.data.iter().all(|b| *b == expected));
                            assert!(frame.sequence >= last);
                            last = frame.sequence;
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.latest_sequence(), Some(2_000));
    }

    #[test]
    fn metrics_store_keeps_last_value() {
        let store = MetricsStore::new();
        store.set(3, 0.02);
        store.set(9, 0.05);
        assert_eq!(
            store.get(),
            MetricsSnapshot {
                vehicle_count: 9,
                last_inference_time: 0.05
            }
        );
    }

    #[test]
    fn response_defaults_before_first_event() {
        let response = DetectionsResponse::from_event(None);
        assert_eq!(response.vehicle_count, 0);
        assert_eq!(response.alert_triggered, 0);
        assert!(response.frame_sequence.is_none());
    }
}
