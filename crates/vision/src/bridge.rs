//! The shared state handed to both sides of the bridge.

use std::sync::Arc;

use video_ingest::Frame;

use crate::{
    bus::DetectionEventBus,
    data::{DetectionEvent, FrameStore, MetricsStore, PublishedFrame},
    pipeline::{config::LiveConfig, health::PipelineHealth},
};

/// Cloneable bundle of stores. Every clone refers to the same slots.
#[derive(Clone)]
pub struct Bridge {
    pub annotated: FrameStore,
    pub raw: FrameStore,
    pub metrics: MetricsStore,
    pub bus: DetectionEventBus,
    pub live: LiveConfig,
    pub health: Arc<PipelineHealth>,
}

impl Bridge {
    pub fn new(live: LiveConfig, bus_capacity: usize) -> Self {
        Self {
            annotated: FrameStore::new(),
            raw: FrameStore::new(),
            metrics: MetricsStore::new(),
            bus: DetectionEventBus::new(bus_capacity),
            live,
            health: Arc::new(PipelineHealth::new()),
        }
    }

    /// Make both renditions of one captured frame visible. The raw frame goes
    /// first so an annotated reader never sees a sequence the raw store lacks.
    pub fn publish_frame(&self, sequence: u64, raw: Frame, annotated: Frame) -> bool {
        let raw_ok = self.raw.publish(PublishedFrame {
            sequence,
            frame: raw,
        });
        let annotated_ok = self.annotated.publish(PublishedFrame {
            sequence,
            frame: annotated,
        });
        raw_ok && annotated_ok
    }

    /// Record metrics for the cycle and fan the event out to subscribers.
    pub fn publish_event(&self, event: DetectionEvent) -> Arc<DetectionEvent> {
        self.metrics
            .set(event.detections.len(), event.inference_ms / 1_000.0);
        self.bus.publish(event)
    }

    pub fn read_latest_frame(&self) -> Option<Arc<PublishedFrame>> {
        self.annotated.read()
    }

    pub fn read_latest_event(&self) -> Option<Arc<DetectionEvent>> {
        self.bus.latest()
    }
}

#[cfg(test)]
mod tests {
    use ml_core::Detection;

    use super::*;
    use crate::pipeline::config::VisionConfig;

    fn bridge() -> Bridge {
        Bridge::new(LiveConfig::new(&VisionConfig::default()), 4)
    }

    #[test]
    fn empty_bridge_reads_nothing() {
        let bridge = bridge();
        assert!(bridge.read_latest_frame().is_none());
        assert!(bridge.read_latest_event().is_none());
        assert_eq!(bridge.metrics.get().vehicle_count, 0);
    }

    #[test]
    fn event_updates_metrics() {
        let bridge = bridge();
        bridge.publish_frame(1, Frame::blank(4, 4), Frame::blank(4, 4));
        bridge.publish_event(DetectionEvent {
            sequence: 1,
            detections: vec![
                Detection {
                    bbox: [0.0, 0.0, 1.0, 1.0],
                    confidence: 0.8,
                    class: "car".into(),
                };
                3
            ],
            inference_ms: 12.0,
            ..Default::default()
        });
        let metrics = bridge.metrics.get();
        assert_eq!(metrics.vehicle_count, 3);
        assert!((metrics.last_inference_time - 0.012).abs() < 1e-9);
        assert_eq!(bridge.read_latest_event().unwrap().sequence, 1);
        assert_eq!(bridge.read_latest_frame().unwrap().sequence, 1);
    }

    #[test]
    fn replayed_frame_is_rejected_by_both_stores() {
        let bridge = bridge();
        assert!(bridge.publish_frame(5, Frame::blank(2, 2), Frame::blank(2, 2)));
        assert!(!bridge.publish_frame(5, Frame::blank(2, 2), Frame::blank(2, 2)));
        assert_eq!(bridge.raw.latest_sequence(), Some(5));
    }
}
