use std::{collections::HashSet, thread, time::Duration};

use video_ingest::Frame;

use crate::{DetectError, DetectParams, Detection, Detector};

/// Replays a fixed sequence of detection counts, cycling when exhausted.
///
/// Boxes are laid out on a grid across the frame. Calls listed with
/// [`ScriptedDetector::fail_on`] return an inference error instead.
pub struct ScriptedDetector {
    counts: Vec<usize>,
    cursor: usize,
    failures: HashSet<usize>,
    latency: Option<Duration>,
    class: String,
}

impl ScriptedDetector {
    pub fn new(counts: Vec<usize>) -> Self {
        Self {
            counts: if counts.is_empty() { vec![0] } else { counts },
            cursor: 0,
            failures: HashSet::new(),
            latency: None,
            class: "car".to_string(),
        }
    }

    /// Fail the call with this zero-based index.
    pub fn fail_on(mut self, call: usize) -> Self {
        self.failures.insert(call);
        self
    }

    /// Simulated inference time per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.cursor
    }

    fn boxes(&self, count: usize, width: f32, height: f32) -> Vec<Detection> {
        let cols = (count as f32).sqrt().ceil().max(1.0) as usize;
        let rows = count.div_ceil(cols).max(1);
        let cell_w = width / cols as f32;
        let cell_h = height / rows as f32;
        (0..count)
            .map(|i| {
                let (col, row) = (i % cols, i / cols);
                Detection {
                    bbox: [
                        col as f32 * cell_w + cell_w * 0.1,
                        row as f32 * cell_h + cell_h * 0.1,
                        cell_w * 0.8,
                        cell_h * 0.8,
                    ],
                    confidence: 0.9 - (i % 5) as f32 * 0.05,
                    class: self.class.clone(),
                }
            })
            .collect()
    }
}

impl Detector for ScriptedDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        params: DetectParams,
    ) -> Result<Vec<Detection>, DetectError> {
        let call = self.cursor;
        self.cursor += 1;
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        if self.failures.contains(&call) {
            tracing::debug!(call, "scripted detector failing on request");
            return Err(DetectError::Inference(format!("scripted failure on call {call}")));
        }
        let count = self.counts[call % self.counts.len()];
        Ok(self
            .boxes(count, frame.width as f32, frame.height as f32)
            .into_iter()
            .filter(|det| det.confidence >= params.confidence)
            .collect())
    }

    /// Warm-up does not consume a scripted entry.
    fn warm_up(&mut self, _width: i32, _height: i32) -> Result<(), DetectError> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("scripted detector ({} step cycle)", self.counts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_counts_in_order_and_cycles() {
        let mut detector = ScriptedDetector::new(vec![0, 3, 9]);
        let frame = Frame::blank(100, 100);
        let params = DetectParams::default();
        let counts: Vec<usize> = (0..4)
            .map(|_| detector.detect(&frame, params).unwrap().len())
            .collect();
        assert_eq!(counts, vec![0, 3, 9, 0]);
    }

    #[test]
    fn boxes_stay_inside_the_frame() {
        let mut detector = ScriptedDetector::new(vec![9]);
        let frame = Frame::blank(90, 60);
        for det in detector.detect(&frame, DetectParams::default()).unwrap() {
            assert!(det.bbox[0] >= 0.0 && det.bbox[0] + det.bbox[2] <= 90.0);
            assert!(det.bbox[1] >= 0.0 && det.bbox[1] + det.bbox[3] <= 60.0);
        }
    }

    #[test]
    fn scripted_failure_consumes_a_step() {
        let mut detector = ScriptedDetector::new(vec![1, 2]).fail_on(0);
        let frame = Frame::blank(10, 10);
        assert!(detector.detect(&frame, DetectParams::default()).is_err());
        assert_eq!(detector.detect(&frame, DetectParams::default()).unwrap().len(), 2);
        assert_eq!(detector.calls(), 2);
    }
}
