//! Hardware-free test pattern source.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    FrameSource,
    types::{CaptureError, Frame, FrameFormat},
};

/// Generates a moving-bar test pattern at a fixed rate.
///
/// With a frame limit the source reports [`CaptureError::EndOfStream`] once the
/// limit is reached, which callers treat like a camera disconnect.
pub struct SyntheticSource {
    width: i32,
    height: i32,
    interval: Option<Duration>,
    limit: Option<u64>,
    produced: u64,
    last_emit: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            interval: None,
            limit: None,
            produced: 0,
            last_emit: None,
        }
    }

    /// Pace frames to roughly `fps` per second. Zero disables pacing.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
        self
    }

    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    fn render(&self, index: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_width = (w / 8).max(1);
        let bar_x = (index as usize * 4) % w;
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            let shade = ((y * 255) / h.max(1)) as u8;
            for x in 0..w {
                if x >= bar_x && x < bar_x + bar_width {
                    data.extend_from_slice(&[255, 255, 255]);
                } else {
                    data.extend_from_slice(&[shade, 64, 255 - shade]);
                }
            }
        }
        data
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Err(CaptureError::EndOfStream);
        }
        if let (Some(interval), Some(last)) = (self.interval, self.last_emit) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());

        let data = self.render(self.produced);
        self.produced += 1;
        Ok(Frame {
            data,
            width: self.width,
            height: self.height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_have_target_geometry() {
        let mut source = SyntheticSource::new(16, 8);
        let frame = source.next_frame().unwrap();
        assert!(frame.is_well_formed());
        assert_eq!((frame.width, frame.height), (16, 8));
    }

    #[test]
    fn limit_ends_the_stream() {
        let mut source = SyntheticSource::new(4, 4).with_limit(2);
        assert!(source.next_frame().is_ok());
        assert!(source.next_frame().is_ok());
        assert!(matches!(
            source.next_frame(),
            Err(CaptureError::EndOfStream)
        ));
        assert_eq!(source.produced(), 2);
    }

    #[test]
    fn pattern_moves_between_frames() {
        let mut source = SyntheticSource::new(32, 2);
        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        assert_ne!(first.data, second.data);
    }
}
