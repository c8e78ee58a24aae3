//! Geometry normalisation: scale to cover the target, then centre crop.

use image::{ImageBuffer, Rgb, imageops};

use crate::types::{CaptureError, Frame};

/// Bring `frame` to exactly `target_w` x `target_h`.
///
/// The frame is scaled by the larger of the two axis ratios so it covers the
/// target, then the overflow is cropped evenly from both sides. Frames that
/// already match are returned untouched.
pub fn transform_to_target(
    frame: Frame,
    target_w: i32,
    target_h: i32,
) -> Result<Frame, CaptureError> {
    if (frame.width, frame.height) == (target_w, target_h) {
        return Ok(frame);
    }
    if target_w <= 0 || target_h <= 0 {
        return Err(CaptureError::Malformed(format!(
            "target size {target_w}x{target_h} must be positive"
        )));
    }
    if !frame.is_well_formed() {
        return Err(CaptureError::Malformed(format!(
            "{}x{} frame carries {} bytes, expected {}",
            frame.width,
            frame.height,
            frame.data.len(),
            frame.expected_len()
        )));
    }

    let (w, h) = (frame.width as f64, frame.height as f64);
    let scale = (target_w as f64 / w).max(target_h as f64 / h);
    let new_w = ((w * scale).round() as u32).max(target_w as u32);
    let new_h = ((h * scale).round() as u32).max(target_h as u32);

    // Channel order is irrelevant to resampling, so BGR rides in an Rgb buffer.
    let source: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(frame.width as u32, frame.height as u32, frame.data)
            .ok_or_else(|| CaptureError::Malformed("frame buffer too small".into()))?;
    let resized = if (new_w, new_h) == source.dimensions() {
        source
    } else {
        imageops::resize(&source, new_w, new_h, imageops::FilterType::Triangle)
    };

    let x0 = (new_w - target_w as u32) / 2;
    let y0 = (new_h - target_h as u32) / 2;
    let cropped = imageops::crop_imm(&resized, x0, y0, target_w as u32, target_h as u32).to_image();

    Ok(Frame {
        data: cropped.into_raw(),
        width: target_w,
        height: target_h,
        timestamp_ms: frame.timestamp_ms,
        format: frame.format,
    })
}
