//! Overlay rendering drawn straight onto BGR frames.

use ml_core::Detection;
use video_ingest::Frame;

type Bgr = [u8; 3];

const GREEN: Bgr = [0, 255, 0];
const RED: Bgr = [0, 0, 255];
const WHITE: Bgr = [255, 255, 255];

const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const BOX_THICKNESS: i32 = 2;

/// Draw boxes and labels for `detections` onto a copy of `frame`.
///
/// Boxes covering more than `area_threshold` of the frame are drawn in red;
/// the returned flag is set when at least one box did.
pub fn render_overlays(
    frame: &Frame,
    detections: &[Detection],
    area_threshold: f32,
) -> (Frame, bool) {
    let mut out = frame.clone();
    if !out.is_well_formed() || out.width <= 0 || out.height <= 0 {
        return (out, false);
    }
    let (out_w, out_h) = (out.width as f32, out.height as f32);
    let frame_area = out_w * out_h;
    let mut area_alert = false;

    let mut canvas = Canvas::new(&mut out);
    for det in detections {
        let oversized = det.visible_area(out_w, out_h) / frame_area > area_threshold;
        area_alert |= oversized;
        let color = if oversized { RED } else { GREEN };

        let [x, y, w, h] = det.bbox;
        let left = x.round() as i32;
        let top = y.round() as i32;
        let right = (x + w).round() as i32;
        let bottom = (y + h).round() as i32;
        for inset in 0..BOX_THICKNESS {
            canvas.rectangle(left + inset, top + inset, right - inset, bottom - inset, color);
        }

        let label = format!("{} {:.0}%", det.class, det.confidence * 100.0);
        let label_y = if top - GLYPH_HEIGHT - 4 >= 0 {
            top - GLYPH_HEIGHT - 4
        } else {
            top + BOX_THICKNESS + 1
        };
        canvas.text_box(left, label_y, &label, color);
    }

    let info = format!("VEHICLES {}", detections.len());
    canvas.text_box(4, 4, &info, WHITE);

    (out, area_alert)
}

struct Canvas<'a> {
    data: &'a mut [u8],
    width: i32,
    height: i32,
}

impl<'a> Canvas<'a> {
    fn new(frame: &'a mut Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            data: &mut frame.data,
        }
    }

    fn offset(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return None;
        }
        Some(((y * self.width + x) * 3) as usize)
    }

    fn put(&mut self, x: i32, y: i32, color: Bgr) {
        if let Some(at) = self.offset(x, y) {
            self.data[at..at + 3].copy_from_slice(&color);
        }
    }

    fn darken(&mut self, x: i32, y: i32) {
        if let Some(at) = self.offset(x, y) {
            for channel in &mut self.data[at..at + 3] {
                *channel /= 3;
            }
        }
    }

    fn rectangle(&mut self, left: i32, top: i32, right: i32, bottom: i32, color: Bgr) {
        if right < left || bottom < top {
            return;
        }
        let left = left.max(0);
        let top = top.max(0);
        let right = right.min(self.width - 1);
        let bottom = bottom.min(self.height - 1);
        for x in left..=right {
            self.put(x, top, color);
            self.put(x, bottom, color);
        }
        for y in top..=bottom {
            self.put(left, y, color);
            self.put(right, y, color);
        }
    }

    /// Label on a darkened backing strip.
    fn text_box(&mut self, x: i32, y: i32, text: &str, color: Bgr) {
        let width = text.chars().count() as i32 * GLYPH_ADVANCE + 2;
        for py in y - 1..y + GLYPH_HEIGHT + 1 {
            for px in x - 1..x + width {
                self.darken(px, py);
            }
        }
        self.text(x + 1, y, text, color);
    }

    fn text(&mut self, mut x: i32, y: i32, text: &str, color: Bgr) {
        for ch in text.chars().flat_map(char::to_uppercase) {
            if let Some(glyph) = glyph_bits(ch) {
                for (row, pattern) in glyph.iter().enumerate() {
                    for col in 0..5 {
                        if (pattern >> (4 - col)) & 1 == 1 {
                            self.put(x + col, y + row as i32, color);
                        }
                    }
                }
            }
            x += GLYPH_ADVANCE;
        }
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4]) -> Detection {
        Detection {
            bbox,
            confidence: 0.9,
            class: "car".into(),
        }
    }

    fn pixel(frame: &Frame, x: i32, y: i32) -> [u8; 3] {
        let at = ((y * frame.width + x) * 3) as usize;
        [frame.data[at], frame.data[at + 1], frame.data[at + 2]]
    }

    #[test]
    fn small_box_is_green_without_alert() {
        let frame = Frame::blank(100, 100);
        let (out, alert) = render_overlays(&frame, &[det([40.0, 40.0, 20.0, 20.0])], 0.3);
        assert!(!alert);
        assert_eq!(pixel(&out, 50, 59), GREEN);
        assert_eq!(pixel(&out, 50, 50), [0, 0, 0]);
    }

    #[test]
    fn large_box_is_red_and_alerts() {
        let frame = Frame::blank(100, 100);
        let (out, alert) = render_overlays(&frame, &[det([10.0, 20.0, 80.0, 70.0])], 0.3);
        assert!(alert);
        assert_eq!(pixel(&out, 50, 89), RED);
    }

    #[test]
    fn source_frame_is_untouched_and_boxes_clip() {
        let frame = Frame::blank(32, 32);
        let (out, _) = render_overlays(&frame, &[det([-10.0, -10.0, 100.0, 100.0])], 1.0);
        assert!(frame.data.iter().all(|&b| b == 0));
        assert_eq!(out.data.len(), frame.data.len());
        assert_eq!(pixel(&out, 31, 16), GREEN);
    }

    #[test]
    fn off_frame_part_does_not_count_towards_area() {
        let frame = Frame::blank(100, 100);
        // 60x60 box half outside the frame: 30x60 visible, 18% of the frame.
        let half_out = det([70.0, 20.0, 60.0, 60.0]);
        let (_, alert) = render_overlays(&frame, std::slice::from_ref(&half_out), 0.3);
        assert!(!alert);
        let (out, alert) = render_overlays(&frame, &[half_out], 0.15);
        assert!(alert);
        assert_eq!(pixel(&out, 70, 50), RED);
    }

    #[test]
    fn glyphs_cover_vehicle_labels() {
        for label in ["CAR", "BUS", "TRUCK", "MOTORCYCLE", "BICYCLE", "VEHICLES"] {
            assert!(label.chars().all(|c| glyph_bits(c).is_some()), "{label}");
        }
    }
}
