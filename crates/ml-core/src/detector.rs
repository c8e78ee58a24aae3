//! TorchScript YOLO detector.

use std::{convert::TryFrom, path::Path};

use tch::{self, Device, Kind, Tensor};
use video_ingest::{Frame, FrameFormat};

use crate::{
    DetectError, DetectParams, Detection, Detector,
    postprocess::{non_max_suppression, vehicle_label},
};

const MAX_CANDIDATES: usize = 512;

/// Wraps an exported YOLO TorchScript module whose output is
/// `[1, 4 + classes, predictions]` with centre-format boxes.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
}

impl TorchDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self, DetectError> {
        let module = tch::CModule::load_on_device(model_path, device)
            .map_err(|err| DetectError::Other(err.into()))?;
        Ok(Self {
            module,
            device,
            input_size,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Converts a BGR frame into a normalised `[1, 3, H, W]` RGB tensor at the
    /// detector's input size.
    pub fn bgr_to_tensor(&self, frame: &Frame) -> Result<Tensor, DetectError> {
        if !matches!(frame.format, FrameFormat::Bgr8) || !frame.is_well_formed() {
            return Err(DetectError::InvalidInput(format!(
                "unexpected frame buffer: {} bytes for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let (in_w, in_h) = self.input_size;
        let (width, height) = (frame.width as i64, frame.height as i64);
        let tensor = Tensor::from_slice(&frame.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, height, width, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;

        if (width, height) == (in_w, in_h) {
            return Ok(tensor);
        }
        Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None::<f64>, None::<f64>))
    }

    /// Factors mapping detector input coordinates back onto `frame`.
    fn scale_to_frame(&self, frame: &Frame) -> (f32, f32) {
        let (in_w, in_h) = self.input_size;
        (
            frame.width as f32 / in_w as f32,
            frame.height as f32 / in_h as f32,
        )
    }

    fn decode(
        &self,
        output: &Tensor,
        params: DetectParams,
        (sx, sy): (f32, f32),
    ) -> Result<Vec<Detection>, DetectError> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(DetectError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| DetectError::Inference(err.to_string()))?;

        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < params.confidence {
                continue;
            }
            let Some(label) = vehicle_label(class_id as i64) else {
                continue;
            };
            let (cx, cy, w, h) = (row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy);
            candidates.push(Detection {
                bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                confidence: score,
                class: label.to_string(),
            });
            if candidates.len() >= MAX_CANDIDATES {
                break;
            }
        }

        let candidate_count = candidates.len();
        let kept = non_max_suppression(candidates, params.iou);
        tracing::trace!(
            candidates = candidate_count,
            kept = kept.len(),
            "decoded detector output"
        );
        Ok(kept)
    }
}

impl Detector for TorchDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        params: DetectParams,
    ) -> Result<Vec<Detection>, DetectError> {
        let input = self.bgr_to_tensor(frame)?;
        let output = tch::no_grad(|| self.module.forward_ts(&[input]))
            .map_err(|err| DetectError::Inference(err.to_string()))?;
        self.decode(&output, params, self.scale_to_frame(frame))
    }

    fn describe(&self) -> String {
        format!(
            "torchscript detector on {:?} ({}x{})",
            self.device, self.input_size.0, self.input_size.1
        )
    }
}
