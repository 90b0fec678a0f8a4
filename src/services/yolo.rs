//! YOLOv8-style ONNX detector run on CPU with tract.
//!
//! The exported model takes a `[1, 3, S, S]` RGB tensor in `[0, 1]` and
//! produces `[1, 4 + classes, anchors]` where the first four rows are the box
//! centre and size in input pixels and the remaining rows are class scores.

use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use tract_onnx::prelude::*;

use super::inference::{Detector, InferenceError, RawDetection};
use crate::config::ModelConfig;

type Plan = TypedRunnableModel<TypedModel>;

/// Grey used by the training pipeline to pad letterboxed images.
const PAD_VALUE: u8 = 114;

pub struct OnnxDetector {
    plan: Plan,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl OnnxDetector {
    /// Load and optimize the model. Called once at process start.
    pub fn load(config: &ModelConfig) -> Result<Self, InferenceError> {
        let model_load = |e: TractError| InferenceError::ModelLoad {
            path: config.path.clone(),
            reason: e.to_string(),
        };
        if config.input_size == 0 {
            return Err(InferenceError::ModelLoad {
                path: config.path.clone(),
                reason: "input_size must be greater than zero".to_string(),
            });
        }
        let size = config.input_size as usize;

        let plan = tract_onnx::onnx()
            .model_for_path(&config.path)
            .map_err(model_load)?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .map_err(model_load)?
            .into_optimized()
            .map_err(model_load)?
            .into_runnable()
            .map_err(model_load)?;

        tracing::info!(path = %config.path, input_size = size, "Model loaded");

        Ok(Self {
            plan,
            input_size: config.input_size,
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, InferenceError> {
        let letterbox = Letterbox::fit(image.width(), image.height(), self.input_size);
        let canvas = letterbox.apply(&image.to_rgb8());
        let size = self.input_size as usize;

        let input: Tensor =
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
                f32::from(canvas.get_pixel(x as u32, y as u32)[c]) / 255.0
            })
            .into();

        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .map_err(|e| InferenceError::Engine(e.to_string()))?;

        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Engine("model produced no outputs".to_string()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Engine(e.to_string()))?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| InferenceError::Engine(format!("unexpected output shape: {e}")))?;

        let candidates = decode(&view, self.confidence_threshold, &letterbox);
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Aspect-preserving resize into a square canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub size: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width.max(1) as f32).min(size as f32 / height.max(1) as f32);
        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, size);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            pad_x: ((size - resized_width) / 2) as f32,
            pad_y: ((size - resized_height) / 2) as f32,
            resized_width,
            resized_height,
            size,
        }
    }

    fn apply(&self, image: &RgbImage) -> RgbImage {
        let resized = image::imageops::resize(
            image,
            self.resized_width,
            self.resized_height,
            FilterType::Triangle,
        );
        let mut canvas = RgbImage::from_pixel(self.size, self.size, Rgb([PAD_VALUE; 3]));
        image::imageops::replace(
            &mut canvas,
            &resized,
            i64::from(self.pad_x as u32),
            i64::from(self.pad_y as u32),
        );
        canvas
    }

    /// Map a model-space coordinate pair back to the source image.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Pick the best class per anchor and keep anchors above the threshold.
fn decode(
    output: &tract_ndarray::ArrayView3<f32>,
    confidence_threshold: f32,
    letterbox: &Letterbox,
) -> Vec<RawDetection> {
    let (_, rows, anchors) = output.dim();
    if rows <= 4 {
        return Vec::new();
    }

    let mut detections = Vec::new();
    for i in 0..anchors {
        let (class_id, confidence) = (4..rows)
            .map(|row| (row - 4, output[[0, row, i]]))
            .fold((0, f32::MIN), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });

        if confidence < confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (
            output[[0, 0, i]],
            output[[0, 1, i]],
            output[[0, 2, i]],
            output[[0, 3, i]],
        );
        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

        detections.push(RawDetection {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        });
    }
    detections
}

fn iou(a: &RawDetection, b: &RawDetection) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = ix * iy;
    let area = |d: &RawDetection| (d.x2 - d.x1).max(0.0) * (d.y2 - d.y1).max(0.0);
    let union = area(a) + area(b) - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Per-class greedy NMS, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.class_id == candidate.class_id && iou(k, &candidate) > iou_threshold);
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}
