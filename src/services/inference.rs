use image::DynamicImage;
use strum::IntoEnumIterator;

use crate::models::detection::{BoundingBox, Category, CategoryCounts, DetectionResult};

/// Model class id -> category. Ids outside the table count as `Other`.
const CLASS_CATEGORIES: [Category; 3] = [
    Category::Apoptosis, // 0: apoptosis
    Category::Viable,    // 1: normal
    Category::Other,     // 2: uncertain
];

/// One raw detection in source-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Opaque detection capability: image in, detections out.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<RawDetection>, InferenceError>;
}

/// Turns artifact bytes into a [`DetectionResult`] using a detector loaded
/// once at startup.
pub struct InferenceEngine {
    detector: Box<dyn Detector>,
}

impl InferenceEngine {
    pub fn new(detector: impl Detector + 'static) -> Self {
        Self {
            detector: Box::new(detector),
        }
    }

    /// Decode the image, run detection and aggregate the result.
    pub fn infer(&self, artifact: &[u8]) -> Result<DetectionResult, InferenceError> {
        let image = image::load_from_memory(artifact).map_err(InferenceError::Decode)?;
        let detections = self.detector.detect(&image)?;
        let result = aggregate(&detections);

        tracing::info!(
            detections = result.total_detections(),
            width = image.width(),
            height = image.height(),
            "Inference complete"
        );

        Ok(result)
    }
}

pub fn category_for(class_id: usize) -> Category {
    CLASS_CATEGORIES
        .get(class_id)
        .copied()
        .unwrap_or(Category::Other)
}

/// Build the per-job result from raw detections.
pub fn aggregate(detections: &[RawDetection]) -> DetectionResult {
    let mut counts = CategoryCounts::default();
    let mut confidence_sum = 0.0f64;
    let mut bounding_boxes = Vec::with_capacity(detections.len());

    for detection in detections {
        let category = category_for(detection.class_id);
        let confidence = f64::from(detection.confidence);
        counts.increment(category);
        confidence_sum += confidence;

        bounding_boxes.push(BoundingBox {
            category,
            confidence: round3(confidence),
            x: pixel(detection.x1),
            y: pixel(detection.y1),
            width: pixel(detection.x2 - detection.x1),
            height: pixel(detection.y2 - detection.y1),
        });
    }

    let total = counts.total();
    let average_confidence = if total > 0 {
        confidence_sum / f64::from(total)
    } else {
        0.0
    };

    DetectionResult {
        counts,
        average_confidence: round3(average_confidence),
        bounding_boxes,
        summary: summarize(&counts),
    }
}

/// e.g. `Detected 3 cells: Normal 2 (66.7%), Apoptosis 1 (33.3%), Other 0 (0.0%)`
pub fn summarize(counts: &CategoryCounts) -> String {
    let total = counts.total();
    let parts: Vec<String> = Category::iter()
        .map(|category| {
            let count = counts.get(category);
            format!(
                "{} {} ({:.1}%)",
                category.label(),
                count,
                percentage(count, total)
            )
        })
        .collect();

    format!("Detected {} cells: {}", total, parts.join(", "))
}

fn percentage(count: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(count) / f64::from(total) * 100.0
    }
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn pixel(value: f32) -> u32 {
    value.max(0.0) as u32
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("inference engine error: {0}")]
    Engine(String),
}
