//! Test payloads and images.

#![allow(dead_code)]

use cell_analysis_worker::services::inference::RawDetection;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

/// Encoded PNG standing in for an uploaded microscopy image.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(width, height)
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode png");
    buffer.into_inner()
}

/// Message body as published by the API server.
pub fn job_message(job_id: i64, s3_key: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "job_id": job_id,
        "image_id": 1,
        "s3_key": s3_key,
        "model_version": "yolov8-cells",
        "created_at": "2024-05-01T12:00:00Z",
    }))
    .expect("serialize message")
}

pub fn detection(class_id: usize, confidence: f32) -> RawDetection {
    RawDetection {
        class_id,
        confidence,
        x1: 12.0,
        y1: 30.0,
        x2: 48.0,
        y2: 70.0,
    }
}

/// Two normal cells at 0.9 and 0.8 and one apoptotic cell at 0.7.
pub fn three_cells() -> Vec<RawDetection> {
    vec![detection(1, 0.9), detection(1, 0.8), detection(0, 0.7)]
}
