use serde::{Deserialize, Serialize};

/// Fixed cell categories tracked per job.
///
/// Boxes carry the detector's label (`normal`, `apoptosis`, `other`) while the
/// persisted count columns name the first category `viable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::EnumIter)]
pub enum Category {
    #[serde(rename = "normal")]
    Viable,
    #[serde(rename = "apoptosis")]
    Apoptosis,
    #[serde(rename = "other")]
    Other,
}

impl Category {
    /// Label shown in bounding boxes and the summary.
    pub fn label(self) -> &'static str {
        match self {
            Category::Viable => "Normal",
            Category::Apoptosis => "Apoptosis",
            Category::Other => "Other",
        }
    }
}

/// Per-category detection counts. Serializes as `{viable, apoptosis, other}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub viable: u32,
    pub apoptosis: u32,
    pub other: u32,
}

impl CategoryCounts {
    pub fn get(&self, category: Category) -> u32 {
        match category {
            Category::Viable => self.viable,
            Category::Apoptosis => self.apoptosis,
            Category::Other => self.other,
        }
    }

    pub fn increment(&mut self, category: Category) {
        match category {
            Category::Viable => self.viable += 1,
            Category::Apoptosis => self.apoptosis += 1,
            Category::Other => self.other += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.viable + self.apoptosis + self.other
    }
}

/// One detected cell in source-image pixel space (top-left origin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(rename = "class")]
    pub category: Category,
    /// Rounded to 3 decimals
    pub confidence: f64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Output of one inference run, persisted together with the job's completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub counts: CategoryCounts,
    pub average_confidence: f64,
    pub bounding_boxes: Vec<BoundingBox>,
    pub summary: String,
}

impl DetectionResult {
    pub fn total_detections(&self) -> u32 {
        self.counts.total()
    }

    /// Value stored in `analysis_results.raw_data`.
    pub fn raw_data(&self) -> serde_json::Value {
        serde_json::json!({ "bounding_boxes": self.bounding_boxes })
    }
}
