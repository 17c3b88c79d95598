use serde::{Deserialize, Serialize};

/// z-score for a 95% confidence interval.
pub const DEFAULT_CONFIDENCE_Z: f64 = 1.96;

/// Axis-aligned box in page-normalised coordinates, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub text: String,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub bbox: BoundingBox,
    pub px: f64,
    pub py: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Low,
    Medium,
    High,
}

/// Running position moments for one `(label, field)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldStats {
    pub n: i64,
    pub mean_px: f64,
    pub mean_py: f64,
    pub m2_px: f64,
    pub m2_py: f64,
}

impl FieldStats {
    /// Welford's incremental update with one more observed position.
    pub fn observe(self, px: f64, py: f64) -> Self {
        let n = self.n + 1;
        let dx = px - self.mean_px;
        let dy = py - self.mean_py;
        let mean_px = self.mean_px + dx / n as f64;
        let mean_py = self.mean_py + dy / n as f64;
        Self {
            n,
            mean_px,
            mean_py,
            m2_px: self.m2_px + dx * (px - mean_px),
            m2_py: self.m2_py + dy * (py - mean_py),
        }
    }

    pub fn confidence(&self, z: f64) -> Option<FieldConfidence> {
        if self.n < 2 {
            return None;
        }
        let n = self.n as f64;
        let se_px = (self.m2_px / (n - 1.0) / n).sqrt();
        let se_py = (self.m2_py / (n - 1.0) / n).sqrt();
        let width = 2.0 * z * se_px;
        let height = 2.0 * z * se_py;
        Some(FieldConfidence {
            px: (self.mean_px - z * se_px, self.mean_px + z * se_px),
            py: (self.mean_py - z * se_py, self.mean_py + z * se_py),
            n: self.n,
            width,
            height,
            significance: significance(width, height, self.n),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldConfidence {
    pub px: (f64, f64),
    pub py: (f64, f64),
    pub n: i64,
    pub width: f64,
    pub height: f64,
    pub significance: Significance,
}

impl FieldConfidence {
    pub fn contains(&self, px: f64, py: f64) -> bool {
        self.px.0 <= px && px <= self.px.1 && self.py.0 <= py && py <= self.py.1
    }
}

fn significance(width: f64, height: f64, n: i64) -> Significance {
    if width < 0.02 && height < 0.02 && n >= 5 {
        Significance::High
    } else if width < 0.05 && height < 0.05 && n >= 3 {
        Significance::Medium
    } else {
        Significance::Low
    }
}
