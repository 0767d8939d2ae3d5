//! Zone membership for detections.
//!
//! A detection is "at" a zone when enough of the detection box lies inside the
//! zone rectangle. The ratio is intersection area over the detection box's own
//! area, not intersection over union. That makes the test asymmetric: a small
//! box fully inside a large zone scores 1.0, while a large box around a small
//! zone scores well below 1.0.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::detect::Detection;

/// Default minimum fraction of a detection box that must lie inside a zone.
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.5;

/// Axis-aligned box in frame pixel coordinates, `(x1, y1)` top-left and
/// `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 as f64 - self.x1 as f64).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 as f64 - self.y1 as f64).max(0.0)
    }

    /// Area, zero for inverted or degenerate boxes.
    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let left = (self.x1 as f64).max(other.x1 as f64);
        let top = (self.y1 as f64).max(other.y1 as f64);
        let right = (self.x2 as f64).min(other.x2 as f64);
        let bottom = (self.y2 as f64).min(other.y2 as f64);
        (right - left).max(0.0) * (bottom - top).max(0.0)
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.x1 as f64 + self.x2 as f64) / 2.0,
            y: (self.y1 as f64 + self.y2 as f64) / 2.0,
        }
    }

    fn is_finite(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Named rectangle, e.g. the feeder or the waterer.
#[derive(Clone, Debug, PartialEq)]
pub struct Zone {
    pub name: String,
    pub region: BoundingBox,
}

impl Zone {
    pub fn new(name: &str, region: BoundingBox) -> Result<Self> {
        validate_zone_name(name)?;
        if !region.is_finite() || region.area() <= 0.0 {
            return Err(anyhow!(
                "zone '{}' must be a rectangle with x2 > x1 and y2 > y1",
                name
            ));
        }
        Ok(Self {
            name: name.to_lowercase(),
            region,
        })
    }
}

pub fn validate_zone_name(name: &str) -> Result<()> {
    static ZONE_NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_-]{1,32}$").expect("zone name pattern is valid")
    });
    if !re.is_match(&name.to_lowercase()) {
        return Err(anyhow!(
            "zone name '{}' must match ^[a-z0-9_-]{{1,32}}$",
            name
        ));
    }
    Ok(())
}

/// Fraction of `bbox` that lies inside `region`. Zero-area boxes score 0.
pub fn overlap_ratio(bbox: &BoundingBox, region: &BoundingBox) -> f64 {
    let area = bbox.area();
    if area <= 0.0 {
        return 0.0;
    }
    bbox.intersection_area(region) / area
}

/// True when at least `threshold` of `bbox` lies inside the zone (inclusive).
pub fn is_in_zone(bbox: &BoundingBox, zone: &Zone, threshold: f64) -> bool {
    if bbox.area() <= 0.0 {
        return false;
    }
    overlap_ratio(bbox, &zone.region) >= threshold
}

/// Count detections of `target_class` that are in the zone.
pub fn count_in_zone(
    detections: &[Detection],
    zone: &Zone,
    target_class: u32,
    threshold: f64,
) -> usize {
    detections
        .iter()
        .filter(|d| d.class_id == target_class)
        .filter(|d| is_in_zone(&d.bbox, zone, threshold))
        .count()
}

/// Box centres of every detection of `target_class`.
pub fn detection_centers(detections: &[Detection], target_class: u32) -> Vec<Point> {
    detections
        .iter()
        .filter(|d| d.class_id == target_class)
        .map(|d| d.bbox.center())
        .collect()
}
