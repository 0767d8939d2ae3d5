use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::detect::backend::Detector;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub detector for testing and demos. Returns a fixed detection set.
pub struct StubDetector {
    name: String,
    detections: Vec<Detection>,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl StubDetector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            detections: Vec::new(),
            failing: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    /// Simulate an unreachable collaborator.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("stub detector '{}' unavailable", self.name));
        }
        Ok(self.detections.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::BoundingBox;

    #[test]
    fn stub_detector_returns_configured_detections() {
        let frame = Frame::from_rgb(vec![0u8; 12], 2, 2, 0).unwrap();
        let detector = StubDetector::new("stub").with_detections(vec![Detection {
            class_id: 0,
            confidence: 0.8,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
        }]);

        assert_eq!(detector.detect(&frame).unwrap().len(), 1);
        detector.set_failing(true);
        assert!(detector.detect(&frame).is_err());
        assert_eq!(detector.calls(), 2);
    }
}
