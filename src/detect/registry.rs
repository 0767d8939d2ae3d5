use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::Detector;

/// Route name that selects the unannotated feed.
pub const RAW_FEED_NAME: &str = "nodetect";

/// Named detectors available to streams and zone counting.
pub struct DetectorRegistry {
    detectors: HashMap<String, Arc<dyn Detector>>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a detector. The first registered detector becomes the default.
    pub fn register<D: Detector + 'static>(&mut self, detector: D) -> Result<()> {
        self.register_shared(Arc::new(detector))
    }

    pub fn register_shared(&mut self, detector: Arc<dyn Detector>) -> Result<()> {
        let name = detector.name().to_string();
        if name == RAW_FEED_NAME {
            return Err(anyhow!("detector name '{}' is reserved", RAW_FEED_NAME));
        }
        if self.detectors.contains_key(&name) {
            return Err(anyhow!("detector '{}' already registered", name));
        }
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.detectors.insert(name, detector);
        Ok(())
    }

    /// Set default detector by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.detectors.contains_key(name) {
            return Err(anyhow!("detector '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.detectors.get(name).cloned()
    }

    pub fn default_detector(&self) -> Option<Arc<dyn Detector>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Resolve a stream route name. `nodetect` maps to `Ok(None)`.
    pub fn resolve(&self, name: &str) -> Result<Option<Arc<dyn Detector>>> {
        if name == RAW_FEED_NAME {
            return Ok(None);
        }
        self.get(name)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown detector '{}'", name))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.detectors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubDetector;

    #[test]
    fn first_registered_is_default() {
        let mut registry = DetectorRegistry::new();
        registry.register(StubDetector::new("model1")).unwrap();
        registry.register(StubDetector::new("model2")).unwrap();
        assert_eq!(registry.default_detector().unwrap().name(), "model1");

        registry.set_default("model2").unwrap();
        assert_eq!(registry.default_detector().unwrap().name(), "model2");
        assert!(registry.set_default("model9").is_err());
        assert_eq!(registry.list(), vec!["model1", "model2"]);
    }

    #[test]
    fn resolve_maps_raw_feed_and_rejects_unknown() {
        let mut registry = DetectorRegistry::new();
        registry.register(StubDetector::new("model4")).unwrap();
        assert!(registry.resolve(RAW_FEED_NAME).unwrap().is_none());
        assert_eq!(registry.resolve("model4").unwrap().unwrap().name(), "model4");
        assert!(registry.resolve("model5").is_err());
    }

    #[test]
    fn rejects_reserved_and_duplicate_names() {
        let mut registry = DetectorRegistry::new();
        assert!(registry.register(StubDetector::new(RAW_FEED_NAME)).is_err());
        registry.register(StubDetector::new("model1")).unwrap();
        assert!(registry.register(StubDetector::new("model1")).is_err());
    }
}
