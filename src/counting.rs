//! Zone occupancy counts over the latest frame, and the periodic logger that
//! records them.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::detect::{Detection, Detector};
use crate::frame::SharedFrameBuffer;
use crate::storage::{DetectionRecord, SharedStore};
use crate::zone::{count_in_zone, detection_centers, Point, Zone, DEFAULT_OVERLAP_THRESHOLD};

/// Class index the coop models assign to chickens.
pub const DEFAULT_TARGET_CLASS: u32 = 0;

#[derive(Clone, Debug)]
pub struct CountingSettings {
    pub target_class: u32,
    pub overlap_threshold: f64,
}

impl Default for CountingSettings {
    fn default() -> Self {
        Self {
            target_class: DEFAULT_TARGET_CLASS,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
        }
    }
}

pub struct ZoneCounter {
    buffer: Arc<SharedFrameBuffer>,
    detector: Option<Arc<dyn Detector>>,
    zones: Vec<Zone>,
    settings: CountingSettings,
    store: SharedStore,
}

impl ZoneCounter {
    pub fn new(
        buffer: Arc<SharedFrameBuffer>,
        detector: Option<Arc<dyn Detector>>,
        zones: Vec<Zone>,
        settings: CountingSettings,
        store: SharedStore,
    ) -> Self {
        Self {
            buffer,
            detector,
            zones,
            settings,
            store,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, name: &str) -> Option<&Zone> {
        let name = name.to_lowercase();
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Run the detector on the latest frame.
    ///
    /// `None` when no frame has been published yet. A missing or failing
    /// detector yields an empty detection list.
    pub fn detect_latest(&self) -> Option<Vec<Detection>> {
        let frame = self.buffer.latest()?;
        let Some(detector) = &self.detector else {
            return Some(Vec::new());
        };
        match detector.detect(&frame) {
            Ok(detections) => Some(detections),
            Err(err) => {
                log::warn!(
                    "counting: detector '{}' failed on frame {}: {}",
                    detector.name(),
                    frame.sequence,
                    err
                );
                Some(Vec::new())
            }
        }
    }

    /// Count target-class detections in `zone_name` and record the result.
    ///
    /// Returns `Ok(None)` when no frame is available; nothing is recorded then.
    pub fn count_zone(&self, zone_name: &str) -> Result<Option<DetectionRecord>> {
        let zone = self
            .zone(zone_name)
            .ok_or_else(|| anyhow!("unknown zone '{}'", zone_name))?;
        let Some(detections) = self.detect_latest() else {
            return Ok(None);
        };
        self.record(zone, &detections).map(Some)
    }

    /// Centres of the target-class detections in the latest frame.
    pub fn coordinates(&self) -> Option<Vec<Point>> {
        self.detect_latest()
            .map(|detections| detection_centers(&detections, self.settings.target_class))
    }

    /// Count every zone against a single detector pass and record each.
    pub fn log_all_zones(&self) -> Result<Vec<DetectionRecord>> {
        let Some(detections) = self.detect_latest() else {
            return Ok(Vec::new());
        };
        self.zones
            .iter()
            .map(|zone| self.record(zone, &detections))
            .collect()
    }

    fn record(&self, zone: &Zone, detections: &[Detection]) -> Result<DetectionRecord> {
        let count = count_in_zone(
            detections,
            zone,
            self.settings.target_class,
            self.settings.overlap_threshold,
        );
        let count = u32::try_from(count).map_err(|_| anyhow!("zone count overflow"))?;
        let mut store = self
            .store
            .lock()
            .map_err(|_| anyhow!("detection store lock poisoned"))?;
        store.record_detection(Utc::now(), count, &zone.name)
    }
}

// ----------------------------------------------------------------------------
// Periodic logging
// ----------------------------------------------------------------------------

pub struct ZoneLogger {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ZoneLogger {
    /// Record every zone's count each `interval` until stopped.
    pub fn spawn(counter: Arc<ZoneCounter>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(anyhow!("zone log interval must be > 0"));
        }
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let join = thread::Builder::new()
            .name("coopcam-zone-log".to_string())
            .spawn(move || run_logger(&counter, interval, &stop_flag))?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("zone logger thread panicked");
            }
        }
    }
}

impl Drop for ZoneLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_logger(counter: &ZoneCounter, interval: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let mut next_run = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_run {
            thread::sleep(slice.min(next_run - now));
            continue;
        }
        next_run = now + interval;
        match counter.log_all_zones() {
            Ok(records) if records.is_empty() => {
                log::debug!("zone log: no frame available yet");
            }
            Ok(records) => {
                for record in records {
                    log::info!("zone log: {} = {}", record.location, record.count);
                }
            }
            Err(err) => log::warn!("zone log failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubDetector;
    use crate::frame::Frame;
    use crate::storage::{shared, InMemoryDetectionStore};
    use crate::zone::BoundingBox;

    fn chicken(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id: 0,
            confidence: 0.8,
            bbox: BoundingBox::new(x1, y1, x2, y2),
        }
    }

    fn zones() -> Vec<Zone> {
        vec![
            Zone::new("feeding", BoundingBox::new(60.0, 180.0, 180.0, 420.0)).unwrap(),
            Zone::new("watering", BoundingBox::new(120.0, 200.0, 320.0, 400.0)).unwrap(),
        ]
    }

    fn counter(detector: Arc<StubDetector>) -> (Arc<SharedFrameBuffer>, ZoneCounter) {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let counter = ZoneCounter::new(
            buffer.clone(),
            Some(detector as Arc<dyn Detector>),
            zones(),
            CountingSettings::default(),
            shared(InMemoryDetectionStore::new()),
        );
        (buffer, counter)
    }

    fn publish(buffer: &SharedFrameBuffer) {
        buffer
            .publish(Frame::from_rgb(vec![0; 8 * 8 * 3], 8, 8, 1).unwrap())
            .unwrap();
    }

    #[test]
    fn counts_and_records_zone() {
        let detector = Arc::new(StubDetector::new("model1").with_detections(vec![
            chicken(60.0, 180.0, 180.0, 420.0),
            chicken(0.0, 0.0, 10.0, 10.0),
        ]));
        let (buffer, counter) = counter(detector);
        publish(&buffer);

        let record = counter.count_zone("feeding").unwrap().unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.location, "feeding");

        let listed = counter.store().lock().unwrap().list_detections(None).unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[test]
    fn no_frame_records_nothing() {
        let (_buffer, counter) = counter(Arc::new(StubDetector::new("model1")));
        assert!(counter.count_zone("feeding").unwrap().is_none());
        assert!(counter.coordinates().is_none());
        assert!(counter.log_all_zones().unwrap().is_empty());
        let listed = counter.store().lock().unwrap().list_detections(None).unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn unknown_zone_is_an_error() {
        let (buffer, counter) = counter(Arc::new(StubDetector::new("model1")));
        publish(&buffer);
        assert!(counter.count_zone("roost").is_err());
        assert!(counter.zone("FEEDING").is_some());
    }

    #[test]
    fn detector_failure_counts_zero() {
        let detector = Arc::new(
            StubDetector::new("model1").with_detections(vec![chicken(60.0, 180.0, 180.0, 420.0)]),
        );
        detector.set_failing(true);
        let (buffer, counter) = counter(detector);
        publish(&buffer);
        let record = counter.count_zone("feeding").unwrap().unwrap();
        assert_eq!(record.count, 0);
    }

    #[test]
    fn coordinates_report_box_centres() {
        let detector = Arc::new(StubDetector::new("model1").with_detections(vec![
            chicken(0.0, 0.0, 10.0, 20.0),
            Detection {
                class_id: 5,
                confidence: 0.9,
                bbox: BoundingBox::new(0.0, 0.0, 4.0, 4.0),
            },
        ]));
        let (buffer, counter) = counter(detector);
        publish(&buffer);
        assert_eq!(counter.coordinates().unwrap(), vec![Point { x: 5.0, y: 10.0 }]);
    }

    #[test]
    fn log_all_zones_uses_one_detector_pass() {
        let detector = Arc::new(
            StubDetector::new("model1").with_detections(vec![chicken(130.0, 210.0, 170.0, 250.0)]),
        );
        let (buffer, counter) = counter(detector.clone());
        publish(&buffer);
        let records = counter.log_all_zones().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.count == 1));
        assert_eq!(detector.calls(), 1);
    }

    #[test]
    fn logger_records_periodically_and_stops() {
        let detector = Arc::new(StubDetector::new("model1"));
        let (buffer, counter) = counter(detector);
        publish(&buffer);
        let counter = Arc::new(counter);

        let mut logger = ZoneLogger::spawn(counter.clone(), Duration::from_millis(30)).unwrap();
        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        logger.stop();
        assert!(started.elapsed() < Duration::from_millis(500));

        let listed = counter.store().lock().unwrap().list_detections(None).unwrap();
        assert!(listed.len() >= 2);
        assert!(ZoneLogger::spawn(counter, Duration::ZERO).is_err());
    }
}
