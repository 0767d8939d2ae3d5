use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::counting::{CountingSettings, DEFAULT_TARGET_CLASS};
use crate::detect::RAW_FEED_NAME;
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::frame::Rotation;
use crate::ingest::{check_camera_url, CameraConfig};
use crate::stream::StreamSettings;
use crate::zone::{BoundingBox, Zone, DEFAULT_OVERLAP_THRESHOLD};

const DEFAULT_DB_PATH: &str = "db/detections.db";
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_CAMERA_URL: &str = "tcp://192.168.1.46:8554";
const DEFAULT_ROTATION_DEGREES: i32 = 90;
const DEFAULT_BUFFER_DEPTH: u32 = 1;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1000;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_LOG_INTERVAL_SECS: u64 = 60;
const DEFAULT_DETECTOR_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
struct CoopcamConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    stream: Option<StreamConfigFile>,
    counting: Option<CountingConfigFile>,
    zones: Option<Vec<ZoneConfigFile>>,
    detectors: Option<Vec<DetectorConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    rotation: Option<i32>,
    buffer_depth: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct CountingConfigFile {
    target_class: Option<u32>,
    threshold: Option<f64>,
    log_interval_secs: Option<u64>,
    detector: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ZoneConfigFile {
    name: String,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

#[derive(Debug, Deserialize)]
struct DetectorConfigFile {
    name: String,
    url: String,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CoopcamConfig {
    pub db_path: String,
    pub api_addr: String,
    pub camera: CameraConfig,
    pub stream: StreamSettings,
    pub counting: CountingConfig,
    pub zones: Vec<Zone>,
    pub detectors: Vec<DetectorSettings>,
}

#[derive(Debug, Clone)]
pub struct CountingConfig {
    pub settings: CountingSettings,
    /// Zero disables periodic logging.
    pub log_interval: Duration,
    /// Detector used for counts; the first configured detector when unset.
    pub detector: Option<String>,
}

/// Command-line values that win over both the file and the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_addr: Option<String>,
    pub camera_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub name: String,
    pub url: String,
    pub timeout: Duration,
}

impl CoopcamConfig {
    /// Load from `COOPCAM_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("COOPCAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, &ConfigOverrides::default())
    }

    /// Like `load_from`, with `overrides` applied after the environment and
    /// before validation.
    pub fn load_with(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CoopcamConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        if let Some(addr) = &overrides.api_addr {
            cfg.api_addr = addr.clone();
        }
        if let Some(url) = &overrides.camera_url {
            cfg.camera.url = url.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CoopcamConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraConfig {
            url: camera_file
                .url
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            rotation: Rotation::from_degrees(
                camera_file.rotation.unwrap_or(DEFAULT_ROTATION_DEGREES),
            )?,
            buffer_depth: camera_file.buffer_depth.unwrap_or(DEFAULT_BUFFER_DEPTH),
            reconnect_backoff: Duration::from_millis(
                camera_file
                    .reconnect_backoff_ms
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
            ),
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
            width: camera_file.width.unwrap_or(DEFAULT_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_HEIGHT),
        };

        let stream = StreamSettings {
            jpeg_quality: file
                .stream
                .and_then(|stream| stream.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
            ..StreamSettings::default()
        };

        let counting_file = file.counting.unwrap_or_default();
        let counting = CountingConfig {
            settings: CountingSettings {
                target_class: counting_file.target_class.unwrap_or(DEFAULT_TARGET_CLASS),
                overlap_threshold: counting_file
                    .threshold
                    .unwrap_or(DEFAULT_OVERLAP_THRESHOLD),
            },
            log_interval: Duration::from_secs(
                counting_file
                    .log_interval_secs
                    .unwrap_or(DEFAULT_LOG_INTERVAL_SECS),
            ),
            detector: counting_file.detector,
        };

        let zones = match file.zones {
            Some(zones) => zones
                .into_iter()
                .map(|z| Zone::new(&z.name, BoundingBox::new(z.x1, z.y1, z.x2, z.y2)))
                .collect::<Result<Vec<_>>>()?,
            None => default_zones()?,
        };

        let detectors = file
            .detectors
            .unwrap_or_default()
            .into_iter()
            .map(|d| DetectorSettings {
                name: d.name,
                url: d.url,
                timeout: Duration::from_millis(
                    d.timeout_ms.unwrap_or(DEFAULT_DETECTOR_TIMEOUT_MS),
                ),
            })
            .collect();

        Ok(Self {
            db_path,
            api_addr,
            camera,
            stream,
            counting,
            zones,
            detectors,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("COOPCAM_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("COOPCAM_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(url) = std::env::var("COOPCAM_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(rotation) = std::env::var("COOPCAM_ROTATION") {
            let degrees: i32 = rotation
                .trim()
                .parse()
                .map_err(|_| anyhow!("COOPCAM_ROTATION must be an integer number of degrees"))?;
            self.camera.rotation = Rotation::from_degrees(degrees)?;
        }
        if let Ok(interval) = std::env::var("COOPCAM_LOG_INTERVAL_SECS") {
            let seconds: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("COOPCAM_LOG_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.counting.log_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.url.trim().is_empty() {
            return Err(anyhow!("camera url must not be empty"));
        }
        check_camera_url(&self.camera.url)?;
        if self.camera.buffer_depth != 1 {
            return Err(anyhow!(
                "camera buffer_depth must be 1 (got {})",
                self.camera.buffer_depth
            ));
        }
        if self.camera.reconnect_backoff.is_zero() {
            return Err(anyhow!("camera reconnect_backoff_ms must be greater than zero"));
        }
        if self.camera.target_fps == 0 {
            return Err(anyhow!("camera target_fps must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("stream jpeg_quality must be within 1..=100"));
        }

        let threshold = self.counting.settings.overlap_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!("counting threshold must be within (0, 1]"));
        }

        let mut zone_names = HashSet::new();
        for zone in &self.zones {
            if !zone_names.insert(zone.name.as_str()) {
                return Err(anyhow!("duplicate zone '{}'", zone.name));
            }
        }

        let mut detector_names = HashSet::new();
        for detector in &self.detectors {
            if detector.name.trim().is_empty() {
                return Err(anyhow!("detector name must not be empty"));
            }
            if detector.name == RAW_FEED_NAME {
                return Err(anyhow!("detector name '{}' is reserved", RAW_FEED_NAME));
            }
            if !detector_names.insert(detector.name.as_str()) {
                return Err(anyhow!("duplicate detector '{}'", detector.name));
            }
            if detector.timeout.is_zero() {
                return Err(anyhow!("detector '{}' timeout must be > 0", detector.name));
            }
        }
        if let Some(name) = &self.counting.detector {
            if !detector_names.contains(name.as_str()) {
                return Err(anyhow!("counting detector '{}' is not configured", name));
            }
        }
        Ok(())
    }
}

pub fn default_zones() -> Result<Vec<Zone>> {
    Ok(vec![
        Zone::new("feeding", BoundingBox::new(60.0, 180.0, 180.0, 420.0))?,
        Zone::new("watering", BoundingBox::new(120.0, 200.0, 320.0, 400.0))?,
    ])
}

fn read_config_file(path: &Path) -> Result<CoopcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
