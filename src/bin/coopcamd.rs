//! coopcamd - coop camera daemon
//!
//! This daemon:
//! 1. Keeps the newest camera frame in memory, reconnecting as needed
//! 2. Serves raw and annotated MJPEG streams to any number of clients
//! 3. Answers zone count requests and logs counts periodically
//! 4. Serves the detection log to the dashboard

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use coopcam::{
    api::{ApiConfig, ApiServer, ApiState},
    config::{ConfigOverrides, CoopcamConfig},
    storage, DetectorRegistry, FrameSource, SharedFrameBuffer, SqliteDetectionStore,
    StreamMultiplexer, ZoneCounter, ZoneLogger,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a TOML or JSON config file.
    #[arg(long, env = "COOPCAM_CONFIG")]
    config: Option<PathBuf>,
    /// Address the HTTP API binds to.
    #[arg(long, env = "COOPCAM_API_ADDR")]
    addr: Option<String>,
    /// Camera URL (tcp://, rtsp:// or stub://).
    #[arg(long, env = "COOPCAM_CAMERA_URL")]
    camera_url: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let overrides = ConfigOverrides {
        api_addr: args.addr,
        camera_url: args.camera_url,
    };
    let cfg = CoopcamConfig::load_with(args.config.as_deref(), &overrides)?;

    let store = storage::shared(SqliteDetectionStore::open(&cfg.db_path)?);
    let detectors = build_detectors(&cfg)?;

    let buffer = Arc::new(SharedFrameBuffer::new());
    let mut source = FrameSource::new(cfg.camera.clone(), buffer.clone());
    source.start()?;

    let counter = Arc::new(ZoneCounter::new(
        buffer.clone(),
        detectors.default_detector(),
        cfg.zones.clone(),
        cfg.counting.settings.clone(),
        store,
    ));
    let mut zone_logger = if cfg.counting.log_interval.is_zero() {
        log::info!("periodic zone logging disabled");
        None
    } else {
        Some(ZoneLogger::spawn(counter.clone(), cfg.counting.log_interval)?)
    };

    let state = ApiState {
        multiplexer: StreamMultiplexer::new(buffer.clone(), cfg.stream.clone()),
        detectors,
        counter,
        source: Some(source.monitor()),
    };
    let api_handle = ApiServer::new(
        ApiConfig {
            addr: cfg.api_addr.clone(),
        },
        state,
    )
    .spawn()?;

    log::info!("coopcamd running. writing to {}", cfg.db_path);
    log::info!(
        "camera={} zones={} log_interval={:?}",
        cfg.camera.url,
        cfg.zones
            .iter()
            .map(|z| z.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
        cfg.counting.log_interval
    );

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    api_handle.stop()?;
    if let Some(logger) = zone_logger.as_mut() {
        logger.stop();
    }
    // Closing the buffer ends open streams and the capture loop.
    buffer.close();
    source.stop()?;
    Ok(())
}

fn build_detectors(cfg: &CoopcamConfig) -> Result<DetectorRegistry> {
    let mut registry = DetectorRegistry::new();
    for settings in &cfg.detectors {
        #[cfg(feature = "detector-http")]
        {
            let detector =
                coopcam::HttpDetector::new(&settings.name, &settings.url, settings.timeout)?;
            log::info!("detector '{}' -> {}", settings.name, settings.url);
            registry.register(detector)?;
        }
        #[cfg(not(feature = "detector-http"))]
        log::warn!(
            "detector '{}' skipped: built without the detector-http feature",
            settings.name
        );
    }
    if let Some(name) = &cfg.counting.detector {
        registry.set_default(name)?;
    }
    if registry.is_empty() {
        log::warn!("no detectors configured; streams are unannotated and counts are 0");
    }
    Ok(registry)
}
