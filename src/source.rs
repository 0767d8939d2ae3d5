//! Continuous frame acquisition.
//!
//! `FrameSource` owns the camera connection and runs one background thread
//! that reads, rotates and publishes frames into a `SharedFrameBuffer`.
//!
//! State machine: `Stopped -> Running -> (Reconnecting -> Running)* -> Stopped`.
//! A failed open or read releases the handle, waits the configured backoff and
//! reopens. Camera faults never end the loop; only `stop()` does (or the
//! buffer being closed underneath it).

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Frame, SharedFrameBuffer};
use crate::ingest::{open_camera, CameraCapture, CameraConfig};

const STOP_POLL_SLICE: Duration = Duration::from_millis(50);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Opens a camera connection for a config. Swappable for tests.
pub type CameraOpener =
    Box<dyn FnMut(&CameraConfig) -> Result<Box<dyn CameraCapture>> + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    Running,
    Reconnecting,
}

impl SourceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SourceState::Running,
            2 => SourceState::Reconnecting,
            _ => SourceState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SourceState::Stopped => 0,
            SourceState::Running => 1,
            SourceState::Reconnecting => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceState::Stopped => "stopped",
            SourceState::Running => "running",
            SourceState::Reconnecting => "reconnecting",
        }
    }
}

/// Counters for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub state: SourceState,
    pub frames_captured: u64,
    pub read_failures: u64,
    pub reconnects: u64,
    pub health_reports: u64,
    pub url: String,
}

#[derive(Default)]
struct SourceStatus {
    state: AtomicU8,
    frames_captured: AtomicU64,
    read_failures: AtomicU64,
    reconnects: AtomicU64,
    health_reports: AtomicU64,
}

impl SourceStatus {
    fn set_state(&self, state: SourceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Background camera reader feeding a shared frame buffer.
pub struct FrameSource {
    config: CameraConfig,
    buffer: Arc<SharedFrameBuffer>,
    opener: Option<CameraOpener>,
    status: Arc<SourceStatus>,
    stop: Arc<AtomicBool>,
    health_interval: Duration,
    join: Option<JoinHandle<CameraOpener>>,
}

impl FrameSource {
    /// Source that opens cameras with `ingest::open_camera`.
    pub fn new(config: CameraConfig, buffer: Arc<SharedFrameBuffer>) -> Self {
        Self::with_opener(config, buffer, Box::new(open_camera))
    }

    pub fn with_opener(
        config: CameraConfig,
        buffer: Arc<SharedFrameBuffer>,
        opener: CameraOpener,
    ) -> Self {
        Self {
            config,
            buffer,
            opener: Some(opener),
            status: Arc::new(SourceStatus::default()),
            stop: Arc::new(AtomicBool::new(false)),
            health_interval: HEALTH_LOG_INTERVAL,
            join: None,
        }
    }

    /// Override how often the capture thread logs a health line.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Spawn the acquisition thread.
    pub fn start(&mut self) -> Result<()> {
        if self.join.is_some() {
            return Err(anyhow!("frame source already running"));
        }
        let opener = self
            .opener
            .take()
            .ok_or_else(|| anyhow!("frame source has no camera opener"))?;

        self.stop.store(false, Ordering::SeqCst);
        self.status.set_state(SourceState::Running);

        let acquisition = Acquisition {
            config: self.config.clone(),
            buffer: self.buffer.clone(),
            status: self.status.clone(),
            stop: self.stop.clone(),
            health_interval: self.health_interval,
            opener,
        };
        let join = std::thread::Builder::new()
            .name("coopcam-capture".into())
            .spawn(move || acquisition.run())
            .map_err(|err| anyhow!("failed to spawn capture thread: {}", err))?;
        self.join = Some(join);
        log::info!(
            "frame source started for {} (rotation {}°, buffer depth {})",
            self.config.url,
            self.config.rotation.degrees(),
            self.config.buffer_depth
        );
        Ok(())
    }

    /// Signal the loop to exit and wait for it. The camera handle is released.
    pub fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let opener = join
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
            self.opener = Some(opener);
            log::info!("frame source stopped for {}", self.config.url);
        }
        self.status.set_state(SourceState::Stopped);
        Ok(())
    }

    pub fn state(&self) -> SourceState {
        self.status.state()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == SourceState::Running
    }

    pub fn stats(&self) -> SourceStats {
        self.monitor().stats()
    }

    /// Read-only view of this source's status for other threads.
    pub fn monitor(&self) -> SourceMonitor {
        SourceMonitor {
            status: self.status.clone(),
            url: self.config.url.clone(),
        }
    }

    pub fn buffer(&self) -> &Arc<SharedFrameBuffer> {
        &self.buffer
    }
}

#[derive(Clone)]
pub struct SourceMonitor {
    status: Arc<SourceStatus>,
    url: String,
}

impl SourceMonitor {
    pub fn state(&self) -> SourceState {
        self.status.state()
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            state: self.status.state(),
            frames_captured: self.status.frames_captured.load(Ordering::SeqCst),
            read_failures: self.status.read_failures.load(Ordering::SeqCst),
            reconnects: self.status.reconnects.load(Ordering::SeqCst),
            health_reports: self.status.health_reports.load(Ordering::SeqCst),
            url: self.url.clone(),
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("frame source shutdown failed: {}", err);
        }
    }
}

struct Acquisition {
    config: CameraConfig,
    buffer: Arc<SharedFrameBuffer>,
    status: Arc<SourceStatus>,
    stop: Arc<AtomicBool>,
    health_interval: Duration,
    opener: CameraOpener,
}

impl Acquisition {
    fn run(mut self) -> CameraOpener {
        let mut camera: Option<Box<dyn CameraCapture>> = None;
        let mut sequence = 0u64;
        let mut last_health_log = Instant::now();

        while !self.stopping() {
            if last_health_log.elapsed() >= self.health_interval {
                self.log_health();
                last_health_log = Instant::now();
            }

            if camera.is_none() {
                match (self.opener)(&self.config) {
                    Ok(opened) => {
                        log::info!("camera: opened {}", opened.describe());
                        self.status.set_state(SourceState::Running);
                        camera = Some(opened);
                    }
                    Err(err) => {
                        log::warn!(
                            "camera: open {} failed: {}; retrying in {:?}",
                            self.config.url,
                            err,
                            self.config.reconnect_backoff
                        );
                        self.status.set_state(SourceState::Reconnecting);
                        self.backoff();
                        self.status.reconnects.fetch_add(1, Ordering::SeqCst);
                    }
                }
                continue;
            }
            let Some(capture) = camera.as_mut() else {
                continue;
            };

            match capture.read() {
                Ok(image) => {
                    sequence += 1;
                    let frame = Frame::from_image(image, sequence).rotated(self.config.rotation);
                    if let Err(err) = self.buffer.publish(frame) {
                        if self.buffer.is_closed() {
                            log::info!("camera: frame buffer closed, stopping capture");
                            break;
                        }
                        log::warn!("camera: publish failed: {}", err);
                        continue;
                    }
                    self.status.frames_captured.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    log::warn!(
                        "camera: frame not received from {}: {}; reconnecting in {:?}",
                        self.config.url,
                        err,
                        self.config.reconnect_backoff
                    );
                    self.status.read_failures.fetch_add(1, Ordering::SeqCst);
                    self.status.set_state(SourceState::Reconnecting);
                    // Release before waiting so the camera sees the disconnect.
                    camera = None;
                    self.backoff();
                    self.status.reconnects.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        drop(camera);
        self.status.set_state(SourceState::Stopped);
        self.opener
    }

    fn log_health(&self) {
        log::info!(
            "camera health={} frames={} reconnects={} url={}",
            self.status.state().as_str(),
            self.status.frames_captured.load(Ordering::SeqCst),
            self.status.reconnects.load(Ordering::SeqCst),
            self.config.url
        );
        self.status.health_reports.fetch_add(1, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep the reconnect backoff in short slices so `stop()` stays responsive.
    fn backoff(&self) {
        let deadline = Instant::now() + self.config.reconnect_backoff;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rotation;
    use image::RgbImage;

    /// Camera whose reads and opens fail while `available` is false.
    struct FlakyCamera {
        available: Arc<AtomicBool>,
    }

    impl CameraCapture for FlakyCamera {
        fn read(&mut self) -> Result<RgbImage> {
            std::thread::sleep(Duration::from_millis(2));
            if !self.available.load(Ordering::SeqCst) {
                return Err(anyhow!("simulated read failure"));
            }
            Ok(RgbImage::new(8, 4))
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn flaky_opener(available: Arc<AtomicBool>, opens: Arc<AtomicU64>) -> CameraOpener {
        Box::new(move |_config: &CameraConfig| {
            opens.fetch_add(1, Ordering::SeqCst);
            if !available.load(Ordering::SeqCst) {
                return Err(anyhow!("simulated connect failure"));
            }
            Ok(Box::new(FlakyCamera {
                available: available.clone(),
            }) as Box<dyn CameraCapture>)
        })
    }

    fn test_config() -> CameraConfig {
        CameraConfig {
            url: "tcp://127.0.0.1:8554".to_string(),
            rotation: Rotation::Clockwise90,
            reconnect_backoff: Duration::from_millis(20),
            ..CameraConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn publishes_rotated_frames() -> Result<()> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let available = Arc::new(AtomicBool::new(true));
        let mut source = FrameSource::with_opener(
            test_config(),
            buffer.clone(),
            flaky_opener(available, Arc::new(AtomicU64::new(0))),
        );
        source.start()?;

        assert!(wait_until(Duration::from_secs(5), || buffer.has_frame()));
        let frame = buffer.latest().unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 8));
        assert_eq!(source.state(), SourceState::Running);

        source.stop()?;
        assert_eq!(source.state(), SourceState::Stopped);
        Ok(())
    }

    #[test]
    fn reconnects_after_read_failure() -> Result<()> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let available = Arc::new(AtomicBool::new(true));
        let opens = Arc::new(AtomicU64::new(0));
        let mut source = FrameSource::with_opener(
            test_config(),
            buffer.clone(),
            flaky_opener(available.clone(), opens.clone()),
        );
        source.start()?;
        assert!(wait_until(Duration::from_secs(5), || buffer.has_frame()));

        available.store(false, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || {
            source.state() == SourceState::Reconnecting
        }));
        let before = buffer.latest().unwrap().sequence;

        available.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(5), || {
            buffer.latest().map(|f| f.sequence).unwrap_or(0) > before
        }));

        let stats = source.monitor().stats();
        assert!(stats.read_failures >= 1);
        assert!(stats.reconnects >= 1);
        assert!(opens.load(Ordering::SeqCst) >= 2);
        source.stop()?;
        Ok(())
    }

    #[test]
    fn keeps_retrying_when_camera_never_opens() -> Result<()> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let available = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(AtomicU64::new(0));
        let mut source = FrameSource::with_opener(
            test_config(),
            buffer.clone(),
            flaky_opener(available, opens.clone()),
        );
        source.start()?;
        assert!(wait_until(Duration::from_secs(5), || {
            opens.load(Ordering::SeqCst) >= 3
        }));
        assert!(!buffer.has_frame());
        assert_eq!(source.state(), SourceState::Reconnecting);

        let stop_started = Instant::now();
        source.stop()?;
        assert!(stop_started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn logs_health_while_camera_never_opens() -> Result<()> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mut source = FrameSource::with_opener(
            test_config(),
            buffer,
            flaky_opener(Arc::new(AtomicBool::new(false)), Arc::new(AtomicU64::new(0))),
        )
        .with_health_interval(Duration::from_millis(10));
        source.start()?;
        assert!(wait_until(Duration::from_secs(5), || {
            source.stats().health_reports >= 2
        }));
        assert_eq!(source.stats().frames_captured, 0);
        source.stop()?;
        Ok(())
    }

    #[test]
    fn can_restart_after_stop() -> Result<()> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let available = Arc::new(AtomicBool::new(true));
        let mut source = FrameSource::with_opener(
            test_config(),
            buffer.clone(),
            flaky_opener(available, Arc::new(AtomicU64::new(0))),
        );
        source.start()?;
        assert!(source.start().is_err());
        source.stop()?;
        source.start()?;
        assert!(wait_until(Duration::from_secs(5), || buffer.has_frame()));
        source.stop()?;
        Ok(())
    }

    #[test]
    fn exits_when_buffer_is_closed() -> Result<()> {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let available = Arc::new(AtomicBool::new(true));
        let mut source = FrameSource::with_opener(
            test_config(),
            buffer.clone(),
            flaky_opener(available, Arc::new(AtomicU64::new(0))),
        );
        source.start()?;
        assert!(wait_until(Duration::from_secs(5), || buffer.has_frame()));
        buffer.close();
        assert!(wait_until(Duration::from_secs(5), || {
            source.state() == SourceState::Stopped
        }));
        source.stop()?;
        Ok(())
    }
}
