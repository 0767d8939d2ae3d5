//! Camera capture backends.
//!
//! The capture layer turns a camera URL into decoded RGB images:
//! - `stub://<name>`: synthetic moving pattern (tests, demos)
//! - any URL ffmpeg can open, e.g. `tcp://host:port` or `rtsp://...`
//!   (feature: camera-ffmpeg)
//! - `tcp://host:port` and `rtsp://...` through GStreamer (feature: rtsp-gstreamer)
//!
//! Backends only decode. Rotation, sequencing and publishing happen in
//! `FrameSource`, which is the only owner of an open capture handle.
//! Dropping a capture releases the camera connection.

#[cfg(feature = "camera-ffmpeg")]
mod ffmpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod gst;
pub mod synthetic;

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Duration;

use crate::frame::Rotation;

pub use synthetic::SyntheticCamera;

/// Configuration for the camera connection.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Camera endpoint, `scheme://host:port[/path]`.
    pub url: String,
    /// Correction applied to every captured frame.
    pub rotation: Rotation,
    /// Decoder-side queue depth. Kept at 1 so reads always return the newest frame.
    pub buffer_depth: u32,
    /// Pause between releasing a failed connection and reopening it.
    pub reconnect_backoff: Duration,
    /// Expected source frame rate; paces synthetic sources and sizes read timeouts.
    pub target_fps: u32,
    /// Frame width (for synthetic frames).
    pub width: u32,
    /// Frame height (for synthetic frames).
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "tcp://192.168.1.46:8554".to_string(),
            rotation: Rotation::Clockwise90,
            buffer_depth: 1,
            reconnect_backoff: Duration::from_secs(1),
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

impl CameraConfig {
    /// Upper bound on how long a single read may block.
    pub fn read_timeout(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            500
        } else {
            (1000 / self.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }
}

/// An open camera connection.
pub trait CameraCapture: Send {
    /// Block for the next decoded frame. An `Err` means the connection is
    /// no longer usable and should be released.
    fn read(&mut self) -> Result<RgbImage>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Split `scheme://rest` into its parts.
pub fn parse_camera_url(url: &str) -> Result<(&str, &str)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow!("camera url '{}' must look like scheme://host:port", url))?;
    if scheme.is_empty() || rest.is_empty() {
        return Err(anyhow!(
            "camera url '{}' must look like scheme://host:port",
            url
        ));
    }
    Ok((scheme, rest))
}

/// Check that `url` is well formed and that this build can open its scheme.
pub fn check_camera_url(url: &str) -> Result<()> {
    let (scheme, _) = parse_camera_url(url)?;
    if scheme == "stub" || cfg!(feature = "camera-ffmpeg") {
        return Ok(());
    }
    if cfg!(feature = "rtsp-gstreamer") {
        return match scheme {
            "rtsp" | "tcp" => Ok(()),
            other => Err(anyhow!(
                "camera url '{}': gstreamer capture supports rtsp:// and tcp://, got {}://",
                url,
                other
            )),
        };
    }
    Err(anyhow!(
        "camera url '{}' requires the camera-ffmpeg or rtsp-gstreamer feature",
        url
    ))
}

/// Open a capture for the configured URL.
pub fn open_camera(config: &CameraConfig) -> Result<Box<dyn CameraCapture>> {
    check_camera_url(&config.url)?;
    let (scheme, _) = parse_camera_url(&config.url)?;
    if scheme == "stub" {
        return Ok(Box::new(SyntheticCamera::new(config.clone())));
    }

    #[cfg(feature = "camera-ffmpeg")]
    {
        Ok(Box::new(ffmpeg::FfmpegCamera::open(config.clone())?))
    }
    #[cfg(all(feature = "rtsp-gstreamer", not(feature = "camera-ffmpeg")))]
    {
        Ok(Box::new(gst::GstreamerCamera::open(config.clone())?))
    }
    #[cfg(not(any(feature = "camera-ffmpeg", feature = "rtsp-gstreamer")))]
    {
        Err(anyhow!(
            "camera url '{}' requires the camera-ffmpeg or rtsp-gstreamer feature",
            config.url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camera_urls() {
        assert_eq!(
            parse_camera_url("tcp://192.168.1.46:8554").unwrap(),
            ("tcp", "192.168.1.46:8554")
        );
        assert!(parse_camera_url("192.168.1.46:8554").is_err());
        assert!(parse_camera_url("tcp://").is_err());
    }

    #[test]
    fn opens_stub_camera() -> Result<()> {
        let config = CameraConfig {
            url: "stub://coop".to_string(),
            width: 32,
            height: 16,
            target_fps: 1000,
            ..CameraConfig::default()
        };
        let mut camera = open_camera(&config)?;
        let image = camera.read()?;
        assert_eq!((image.width(), image.height()), (32, 16));
        assert!(camera.describe().contains("stub://coop"));
        Ok(())
    }

    #[test]
    fn checks_camera_url_before_opening() {
        assert!(check_camera_url("stub://coop").is_ok());
        assert!(check_camera_url("192.168.1.46:8554").is_err());
        assert!(check_camera_url("://coop").is_err());

        let config = CameraConfig {
            url: "192.168.1.46:8554".to_string(),
            ..CameraConfig::default()
        };
        assert!(open_camera(&config).is_err());
    }

    #[cfg(not(any(feature = "camera-ffmpeg", feature = "rtsp-gstreamer")))]
    #[test]
    fn network_urls_need_a_capture_backend() {
        let err = check_camera_url("tcp://192.168.1.46:8554").unwrap_err();
        assert!(err.to_string().contains("camera-ffmpeg"));
    }

    #[test]
    fn read_timeout_has_floor() {
        let config = CameraConfig {
            target_fps: 30,
            ..CameraConfig::default()
        };
        assert_eq!(config.read_timeout(), Duration::from_millis(500));
        let slow = CameraConfig {
            target_fps: 1,
            ..CameraConfig::default()
        };
        assert_eq!(slow.read_timeout(), Duration::from_millis(4000));
    }
}
