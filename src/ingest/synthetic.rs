//! Synthetic camera (`stub://`) for tests and demos.
//!
//! Produces a diagonal gradient that shifts by one step per frame, paced to
//! the configured frame rate.

use anyhow::Result;
use image::{Rgb, RgbImage};
use std::time::{Duration, Instant};

use super::{CameraCapture, CameraConfig};

pub struct SyntheticCamera {
    config: CameraConfig,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig) -> Self {
        log::info!("camera: connected to {} (synthetic)", config.url);
        Self {
            config,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(1_000_000 / self.config.target_fps as u64)
        }
    }

    fn generate(&self) -> RgbImage {
        let shift = self.frame_count;
        RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            let v = ((x as u64 + y as u64 + shift) % 256) as u8;
            Rgb([v, v.wrapping_add(85), v.wrapping_add(170)])
        })
    }
}

impl CameraCapture for SyntheticCamera {
    fn read(&mut self) -> Result<RgbImage> {
        if let Some(last) = self.last_frame_at {
            let interval = self.frame_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(self.generate())
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.url)
    }
}
