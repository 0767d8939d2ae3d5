//! Frame types and the shared most-recent-frame buffer.
//!
//! - `Frame`: Decoded RGB pixels plus capture metadata. Immutable once built.
//! - `Rotation`: Fixed geometric correction applied at capture time.
//! - `SharedFrameBuffer`: Holds the single latest frame for one writer and any
//!   number of readers.
//!
//! The buffer stores `Arc<Frame>`, so publishing and reading only swap or clone
//! a reference under the lock. Pixel data is never copied or encoded while the
//! lock is held, and a reader can never observe a partially written frame.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::{imageops, RgbImage};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Channels per pixel for every frame (packed RGB8).
pub const CHANNELS: u8 = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded camera frame.
///
/// There is no `&mut` access to the pixels. Overlays are drawn on a copy
/// obtained through `Frame::to_image`.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Capture counter assigned by the source, strictly increasing per source.
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(CHANNELS as usize))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("failed to wrap {}x{} pixels", width, height))?;
        Ok(Self::from_image(image, sequence))
    }

    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn channels(&self) -> u8 {
        CHANNELS
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Owned copy of the pixels, for drawing overlays.
    pub fn to_image(&self) -> RgbImage {
        self.image.clone()
    }

    /// Apply a rotation, keeping the capture metadata.
    pub fn rotated(self, rotation: Rotation) -> Self {
        if rotation == Rotation::None {
            return self;
        }
        Self {
            image: rotation.apply(&self.image),
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }
}

// ----------------------------------------------------------------------------
// Rotation
// ----------------------------------------------------------------------------

/// Clockwise rotation in multiples of 90 degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Half,
    Clockwise270,
}

impl Rotation {
    /// Parse clockwise degrees. Negative values rotate counter-clockwise.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        if degrees % 90 != 0 {
            return Err(anyhow!(
                "rotation must be a multiple of 90 degrees, got {}",
                degrees
            ));
        }
        Ok(match degrees.rem_euclid(360) {
            0 => Rotation::None,
            90 => Rotation::Clockwise90,
            180 => Rotation::Half,
            _ => Rotation::Clockwise270,
        })
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Clockwise90 => 90,
            Rotation::Half => 180,
            Rotation::Clockwise270 => 270,
        }
    }

    pub fn apply(self, image: &RgbImage) -> RgbImage {
        match self {
            Rotation::None => image.clone(),
            Rotation::Clockwise90 => imageops::rotate90(image),
            Rotation::Half => imageops::rotate180(image),
            Rotation::Clockwise270 => imageops::rotate270(image),
        }
    }
}

// ----------------------------------------------------------------------------
// SharedFrameBuffer
// ----------------------------------------------------------------------------

/// Outcome of waiting for a newer frame.
#[derive(Clone, Debug)]
pub enum WaitOutcome {
    /// A frame newer than the caller's generation is available.
    Frame { generation: u64, frame: Arc<Frame> },
    /// Nothing newer arrived before the timeout.
    Timeout,
    /// The buffer was closed; no further frames will be published.
    Closed,
}

#[derive(Default)]
struct BufferState {
    latest: Option<Arc<Frame>>,
    /// Incremented on every publish. 0 means nothing published yet.
    generation: u64,
    closed: bool,
}

/// Single-slot buffer holding the most recently published frame.
#[derive(Default)]
pub struct SharedFrameBuffer {
    state: Mutex<BufferState>,
    published: Condvar,
}

impl SharedFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame and wake waiting readers. Returns the new generation.
    pub fn publish(&self, frame: Frame) -> Result<u64> {
        let frame = Arc::new(frame);
        let generation = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("frame buffer lock poisoned"))?;
            if state.closed {
                return Err(anyhow!("frame buffer closed"));
            }
            state.latest = Some(frame);
            state.generation += 1;
            state.generation
        };
        self.published.notify_all();
        Ok(generation)
    }

    /// Most recently published frame, or `None` if nothing has been published.
    ///
    /// Never waits for a new frame.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.snapshot().map(|(_, frame)| frame)
    }

    /// Latest frame together with its publish generation.
    pub fn snapshot(&self) -> Option<(u64, Arc<Frame>)> {
        let state = self.state.lock().ok()?;
        state
            .latest
            .as_ref()
            .map(|frame| (state.generation, frame.clone()))
    }

    /// Number of publishes so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().map(|state| state.generation).unwrap_or(0)
    }

    /// Whether a frame is currently readable through `latest()`.
    pub fn has_frame(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.latest.is_some())
            .unwrap_or(false)
    }

    /// Block until a frame newer than `seen` is published, the timeout elapses,
    /// or the buffer is closed.
    pub fn wait_newer(&self, seen: u64, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return WaitOutcome::Closed;
        };
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if state.generation > seen {
                if let Some(frame) = state.latest.as_ref() {
                    return WaitOutcome::Frame {
                        generation: state.generation,
                        frame: frame.clone(),
                    };
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::Timeout;
            }
            state = match self.published.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return WaitOutcome::Closed,
            };
        }
    }

    /// Tear the buffer down. Waiting readers return `Closed`; later publishes fail.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.latest = None;
        }
        self.published.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|state| state.closed).unwrap_or(true)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn solid_frame(value: u8, width: u32, height: u32, sequence: u64) -> Frame {
        let pixels = vec![value; (width * height * 3) as usize];
        Frame::from_rgb(pixels, width, height, sequence).unwrap()
    }

    #[test]
    fn from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0u8; 10], 4, 4, 0).is_err());
    }

    #[test]
    fn latest_is_none_before_first_publish() {
        let buffer = SharedFrameBuffer::new();
        assert!(buffer.latest().is_none());
        assert!(!buffer.has_frame());
    }

    #[test]
    fn latest_returns_last_published_until_next_publish() {
        let buffer = SharedFrameBuffer::new();
        buffer.publish(solid_frame(7, 4, 2, 1)).unwrap();

        for _ in 0..3 {
            let latest = buffer.latest().unwrap();
            assert_eq!(latest.sequence, 1);
            assert!(latest.pixels().iter().all(|&p| p == 7));
        }

        buffer.publish(solid_frame(9, 4, 2, 2)).unwrap();
        let latest = buffer.latest().unwrap();
        assert_eq!(latest.sequence, 2);
        assert!(latest.pixels().iter().all(|&p| p == 9));
        assert_eq!(buffer.generation(), 2);
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let frame = solid_frame(1, 8, 4, 0);
        let rotated = frame.clone().rotated(Rotation::Clockwise90);
        assert_eq!((rotated.width(), rotated.height()), (4, 8));
        let half = frame.rotated(Rotation::Half);
        assert_eq!((half.width(), half.height()), (8, 4));
    }

    #[test]
    fn rotation_moves_top_left_pixel_to_top_right() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let rotated = Rotation::Clockwise90.apply(&image);
        assert_eq!(rotated.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn rotation_parses_degrees() {
        assert_eq!(Rotation::from_degrees(0).unwrap(), Rotation::None);
        assert_eq!(Rotation::from_degrees(90).unwrap(), Rotation::Clockwise90);
        assert_eq!(Rotation::from_degrees(-90).unwrap(), Rotation::Clockwise270);
        assert_eq!(Rotation::from_degrees(540).unwrap(), Rotation::Half);
        assert!(Rotation::from_degrees(45).is_err());
    }

    #[test]
    fn wait_newer_wakes_on_publish() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let writer = buffer.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.publish(solid_frame(3, 2, 2, 5)).unwrap();
        });

        match buffer.wait_newer(0, Duration::from_secs(5)) {
            WaitOutcome::Frame { generation, frame } => {
                assert_eq!(generation, 1);
                assert_eq!(frame.sequence, 5);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        handle.join().unwrap();
    }

    #[test]
    fn wait_newer_times_out_without_publish() {
        let buffer = SharedFrameBuffer::new();
        buffer.publish(solid_frame(3, 2, 2, 1)).unwrap();
        assert!(matches!(
            buffer.wait_newer(1, Duration::from_millis(10)),
            WaitOutcome::Timeout
        ));
    }

    #[test]
    fn close_releases_waiters_and_rejects_publish() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let closer = buffer.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert!(matches!(
            buffer.wait_newer(0, Duration::from_secs(5)),
            WaitOutcome::Closed
        ));
        handle.join().unwrap();
        assert!(buffer.publish(solid_frame(1, 2, 2, 1)).is_err());
        assert!(buffer.latest().is_none());
    }

    #[test]
    fn close_drops_the_stored_frame() -> Result<()> {
        let buffer = SharedFrameBuffer::new();
        buffer.publish(solid_frame(7, 2, 2, 1))?;
        assert!(buffer.has_frame());

        buffer.close();
        assert!(!buffer.has_frame());
        assert!(buffer.latest().is_none());
        assert_eq!(buffer.generation(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_readers_never_see_torn_frames() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let writer = buffer.clone();
        let writer_handle = thread::spawn(move || {
            for i in 0..200u64 {
                writer.publish(solid_frame((i % 256) as u8, 32, 32, i)).unwrap();
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader = buffer.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(frame) = reader.latest() {
                            let first = frame.pixels()[0];
                            assert!(frame.pixels().iter().all(|&p| p == first));
                            assert_eq!(first as u64, frame.sequence % 256);
                        }
                    }
                })
            })
            .collect();

        writer_handle.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(buffer.latest().unwrap().sequence, 199);
    }
}
