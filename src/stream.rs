//! On-demand multiplexing of the shared frame buffer into encoded streams.
//!
//! Each `FrameStream` is an infinite, pull-based iterator of multipart parts.
//! Streams only read the buffer, so any number can run side by side, each on
//! its consumer's own thread and at its consumer's own pace. A detector call
//! blocks only the stream that made it.

use anyhow::Result;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;

use crate::annotate::annotate_frame;
use crate::detect::Detector;
use crate::encode::{encode_jpeg, multipart_part, DEFAULT_JPEG_QUALITY};
use crate::frame::{SharedFrameBuffer, WaitOutcome};

/// Image encoder used by streams.
pub type EncodeFn = Arc<dyn Fn(&RgbImage) -> Result<Vec<u8>> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub jpeg_quality: u8,
    /// How long a stream waits for a new frame before checking again.
    pub poll_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            poll_interval: Duration::from_millis(40),
        }
    }
}

/// Factory for independent frame streams over one buffer.
#[derive(Clone)]
pub struct StreamMultiplexer {
    buffer: Arc<SharedFrameBuffer>,
    settings: StreamSettings,
    encoder: EncodeFn,
}

impl StreamMultiplexer {
    pub fn new(buffer: Arc<SharedFrameBuffer>, settings: StreamSettings) -> Self {
        let quality = settings.jpeg_quality;
        Self {
            buffer,
            settings,
            encoder: Arc::new(move |image: &RgbImage| encode_jpeg(image, quality)),
        }
    }

    /// Replace the JPEG encoder.
    pub fn with_encoder(mut self, encoder: EncodeFn) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn buffer(&self) -> &Arc<SharedFrameBuffer> {
        &self.buffer
    }

    /// Open a new stream. With a detector every frame is annotated with its
    /// detections; without one frames pass through unmodified.
    pub fn open_stream(&self, detector: Option<Arc<dyn Detector>>) -> FrameStream {
        FrameStream {
            buffer: self.buffer.clone(),
            detector,
            encoder: self.encoder.clone(),
            poll_interval: self.settings.poll_interval,
            last_generation: 0,
            frames_emitted: 0,
            encode_failures: 0,
            detector_failing: false,
        }
    }
}

/// Unbounded sequence of multipart-framed JPEG parts.
///
/// `next()` blocks until a frame newer than the last one emitted is
/// available. It returns `None` only once the buffer has been closed.
pub struct FrameStream {
    buffer: Arc<SharedFrameBuffer>,
    detector: Option<Arc<dyn Detector>>,
    encoder: EncodeFn,
    poll_interval: Duration,
    last_generation: u64,
    frames_emitted: u64,
    encode_failures: u64,
    detector_failing: bool,
}

impl FrameStream {
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures
    }

    pub fn detector_name(&self) -> Option<&str> {
        self.detector.as_ref().map(|d| d.name())
    }
}

impl Iterator for FrameStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            let frame = match self
                .buffer
                .wait_newer(self.last_generation, self.poll_interval)
            {
                WaitOutcome::Frame { generation, frame } => {
                    self.last_generation = generation;
                    frame
                }
                WaitOutcome::Timeout => continue,
                WaitOutcome::Closed => return None,
            };

            let annotated;
            let image = match &self.detector {
                Some(detector) => {
                    let detections = match detector.detect(&frame) {
                        Ok(detections) => {
                            if self.detector_failing {
                                log::info!("stream: detector '{}' recovered", detector.name());
                                self.detector_failing = false;
                            }
                            detections
                        }
                        Err(err) => {
                            if !self.detector_failing {
                                log::warn!(
                                    "stream: detector '{}' failed, sending unannotated frames: {}",
                                    detector.name(),
                                    err
                                );
                                self.detector_failing = true;
                            }
                            Vec::new()
                        }
                    };
                    annotated = annotate_frame(&frame, &detections);
                    &annotated
                }
                None => frame.image(),
            };

            match (self.encoder)(image) {
                Ok(jpeg) => {
                    self.frames_emitted += 1;
                    return Some(multipart_part(&jpeg));
                }
                Err(err) => {
                    self.encode_failures += 1;
                    log::debug!(
                        "stream: skipping frame {}: {}",
                        frame.sequence,
                        err
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, StubDetector};
    use crate::frame::Frame;
    use crate::zone::BoundingBox;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    const HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    fn frame(value: u8, sequence: u64) -> Frame {
        Frame::from_rgb(vec![value; 32 * 24 * 3], 32, 24, sequence).unwrap()
    }

    fn jpeg_payload(part: &[u8]) -> &[u8] {
        assert!(part.starts_with(HEADER));
        assert!(part.ends_with(b"\r\n"));
        &part[HEADER.len()..part.len() - 2]
    }

    #[test]
    fn raw_stream_emits_framed_jpeg() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        buffer.publish(frame(120, 1)).unwrap();
        let mux = StreamMultiplexer::new(buffer, StreamSettings::default());

        let mut stream = mux.open_stream(None);
        let part = stream.next().unwrap();
        let decoded = image::load_from_memory(jpeg_payload(&part)).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        assert_eq!(stream.frames_emitted(), 1);
        assert!(stream.detector_name().is_none());
    }

    #[test]
    fn waits_for_first_frame() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mux = StreamMultiplexer::new(buffer.clone(), StreamSettings::default());
        let publisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            buffer.publish(frame(10, 1)).unwrap();
        });

        let mut stream = mux.open_stream(None);
        assert!(stream.next().is_some());
        publisher.join().unwrap();
    }

    #[test]
    fn annotated_stream_invokes_detector_per_frame() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let detector = Arc::new(StubDetector::new("model1").with_detections(vec![Detection {
            class_id: 0,
            confidence: 0.9,
            bbox: BoundingBox::new(2.0, 2.0, 20.0, 20.0),
        }]));
        let mux = StreamMultiplexer::new(buffer.clone(), StreamSettings::default());
        let mut stream = mux.open_stream(Some(detector.clone() as Arc<dyn Detector>));

        buffer.publish(frame(0, 1)).unwrap();
        assert!(stream.next().is_some());
        buffer.publish(frame(0, 2)).unwrap();
        assert!(stream.next().is_some());
        assert_eq!(detector.calls(), 2);
        assert_eq!(stream.detector_name(), Some("model1"));
    }

    #[test]
    fn detector_failure_falls_back_to_raw_frames() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let detector = Arc::new(StubDetector::new("model2"));
        detector.set_failing(true);
        buffer.publish(frame(0, 1)).unwrap();

        let mux = StreamMultiplexer::new(buffer, StreamSettings::default());
        let mut stream = mux.open_stream(Some(detector as Arc<dyn Detector>));
        assert!(stream.next().is_some());
    }

    #[test]
    fn encode_failures_are_skipped() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = attempts.clone();
        let encoder: EncodeFn = Arc::new(move |image: &RgbImage| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(anyhow!("simulated encode failure"));
            }
            encode_jpeg(image, 80)
        });
        let mux = StreamMultiplexer::new(buffer.clone(), StreamSettings::default())
            .with_encoder(encoder);

        let publisher = thread::spawn(move || {
            for i in 1..=20u64 {
                buffer.publish(frame(i as u8, i)).unwrap();
                thread::sleep(Duration::from_millis(10));
            }
        });

        let mut stream = mux.open_stream(None);
        let part = stream.next().unwrap();
        assert!(part.starts_with(HEADER));
        assert_eq!(stream.encode_failures(), 2);
        assert_eq!(stream.frames_emitted(), 1);
        publisher.join().unwrap();
    }

    #[test]
    fn stream_ends_when_buffer_closes() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mux = StreamMultiplexer::new(buffer.clone(), StreamSettings::default());
        let mut stream = mux.open_stream(None);
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            buffer.close();
        });
        assert!(stream.next().is_none());
        closer.join().unwrap();
    }

    #[test]
    fn streams_advance_independently() {
        let buffer = Arc::new(SharedFrameBuffer::new());
        let mux = StreamMultiplexer::new(buffer.clone(), StreamSettings::default());
        let mut fast = mux.open_stream(None);
        let mut slow = mux.open_stream(None);

        buffer.publish(frame(1, 1)).unwrap();
        assert!(fast.next().is_some());
        buffer.publish(frame(2, 2)).unwrap();
        assert!(fast.next().is_some());

        // The slow stream skips straight to the newest frame.
        assert!(slow.next().is_some());
        assert_eq!(fast.frames_emitted(), 2);
        assert_eq!(slow.frames_emitted(), 1);
    }
}
