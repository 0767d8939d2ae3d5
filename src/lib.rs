//! Coop camera
//!
//! Live view and occupancy counting for a single networked coop camera.
//!
//! # Architecture
//!
//! One capture thread owns the camera connection and keeps only the newest
//! frame. Everything else reads that frame:
//!
//! 1. **Acquisition**: `FrameSource` reads, rotates and publishes frames,
//!    reconnecting on any fault without ever exiting on its own.
//! 2. **Latest frame**: `SharedFrameBuffer` holds one immutable frame behind a
//!    swap; readers never see a partially written frame.
//! 3. **Streams**: `StreamMultiplexer` hands each client an independent
//!    `FrameStream` of multipart JPEG parts, optionally annotated by a detector.
//! 4. **Counting**: `ZoneCounter` runs a detector on the latest frame, counts
//!    detections per zone and appends the result to the detection log.
//!
//! # Module Structure
//!
//! - `frame`, `source`, `ingest`: acquisition and the shared buffer
//! - `detect`, `zone`, `counting`: detectors, zone geometry and counts
//! - `annotate`, `encode`, `stream`: rendering and MJPEG framing
//! - `storage`, `api`, `config`: persistence, HTTP and configuration

pub mod annotate;
pub mod api;
pub mod config;
pub mod counting;
pub mod detect;
pub mod encode;
pub mod frame;
pub mod ingest;
pub mod source;
pub mod storage;
pub mod stream;
pub mod zone;

pub use counting::{CountingSettings, ZoneCounter, ZoneLogger};
pub use detect::{Detection, Detector, DetectorRegistry, StubDetector, RAW_FEED_NAME};
pub use frame::{Frame, Rotation, SharedFrameBuffer, WaitOutcome};
pub use ingest::{CameraCapture, CameraConfig};
pub use source::{FrameSource, SourceMonitor, SourceState, SourceStats};
pub use storage::{
    DetectionRecord, DetectionStore, InMemoryDetectionStore, SharedStore, SqliteDetectionStore,
};
pub use stream::{FrameStream, StreamMultiplexer, StreamSettings};
pub use zone::{count_in_zone, is_in_zone, BoundingBox, Point, Zone};

#[cfg(feature = "detector-http")]
pub use detect::HttpDetector;
