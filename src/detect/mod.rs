mod backend;
mod backends;
mod registry;
mod result;

pub use backend::Detector;
#[cfg(feature = "detector-http")]
pub use backends::HttpDetector;
pub use backends::StubDetector;
pub use registry::{DetectorRegistry, RAW_FEED_NAME};
pub use result::{parse_detections, Detection};
