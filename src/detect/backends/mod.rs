#[cfg(feature = "detector-http")]
pub mod http;
pub mod stub;

#[cfg(feature = "detector-http")]
pub use http::HttpDetector;
pub use stub::StubDetector;
