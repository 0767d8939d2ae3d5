#![cfg(feature = "detector-http")]

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::detect::backend::Detector;
use crate::detect::result::{parse_detections, Detection};
use crate::encode::encode_jpeg;
use crate::frame::Frame;

const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;
const REQUEST_JPEG_QUALITY: u8 = 90;

/// Detector backed by an external inference service over HTTP.
///
/// Each call posts the frame as `image/jpeg` and expects the JSON body
/// accepted by `parse_detections`.
pub struct HttpDetector {
    name: String,
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpDetector {
    pub fn new(name: &str, endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("parse detector url '{}'", endpoint))?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported detector scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            name: name.to_string(),
            endpoint,
            agent,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl Detector for HttpDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let jpeg = encode_jpeg(frame.image(), REQUEST_JPEG_QUALITY)?;
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("detector '{}' request failed", self.name))?;

        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_RESPONSE_BYTES)
            .read_to_end(&mut body)
            .with_context(|| format!("read detector '{}' response", self.name))?;

        Ok(parse_detections(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(HttpDetector::new("m", "tcp://127.0.0.1:9000", Duration::from_secs(1)).is_err());
        assert!(HttpDetector::new("m", "not a url", Duration::from_secs(1)).is_err());
        let detector =
            HttpDetector::new("m", "http://127.0.0.1:9000/detect", Duration::from_secs(1)).unwrap();
        assert_eq!(detector.endpoint().path(), "/detect");
    }
}
