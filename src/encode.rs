//! JPEG encoding and multipart framing for the live streams.
//!
//! Every part on the wire is:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n\r\n
//! <JPEG bytes>\r\n
//! ```

use anyhow::{anyhow, Result};
use image::{codecs::jpeg::JpegEncoder, RgbImage};

/// Multipart boundary token.
pub const BOUNDARY: &str = "frame";

/// Response content type for every stream route.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    if image.width() == 0 || image.height() == 0 {
        return Err(anyhow!(
            "cannot encode empty {}x{} image",
            image.width(),
            image.height()
        ));
    }
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Wrap encoded JPEG bytes in one multipart part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--");
    part.extend_from_slice(BOUNDARY.as_bytes());
    part.extend_from_slice(b"\r\n");
    part.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
