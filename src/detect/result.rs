use serde::{Deserialize, Serialize};

use crate::zone::BoundingBox;

/// One detected object in frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Deserialize)]
struct WireResponse {
    detections: Vec<WireDetection>,
}

#[derive(Deserialize)]
struct WireDetection {
    class_id: u32,
    confidence: f32,
    #[serde(rename = "box")]
    bbox: [f32; 4],
}

/// Parse a detector response body.
///
/// Expected shape: `{"detections":[{"class_id":0,"confidence":0.9,"box":[x1,y1,x2,y2]}]}`.
/// Any missing field, wrong type or non-finite number discards the whole
/// response and yields an empty list.
pub fn parse_detections(body: &[u8]) -> Vec<Detection> {
    let response: WireResponse = match serde_json::from_slice(body) {
        Ok(response) => response,
        Err(err) => {
            log::warn!("detector returned malformed output: {}", err);
            return Vec::new();
        }
    };

    let mut out = Vec::with_capacity(response.detections.len());
    for wire in response.detections {
        let [x1, y1, x2, y2] = wire.bbox;
        if !wire.confidence.is_finite() || !wire.bbox.iter().all(|v| v.is_finite()) {
            log::warn!("detector returned non-finite values; discarding response");
            return Vec::new();
        }
        out.push(Detection {
            class_id: wire.class_id,
            confidence: wire.confidence,
            bbox: BoundingBox::new(x1, y1, x2, y2),
        });
    }
    out
}
