use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detector collaborator.
///
/// Implementations wrap an external inference capability; this crate never
/// loads or trains models itself. `detect` takes `&self` so a single detector
/// can be shared by every stream that selects it, each call running on the
/// caller's own thread.
pub trait Detector: Send + Sync {
    /// Detector identifier, used as the stream route name.
    fn name(&self) -> &str;

    /// Run detection on a frame.
    ///
    /// An `Err` means the collaborator could not be reached or failed.
    /// A reachable collaborator returning malformed output yields `Ok(vec![])`.
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}
