use crate::detect::result::Detection;
use crate::error::DetectorError;
use crate::frame::Frame;

/// Object detection capability.
///
/// The model behind an implementation is opaque: image in, labeled boxes
/// out. Implementations hold no state that influences results across calls
/// other than read-only model weights, so `detect` is deterministic for a
/// fixed model and input. Each pipeline worker owns its own instance.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame, returning detections in model output order.
    ///
    /// `DetectorError::Unavailable` means the capability itself is down and
    /// the caller must stop feeding it frames. `DetectorError::InvalidInput`
    /// is specific to this frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;

    /// Readiness probe, also used to decide when a failed detector has
    /// recovered.
    fn warm_up(&mut self) -> Result<(), DetectorError> {
        Ok(())
    }
}
