use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::detect::backend::Detector;
use crate::detect::result::Detection;
use crate::error::DetectorError;
use crate::frame::Frame;

/// Shared on/off switch for a stub backend's availability.
///
/// Cloning yields a handle to the same switch, so a test (or an operator
/// tool) can take the detector down and bring it back while a worker owns it.
#[derive(Clone, Debug)]
pub struct DetectorSwitch {
    available: Arc<AtomicBool>,
}

impl DetectorSwitch {
    fn new() -> Self {
        Self {
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Fixture file format for the stub backend.
///
/// ```json
/// { "default": [ {"class": "hand", "confidence": 0.9, "bbox": [1, 2, 3, 4]} ],
///   "frames": { "12": [] } }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct StubFixture {
    #[serde(default)]
    pub default: Vec<Detection>,
    #[serde(default)]
    pub frames: HashMap<u64, Vec<Detection>>,
}

/// Stub backend returning fixture detections instead of running a model.
pub struct StubBackend {
    default: Vec<Detection>,
    per_frame: HashMap<u64, Vec<Detection>>,
    switch: DetectorSwitch,
}

impl StubBackend {
    /// Returns `detections` for every frame.
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            default: detections,
            per_frame: HashMap::new(),
            switch: DetectorSwitch::new(),
        }
    }

    /// Overrides the output for one frame id.
    pub fn with_frame(mut self, frame_id: u64, detections: Vec<Detection>) -> Self {
        self.per_frame.insert(frame_id, detections);
        self
    }

    pub fn from_fixture(fixture: StubFixture) -> Self {
        Self {
            default: fixture.default,
            per_frame: fixture.frames,
            switch: DetectorSwitch::new(),
        }
    }

    pub fn from_fixture_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detector fixture {}", path.display()))?;
        let fixture: StubFixture = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid detector fixture {}: {}", path.display(), e))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn switch(&self) -> DetectorSwitch {
        self.switch.clone()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Detector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        if !self.switch.is_available() {
            return Err(DetectorError::Unavailable("stub detector switched off".into()));
        }
        Ok(self
            .per_frame
            .get(&frame.frame_id())
            .unwrap_or(&self.default)
            .clone())
    }

    fn warm_up(&mut self) -> Result<(), DetectorError> {
        if self.switch.is_available() {
            Ok(())
        } else {
            Err(DetectorError::Unavailable("stub detector switched off".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameEncoding, FrameMeta};
    use crate::geometry::BBox;

    fn frame(id: u64) -> Frame {
        Frame::new(
            FrameMeta {
                stream_id: "cam".into(),
                frame_id: id,
                timestamp_ms: id * 200,
            },
            4,
            4,
            FrameEncoding::Jpeg,
            vec![0xff, 0xd8],
        )
        .unwrap()
    }

    #[test]
    fn per_frame_fixture_overrides_default() {
        let hand = Detection::new("hand", 0.9, BBox::new(0.0, 0.0, 1.0, 1.0));
        let mut backend = StubBackend::new(vec![hand.clone()]).with_frame(2, vec![]);

        assert_eq!(backend.detect(&frame(1)).unwrap(), vec![hand]);
        assert!(backend.detect(&frame(2)).unwrap().is_empty());
    }

    #[test]
    fn switch_controls_availability() {
        let mut backend = StubBackend::default();
        let switch = backend.switch();

        switch.set_available(false);
        assert!(matches!(
            backend.detect(&frame(1)),
            Err(DetectorError::Unavailable(_))
        ));
        assert!(backend.warm_up().is_err());

        switch.set_available(true);
        assert!(backend.warm_up().is_ok());
        assert!(backend.detect(&frame(1)).is_ok());
    }

    #[test]
    fn fixture_json_parses() {
        let fixture: StubFixture = serde_json::from_str(
            r#"{"default": [{"class": "hand", "confidence": 0.5, "bbox": [1, 2, 3, 4]}],
                "frames": {"9": []}}"#,
        )
        .unwrap();
        let mut backend = StubBackend::from_fixture(fixture);
        assert_eq!(backend.detect(&frame(1)).unwrap().len(), 1);
        assert!(backend.detect(&frame(9)).unwrap().is_empty());
    }
}
