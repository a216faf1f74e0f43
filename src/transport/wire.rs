//! JSON payloads carried on the work and results channels.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::engine::Assessment;
use crate::error::WireError;
use crate::frame::{Frame, FrameEncoding, FrameMeta};
use crate::violation::Violation;

/// Work channel payload: one frame, image bytes base64-encoded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub stream_id: String,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub encoding: FrameEncoding,
    pub frame: String,
}

impl FrameMessage {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            stream_id: frame.stream_id().to_string(),
            frame_id: frame.frame_id(),
            timestamp_ms: frame.timestamp_ms(),
            width: frame.width(),
            height: frame.height(),
            encoding: frame.encoding(),
            frame: STANDARD.encode(frame.payload()),
        }
    }

    pub fn into_frame(self) -> Result<Frame, WireError> {
        let payload = STANDARD.decode(self.frame.as_bytes())?;
        Frame::new(
            FrameMeta {
                stream_id: self.stream_id,
                frame_id: self.frame_id,
                timestamp_ms: self.timestamp_ms,
            },
            self.width,
            self.height,
            self.encoding,
            payload,
        )
    }
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(&FrameMessage::from_frame(frame))?)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let message: FrameMessage = serde_json::from_slice(bytes)?;
    message.into_frame()
}

/// Results channel payload: what one frame produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub stream_id: String,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    /// Wall-clock time the worker finished the frame, ms since the Unix epoch.
    pub processed_at_ms: u64,
    /// Snapshot of the detections that passed gating, for the cache.
    pub detections: Vec<Detection>,
    pub violations: Vec<Violation>,
    pub violation_count: usize,
}

impl ResultMessage {
    pub fn new(meta: &FrameMeta, processed_at_ms: u64, assessment: Assessment) -> Self {
        Self {
            stream_id: meta.stream_id.clone(),
            frame_id: meta.frame_id,
            timestamp_ms: meta.timestamp_ms,
            processed_at_ms,
            violation_count: assessment.violations.len(),
            detections: assessment.detections,
            violations: assessment.violations,
        }
    }

    pub fn meta(&self) -> FrameMeta {
        FrameMeta {
            stream_id: self.stream_id.clone(),
            frame_id: self.frame_id,
            timestamp_ms: self.timestamp_ms,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and check internal consistency.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let message: Self = serde_json::from_slice(bytes)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), WireError> {
        crate::validate_stream_id(&self.stream_id).map_err(|e| WireError::Invalid(e.to_string()))?;
        if self.violation_count != self.violations.len() {
            return Err(WireError::Invalid(format!(
                "violation_count {} does not match {} violations",
                self.violation_count,
                self.violations.len()
            )));
        }
        for v in &self.violations {
            if v.stream_id != self.stream_id || v.frame_id != self.frame_id {
                return Err(WireError::Invalid(format!(
                    "violation for {}#{} inside result for {}#{}",
                    v.stream_id, v.frame_id, self.stream_id, self.frame_id
                )));
            }
        }
        if let Some(bad) = self.detections.iter().find(|d| !d.is_well_formed()) {
            return Err(WireError::Invalid(format!(
                "malformed detection '{}' in result",
                bad.label
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Thresholds, ViolationEngine};
    use crate::geometry::{BBox, Zone};

    fn meta() -> FrameMeta {
        FrameMeta {
            stream_id: "line_1".into(),
            frame_id: 3,
            timestamp_ms: 600,
        }
    }

    fn assessment() -> Assessment {
        let engine = ViolationEngine::new(
            vec![Zone::new("prep", BBox::new(0.0, 0.0, 640.0, 480.0))],
            Thresholds::default(),
        );
        engine.assess(
            &meta(),
            &[
                Detection::new("hand", 0.95, BBox::new(100.0, 150.0, 200.0, 300.0)),
                Detection::new("pizza", 0.92, BBox::new(120.0, 160.0, 280.0, 320.0)),
            ],
        )
    }

    #[test]
    fn frame_message_carries_payload_as_base64() {
        let frame = Frame::new(meta(), 2, 1, FrameEncoding::Png, vec![0x89, b'P', b'N']).unwrap();
        let bytes = encode_frame(&frame).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["frame"], "iVBO");
        assert_eq!(json["encoding"], "png");

        let back = decode_frame(&bytes).unwrap();
        assert_eq!(back.meta(), frame.meta());
        assert_eq!(back.payload(), frame.payload());
    }

    #[test]
    fn bad_frame_payloads_are_malformed() {
        assert!(matches!(decode_frame(b"not json"), Err(WireError::Json(_))));
        let bad_b64 = br#"{"stream_id":"cam","frame_id":1,"timestamp_ms":0,
            "width":1,"height":1,"frame":"@@@"}"#;
        assert!(matches!(decode_frame(bad_b64), Err(WireError::Base64(_))));
        let bad_stream = br#"{"stream_id":"cam/1","frame_id":1,"timestamp_ms":0,
            "width":1,"height":1,"frame":"AA=="}"#;
        assert!(matches!(decode_frame(bad_stream), Err(WireError::Invalid(_))));
    }

    #[test]
    fn result_message_validates_count() {
        let message = ResultMessage::new(&meta(), 1_700_000_000_000, assessment());
        assert_eq!(message.violation_count, 1);
        let bytes = message.encode().unwrap();
        assert_eq!(ResultMessage::decode(&bytes).unwrap(), message);

        let mut json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["violation_count"] = 2.into();
        let tampered = serde_json::to_vec(&json).unwrap();
        assert!(matches!(
            ResultMessage::decode(&tampered),
            Err(WireError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_violation_type_is_malformed() {
        let message = ResultMessage::new(&meta(), 0, assessment());
        let mut json = serde_json::to_value(&message).unwrap();
        json["violations"][0]["violation_type"] = "no-gloves".into();
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(matches!(ResultMessage::decode(&bytes), Err(WireError::Json(_))));
    }
}
