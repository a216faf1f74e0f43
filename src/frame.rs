//! Frames flowing through the work channel.
//!
//! - `Frame`: one captured image of a stream, immutable once built.
//! - `FrameMeta`: the identifying part of a frame, cheap to copy around and
//!   carried into every violation the frame produces.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::WireError;

/// Image payload encodings accepted on the work channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    #[default]
    Jpeg,
    Png,
    /// Packed 8-bit RGB, `width * height * 3` bytes.
    Rgb8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub stream_id: String,
    /// Monotonically increasing within a stream.
    pub frame_id: u64,
    /// Milliseconds since the stream started.
    pub timestamp_ms: u64,
}

impl fmt::Display for FrameMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.frame_id)
    }
}

/// One captured image. Fields are private so a frame cannot change after
/// it has been built.
#[derive(Debug)]
pub struct Frame {
    meta: FrameMeta,
    width: u32,
    height: u32,
    encoding: FrameEncoding,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(
        meta: FrameMeta,
        width: u32,
        height: u32,
        encoding: FrameEncoding,
        payload: Vec<u8>,
    ) -> Result<Self, WireError> {
        crate::validate_stream_id(&meta.stream_id)
            .map_err(|e| WireError::Invalid(e.to_string()))?;
        if payload.is_empty() {
            return Err(WireError::Invalid(format!("frame {} has no payload", meta)));
        }
        if encoding == FrameEncoding::Rgb8 {
            let expected = (width as usize)
                .checked_mul(height as usize)
                .and_then(|v| v.checked_mul(3))
                .ok_or_else(|| WireError::Invalid("frame dimensions overflow".to_string()))?;
            if payload.len() != expected {
                return Err(WireError::Invalid(format!(
                    "frame {}: expected {} rgb bytes, received {}",
                    meta,
                    expected,
                    payload.len()
                )));
            }
        }
        Ok(Self {
            meta,
            width,
            height,
            encoding,
            payload,
        })
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn stream_id(&self) -> &str {
        &self.meta.stream_id
    }

    pub fn frame_id(&self) -> u64 {
        self.meta.frame_id
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.meta.timestamp_ms
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
