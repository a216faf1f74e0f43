//! Error kinds for the pipeline stages.
//!
//! Stage-level errors (`DetectorError`, `TransportError`, `StoreError`,
//! `WireError`) are folded into `PipelineError`, whose variants carry the
//! retry policy: transport and persistence failures are retried, malformed
//! messages are dropped, detector outages stop consumption.

/// Failure of the detector capability.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    /// The model cannot be invoked at all (not loaded, resources exhausted).
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    /// This particular frame cannot be processed (undecodable image, wrong size).
    #[error("detector rejected frame: {0}")]
    InvalidInput(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An established connection dropped; reconnect and resume.
    #[error("transport connection lost: {0}")]
    ConnectionLost(String),

    /// A connection attempt failed.
    #[error("transport connect failed: {0}")]
    ConnectFailed(String),

    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The connection was closed locally.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Errors that a reconnect can cure.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::ConnectFailed(_) | Self::Publish { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("violation insert failed: {0}")]
    WriteFailed(String),

    #[error("violation query failed: {0}")]
    Read(String),

    #[error("corrupt violation record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Read(e.to_string())
    }
}

/// A payload that does not decode into a frame or result message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 frame payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid message: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("transport connection lost: {0}")]
    TransportConnectionLost(String),

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailed(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown requested")]
    Shutdown,
}

impl From<TransportError> for PipelineError {
    fn from(e: TransportError) -> Self {
        Self::TransportConnectionLost(e.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        Self::PersistenceWriteFailed(e.to_string())
    }
}

impl From<WireError> for PipelineError {
    fn from(e: WireError) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

impl From<DetectorError> for PipelineError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::Unavailable(reason) => Self::DetectorUnavailable(reason),
            DetectorError::InvalidInput(reason) => Self::MalformedMessage(reason),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
