//! Error types for runner-bridge.

use thiserror::Error;

/// Main error type for all bridge operations.
///
/// Correlation-layer errors (`ChannelNotReady`, `RunnerReloaded`,
/// `DuplicateId`) are synthesized by the bridge. `App` carries whatever the
/// runner reported, untouched.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No transport is bound, so nothing can be sent.
    #[error("Channel not ready: no transport bound")]
    ChannelNotReady,

    /// The runner reloaded while the call was outstanding.
    #[error("Runner reloaded before the call completed")]
    RunnerReloaded,

    /// The runner reported a failure for this call.
    #[error("Runner error: {0}")]
    App(String),

    /// A live handler already exists for this correlation id.
    #[error("Duplicate correlation id: {0}")]
    DuplicateId(String),

    /// Transport closed, or the pending call was dropped without completion.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Transport queue is full.
    #[error("Transport backpressure")]
    Backpressure,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed frame.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Whether the caller may simply re-issue the call once the runner is ready again.
    pub fn is_reload(&self) -> bool {
        matches!(self, BridgeError::RunnerReloaded)
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
