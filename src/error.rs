//! Error types for pipeline-share.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all transfer, server and client operations.
#[derive(Debug, Error)]
pub enum ShareError {
    /// I/O error during socket or staging-file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (unknown request type, missing field, bad header).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload does not fit the configured or wire maximum.
    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: u64, max: u32 },

    /// Peer closed the connection where a frame was expected.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer closed the connection after a header but before the full body.
    #[error("Connection closed mid-frame ({received}/{expected} bytes)")]
    ConnectionClosedMidFrame { expected: u32, received: u64 },

    /// Operation did not complete within the allowed time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Well-formed error response reported by the server.
    #[error("Server error: {0}")]
    Server(String),

    /// Client gave up after its bounded number of attempts.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Blocking serialization task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias using ShareError.
pub type Result<T> = std::result::Result<T, ShareError>;
