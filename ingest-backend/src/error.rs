//! Error taxonomy.
//!
//! Two distinct things live here, deliberately kept apart:
//! - `ErrorCode`/`Severity`: stable identifiers persisted to the error
//!   record store (§7 of the design doc). They're data, not `std::error::Error`
//!   impls — nothing ever returns one as a Rust error.
//! - The `thiserror` enums below: real fallible-operation error types for the
//!   façade traits, one per collaborator, each with an `Internal(anyhow::Error)`
//!   catch-all for anything that doesn't deserve its own variant.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseFail,
    BadTopic,
    ChunkDecodeFail,
    ChunkOutOfRange,
    DupChunkConflict,
    AssemblyTimeout,
    AssemblyRetransmitExhausted,
    SizeMismatch,
    JpegInvalid,
    HashMismatch,
    StorageUploadFail,
    CaptureUpdateFail,
    UnknownDevice,
    Overload,
    BackpressureDrop,
    /// Not in the §7 table itself, but named in §5's resource-cap prose
    /// ("a buffer that would exceed MAX_IMAGE_BYTES ... is rejected as
    /// OVERSIZED") — carried here to close that gap.
    Oversized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warn,
    Error,
}

impl ErrorCode {
    /// Whether this kind can terminate a capture (`failed`), per §7's
    /// propagation policy: only `error`-severity kinds are terminal.
    pub fn severity(self) -> Severity {
        match self {
            ErrorCode::ChunkOutOfRange
            | ErrorCode::DupChunkConflict
            | ErrorCode::UnknownDevice
            | ErrorCode::Overload
            | ErrorCode::BackpressureDrop
            | ErrorCode::Oversized => Severity::Warn,
            ErrorCode::ParseFail
            | ErrorCode::BadTopic
            | ErrorCode::ChunkDecodeFail
            | ErrorCode::AssemblyTimeout
            | ErrorCode::AssemblyRetransmitExhausted
            | ErrorCode::SizeMismatch
            | ErrorCode::JpegInvalid
            | ErrorCode::HashMismatch
            | ErrorCode::StorageUploadFail
            | ErrorCode::CaptureUpdateFail => Severity::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseFail => "PARSE_FAIL",
            ErrorCode::BadTopic => "BAD_TOPIC",
            ErrorCode::ChunkDecodeFail => "CHUNK_DECODE_FAIL",
            ErrorCode::ChunkOutOfRange => "CHUNK_OUT_OF_RANGE",
            ErrorCode::DupChunkConflict => "DUP_CHUNK_CONFLICT",
            ErrorCode::AssemblyTimeout => "ASSEMBLY_TIMEOUT",
            ErrorCode::AssemblyRetransmitExhausted => "ASSEMBLY_RETRANSMIT_EXHAUSTED",
            ErrorCode::SizeMismatch => "SIZE_MISMATCH",
            ErrorCode::JpegInvalid => "JPEG_INVALID",
            ErrorCode::HashMismatch => "HASH_MISMATCH",
            ErrorCode::StorageUploadFail => "STORAGE_UPLOAD_FAIL",
            ErrorCode::CaptureUpdateFail => "CAPTURE_UPDATE_FAIL",
            ErrorCode::UnknownDevice => "UNKNOWN_DEVICE",
            ErrorCode::Overload => "OVERLOAD",
            ErrorCode::BackpressureDrop => "BACKPRESSURE_DROP",
            ErrorCode::Oversized => "OVERSIZED",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("no such device: {0}")]
    DeviceNotFound(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("upload failed with status {status}: {body}")]
    UploadFailed { status: u16, body: String },
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
