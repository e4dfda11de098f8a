//! Error taxonomy surfaced to the management layer.
//!
//! Every variant maps to a stable numeric code for the RPC error envelope.
//! Subprocess stderr is always carried in the message, never discarded.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZmigrateError {
    /// Bad input, rejected before any side effect.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// Dataset, snapshot, task or token absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Underlying privilege failure, surfaced via captured stderr.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Nonzero exit or transport fault on the send side of the stream.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Nonzero exit or stream fault on the receive side.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Sync-point commit/retire failure. Reported, never fatal to a
    /// transfer that already completed.
    #[error("sync point operation failed: {0}")]
    MarkerFailed(String),

    /// Absent, expired, revoked, or reused-when-non-resumable token.
    #[error("token invalid: {0}")]
    TokenInvalid(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ZmigrateError {
    fn from(e: serde_json::Error) -> Self {
        ZmigrateError::Store(e.to_string())
    }
}

impl ZmigrateError {
    /// Stable numeric code for the RPC error envelope.
    pub fn code(&self) -> i32 {
        match self {
            ZmigrateError::Validation(_) => -32602,
            ZmigrateError::NotFound(_) => -32001,
            ZmigrateError::PermissionDenied(_) => -32002,
            ZmigrateError::TransferFailed(_) => -32003,
            ZmigrateError::ReceiveFailed(_) => -32004,
            ZmigrateError::MarkerFailed(_) => -32007,
            ZmigrateError::TokenInvalid(_) => -32006,
            ZmigrateError::Store(_) => -32008,
            ZmigrateError::Io(_) => -32000,
        }
    }
}

pub type Result<T> = std::result::Result<T, ZmigrateError>;
