//! Error types for the recording pipeline

use thiserror::Error;

use skyreel_core::{CodecError, StorageError};

/// Errors that can occur while recording, building, or reading containers
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Ledger, object store, or catalog failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Batch compression failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The game-state collaborator could not produce a resync snapshot
    #[error("Resync snapshot unavailable for lobby {lobby_id}: {reason}")]
    SnapshotUnavailable { lobby_id: String, reason: String },

    /// Container archive framing is invalid
    #[error("Invalid archive: {0}")]
    Archive(String),

    /// Container header could not be parsed or violates its invariants
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// The ledger changed between build passes
    #[error("Ledger changed during build of {0}")]
    LedgerChanged(String),

    /// A background task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RecorderError {
    fn from(e: std::io::Error) -> Self {
        RecorderError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RecorderError {
    fn from(e: serde_json::Error) -> Self {
        RecorderError::MalformedHeader(e.to_string())
    }
}

impl RecorderError {
    /// Whether the error means the input file is not a usable container
    pub fn is_invalid_container(&self) -> bool {
        matches!(self, Self::Archive(_) | Self::MalformedHeader(_))
    }
}

/// Result type alias for recorder operations
pub type RecorderResult<T> = Result<T, RecorderError>;
