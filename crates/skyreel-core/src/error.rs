//! Error types for Skyreel

use thiserror::Error;

/// Errors raised by the storage collaborators (ledger, object store, catalog)
///
/// These are the "transient infrastructure" class: the core never retries
/// them and propagates them to the caller untouched.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// A write sink was used after it was finished
    #[error("Sink already finished: {0}")]
    SinkClosed(String),

    /// A record exceeds the store's size limit; retrying it cannot succeed
    #[error("Record of {size} bytes exceeds limit of {limit}")]
    RecordTooLarge { size: usize, limit: usize },
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl StorageError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new Database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }
}

/// Errors raised by a [`Codec`](crate::Codec)
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Event serialization failed: {0}")]
    Serialization(String),

    #[error("Malformed event at index {index}: {reason}")]
    MalformedEvent { index: usize, reason: String },

    #[error("Packet payload is not valid base64: {0}")]
    Payload(String),
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
