//! Collaborator traits for the recording pipeline
//!
//! The recorder core only talks to storage and compression through these
//! traits, so backends (files, redb, memory) are interchangeable.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::BoxStream;

use crate::error::{CodecError, StorageError};
use crate::event::Event;
use crate::header::{CatalogFilter, ContainerHeader, HeaderSummary, RecordingMetadata};
use crate::record::LogRecord;

/// Result of a best-effort decode of possibly truncated bytes
#[derive(Debug, Default)]
pub struct PartialDecode {
    /// Every event recovered, in order
    pub events: Vec<Event>,
    /// Why decoding stopped early, if it did
    pub error: Option<CodecError>,
}

/// Compresses ordered event batches to opaque bytes and back
///
/// Implementations must satisfy `decode(encode(e)) == e`.
pub trait Codec: Send + Sync {
    /// Compress an ordered batch of events
    fn encode(&self, events: &[Event]) -> Result<Vec<u8>, CodecError>;

    /// Decompress bytes produced by [`Codec::encode`]
    fn decode(&self, bytes: &[u8]) -> Result<Vec<Event>, CodecError>;

    /// Decode as many events as the bytes actually contain
    ///
    /// Used for truncated or corrupt chunks. The default recovers nothing
    /// on error; codecs with a streaming format should override it.
    fn decode_lossy(&self, bytes: &[u8]) -> PartialDecode {
        match self.decode(bytes) {
            Ok(events) => PartialDecode { events, error: None },
            Err(e) => PartialDecode {
                events: Vec::new(),
                error: Some(e),
            },
        }
    }
}

/// Stream of ledger records in arrival order
pub type RecordStream = BoxStream<'static, Result<LogRecord, StorageError>>;

/// Append-only durable store of log records, keyed by session id
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Durably append a record to its session
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError>;

    /// Stream a session's records in arrival order
    ///
    /// An unknown session yields an empty stream.
    async fn stream_records(&self, session_id: &str) -> Result<RecordStream, StorageError>;

    /// Most recent `Packet` record of a session
    async fn find_last_packet_record(&self, session_id: &str)
    -> Result<Option<LogRecord>, StorageError>;

    /// The session's terminal `stop` marker, if one was appended
    async fn find_stop_marker(&self, session_id: &str) -> Result<Option<LogRecord>, StorageError>;

    /// Every session currently holding an `Init` record
    async fn sessions_with_init(&self) -> Result<Vec<String>, StorageError>;

    /// Remove every record of a session
    async fn delete_all(&self, session_id: &str) -> Result<(), StorageError>;
}

/// Streaming byte sink returned by [`ObjectStore::write_stream`]
///
/// Data becomes visible under the key only once `finish` returns.
#[async_trait]
pub trait ObjectSink: Send {
    /// Write the next slice of data
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Flush and publish the object
    async fn finish(&mut self) -> Result<(), StorageError>;
}

/// Source of byte fragments of arbitrary size
#[async_trait]
pub trait ByteSource: Send {
    /// Next fragment, or `None` at end of stream
    async fn next_fragment(&mut self) -> Result<Option<Bytes>, StorageError>;
}

/// Byte-addressable blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Size of an object in bytes
    async fn sizeof(&self, key: &str) -> Result<u64, StorageError>;

    /// Open a streaming writer for `key`, replacing any existing object on finish
    async fn write_stream(&self, key: &str) -> Result<Box<dyn ObjectSink>, StorageError>;

    /// Open a streaming reader for `key`
    async fn read_stream(&self, key: &str) -> Result<Box<dyn ByteSource>, StorageError>;

    async fn write_text(&self, key: &str, text: &str) -> Result<(), StorageError>;

    async fn read_text(&self, key: &str) -> Result<String, StorageError>;
}

/// Discoverable index of finalized containers
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Insert or replace a header
    async fn register(&self, header: &ContainerHeader) -> Result<(), StorageError>;

    async fn lookup(&self, id: &str) -> Result<Option<ContainerHeader>, StorageError>;

    /// Filtered listing, newest first
    async fn list(&self, filter: &CatalogFilter) -> Result<Vec<HeaderSummary>, StorageError>;

    /// Attach extracted metadata to an existing entry
    ///
    /// Fails with [`StorageError::NotFound`] if the id is not registered.
    async fn attach_metadata(
        &self,
        id: &str,
        metadata: RecordingMetadata,
    ) -> Result<(), StorageError>;
}

/// Wall-clock abstraction for testability
pub trait Clock: Send + Sync {
    /// Current time as Unix millis
    fn now_millis(&self) -> i64;

    fn now_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Real clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Move the clock forward
    pub fn advance(&self, by: std::time::Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FailingCodec;

    impl Codec for FailingCodec {
        fn encode(&self, _events: &[Event]) -> Result<Vec<u8>, CodecError> {
            Ok(Vec::new())
        }

        fn decode(&self, _bytes: &[u8]) -> Result<Vec<Event>, CodecError> {
            Err(CodecError::Decompression("bad frame".into()))
        }
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_utc().timestamp_millis(), 10);
    }

    #[test]
    fn test_default_lossy_decode_reports_error() {
        let partial = FailingCodec.decode_lossy(b"xyz");
        assert!(partial.events.is_empty());
        assert!(matches!(partial.error, Some(CodecError::Decompression(_))));
    }

    #[test]
    fn test_system_clock_is_recent() {
        assert!(SystemClock.now_millis() > 1_600_000_000_000);
    }
}
