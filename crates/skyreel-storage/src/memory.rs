//! In-memory storage implementations
//!
//! This module provides in-memory implementations of the collaborator
//! traits, suitable for testing and embedding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tracing::{debug, trace};

use skyreel_core::{
    ByteSource, Catalog, CatalogFilter, ContainerHeader, HeaderSummary, Ledger, LogRecord,
    ObjectSink, ObjectStore, RecordKind, RecordStream, RecordingMetadata, StorageError,
};

/// In-memory ledger
///
/// Records are kept per session in arrival order.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    sessions: DashMap<String, Vec<LogRecord>>,
    appends: AtomicUsize,
    fail_appends: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a session's records
    pub fn records(&self, session_id: &str) -> Vec<LogRecord> {
        self.sessions
            .get(session_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Total number of successful appends since creation
    pub fn append_count(&self) -> usize {
        self.appends.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Make every subsequent append fail with an I/O error
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StorageError::io(format!(
                "append to {} rejected",
                record.session_id
            )));
        }
        self.sessions
            .entry(record.session_id.clone())
            .or_default()
            .push(record.clone());
        self.appends.fetch_add(1, Ordering::Relaxed);
        trace!(session_id = %record.session_id, kind = ?record.kind, "Appended record");
        Ok(())
    }

    async fn stream_records(&self, session_id: &str) -> Result<RecordStream, StorageError> {
        let records = self.records(session_id);
        Ok(futures::stream::iter(records.into_iter().map(Ok)).boxed())
    }

    async fn find_last_packet_record(
        &self,
        session_id: &str,
    ) -> Result<Option<LogRecord>, StorageError> {
        Ok(self.sessions.get(session_id).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.kind == RecordKind::Packet)
                .cloned()
        }))
    }

    async fn find_stop_marker(&self, session_id: &str) -> Result<Option<LogRecord>, StorageError> {
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|records| records.iter().find(|r| r.is_stop_marker()).cloned()))
    }

    async fn sessions_with_init(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().iter().any(|r| r.kind == RecordKind::Init))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_all(&self, session_id: &str) -> Result<(), StorageError> {
        if let Some((_, records)) = self.sessions.remove(session_id) {
            debug!(session_id, records = records.len(), "Deleted session records");
        }
        Ok(())
    }
}

/// In-memory object store
///
/// Read streams hand out fragments of a configurable size, which makes it
/// easy to exercise consumers against arbitrary fragmentation.
#[derive(Debug, Clone)]
pub struct InMemoryObjectStore {
    objects: Arc<DashMap<String, Bytes>>,
    fragment_size: usize,
    writes: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicBool>,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            fragment_size: 64 * 1024,
            writes: Arc::new(AtomicUsize::new(0)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `size`-byte read fragments
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.max(1);
        self
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of objects published so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.get(key).map(|b| b.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    fn check_writable(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::io(format!("write to {key} rejected")));
        }
        Ok(())
    }

    fn publish(&self, key: &str, data: Bytes) {
        self.objects.insert(key.to_string(), data);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.contains_key(key))
    }

    async fn sizeof(&self, key: &str) -> Result<u64, StorageError> {
        self.objects
            .get(key)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn write_stream(&self, key: &str) -> Result<Box<dyn ObjectSink>, StorageError> {
        self.check_writable(key)?;
        Ok(Box::new(MemorySink {
            store: self.clone(),
            key: key.to_string(),
            buffer: Some(Vec::new()),
        }))
    }

    async fn read_stream(&self, key: &str) -> Result<Box<dyn ByteSource>, StorageError> {
        let data = self.get(key).ok_or_else(|| StorageError::not_found(key))?;
        Ok(Box::new(MemorySource::new(data, self.fragment_size)))
    }

    async fn write_text(&self, key: &str, text: &str) -> Result<(), StorageError> {
        self.check_writable(key)?;
        self.publish(key, Bytes::copy_from_slice(text.as_bytes()));
        Ok(())
    }

    async fn read_text(&self, key: &str) -> Result<String, StorageError> {
        let data = self.get(key).ok_or_else(|| StorageError::not_found(key))?;
        String::from_utf8(data.to_vec()).map_err(|e| StorageError::Deserialization(e.to_string()))
    }
}

struct MemorySink {
    store: InMemoryObjectStore,
    key: String,
    buffer: Option<Vec<u8>>,
}

#[async_trait]
impl ObjectSink for MemorySink {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.store.check_writable(&self.key)?;
        self.buffer
            .as_mut()
            .ok_or_else(|| StorageError::SinkClosed(self.key.clone()))?
            .extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        self.store.check_writable(&self.key)?;
        let buffer = self
            .buffer
            .take()
            .ok_or_else(|| StorageError::SinkClosed(self.key.clone()))?;
        self.store.publish(&self.key, Bytes::from(buffer));
        Ok(())
    }
}

/// Byte source over an in-memory buffer
///
/// Splits `data` into fragments of at most `fragment_size` bytes.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    fragment_size: usize,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>, fragment_size: usize) -> Self {
        Self {
            data: data.into(),
            fragment_size: fragment_size.max(1),
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn next_fragment(&mut self) -> Result<Option<Bytes>, StorageError> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = self.fragment_size.min(self.data.len());
        Ok(Some(self.data.split_to(n)))
    }
}

/// In-memory catalog
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    headers: DashMap<String, ContainerHeader>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn register(&self, header: &ContainerHeader) -> Result<(), StorageError> {
        self.headers.insert(header.id.clone(), header.clone());
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Result<Option<ContainerHeader>, StorageError> {
        Ok(self.headers.get(id).map(|h| h.value().clone()))
    }

    async fn list(&self, filter: &CatalogFilter) -> Result<Vec<HeaderSummary>, StorageError> {
        let headers: Vec<ContainerHeader> =
            self.headers.iter().map(|h| h.value().clone()).collect();
        Ok(filter.apply(headers.iter()))
    }

    async fn attach_metadata(
        &self,
        id: &str,
        metadata: RecordingMetadata,
    ) -> Result<(), StorageError> {
        let mut header = self
            .headers
            .get_mut(id)
            .ok_or_else(|| StorageError::not_found(id))?;
        header.info.metadata = Some(metadata);
        Ok(())
    }
}
