//! Crash recovery and container ingestion
//!
//! Recovery closes sessions that a previous process left without a stop
//! marker and builds their containers. Ingestion registers container files
//! produced elsewhere. Both are safe to repeat: a finalized session leaves
//! nothing behind in the ledger, and an ingested id is found in the catalog.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::TryStreamExt;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use skyreel_core::{
    ByteSource, Catalog, Clock, ContainerHeader, Ledger, LogRecord, ObjectStore, SystemClock,
};
use skyreel_storage::FileSource;

use crate::archive::{CONTAINER_EXTENSION, archive_key, header_key, read_archive_header};
use crate::builder::{BuildOutcome, ContainerBuilder};
use crate::config::RecoveryConfig;
use crate::error::{RecorderError, RecorderResult};

/// Fragment size used when reading local container files
const FILE_FRAGMENT_SIZE: usize = 512 * 1024;

/// Result of ingesting one container file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Uploaded and registered under this id
    Ingested(String),
    /// The catalog already had this id; nothing was written
    AlreadyExists(String),
}

impl IngestOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Ingested(id) | Self::AlreadyExists(id) => id,
        }
    }
}

/// What one pass over the inbound directory did
#[derive(Debug, Default)]
pub struct InboundReport {
    pub ingested: Vec<String>,
    pub already_present: Vec<String>,
    /// Files without the container extension
    pub skipped: Vec<PathBuf>,
    /// Container files that could not be read, left in place
    pub invalid: Vec<(PathBuf, String)>,
}

/// Finalizes dangling sessions and ingests external containers
pub struct RecoveryManager {
    ledger: Arc<dyn Ledger>,
    objects: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    builder: Arc<ContainerBuilder>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        objects: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
        builder: Arc<ContainerBuilder>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            ledger,
            objects,
            catalog,
            builder,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Close and build every session left in the ledger
    ///
    /// Meant to run at startup, before any recorder is live. Sessions
    /// without a stop marker get one at the time of their last packet (or
    /// now, if they have none). Returns the number of containers finalized.
    #[instrument(skip(self))]
    pub async fn recover_dangling_sessions(&self) -> RecorderResult<usize> {
        let sessions = self.ledger.sessions_with_init().await?;
        if sessions.is_empty() {
            debug!("No sessions to recover");
            return Ok(0);
        }

        let mut finalized = 0;
        for session_id in &sessions {
            if self.ledger.find_stop_marker(session_id).await?.is_none() {
                self.close_dangling(session_id).await?;
            }
            match self.builder.build(session_id).await? {
                BuildOutcome::Finalized(header) => {
                    finalized += 1;
                    info!(
                        container_id = %header.id,
                        duration_ms = header.info.duration,
                        "Recovered session"
                    );
                }
                BuildOutcome::Deferred => {
                    warn!(session_id = %session_id, "Session still incomplete after recovery");
                }
            }
        }

        info!(sessions = sessions.len(), finalized, "Recovery pass complete");
        Ok(finalized)
    }

    /// Append the synthesized stop marker of a dangling session
    async fn close_dangling(&self, session_id: &str) -> RecorderResult<()> {
        let (lobby_id, timestamp) = match self.ledger.find_last_packet_record(session_id).await? {
            Some(packet) => (packet.lobby_id, packet.timestamp),
            None => {
                let first = self
                    .ledger
                    .stream_records(session_id)
                    .await?
                    .try_next()
                    .await?;
                let lobby_id = first.map(|r| r.lobby_id).unwrap_or_default();
                (lobby_id, self.clock.now_millis())
            }
        };

        self.ledger
            .append(&LogRecord::stop(session_id, &lobby_id, timestamp))
            .await?;
        info!(session_id, lobby_id = %lobby_id, timestamp, "Closed dangling session");
        Ok(())
    }

    /// Register an external container file
    ///
    /// Only the header entry is read to learn the id. A new container is
    /// uploaded verbatim and catalogued, and only then is the file moved to
    /// the processed directory. A known id leaves everything untouched.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn ingest(&self, path: &Path) -> RecorderResult<IngestOutcome> {
        let outcome = self.register_file(path).await?;
        if let IngestOutcome::Ingested(_) = &outcome {
            self.mark_processed(path).await?;
        }
        Ok(outcome)
    }

    /// Ingest every container file in the inbound directory
    ///
    /// Files whose id is already catalogued are moved out as well.
    #[instrument(skip(self), fields(dir = %self.config.inbound_dir.display()))]
    pub async fn ingest_inbound(&self) -> RecorderResult<InboundReport> {
        let mut report = InboundReport::default();

        let mut entries = match fs::read_dir(&self.config.inbound_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Inbound directory does not exist");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        for path in paths {
            let is_container = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(CONTAINER_EXTENSION));
            if !is_container {
                debug!(path = %path.display(), "Skipping non-container file");
                report.skipped.push(path);
                continue;
            }

            match self.register_file(&path).await {
                Ok(IngestOutcome::Ingested(id)) => {
                    self.mark_processed(&path).await?;
                    report.ingested.push(id);
                }
                Ok(IngestOutcome::AlreadyExists(id)) => {
                    self.mark_processed(&path).await?;
                    report.already_present.push(id);
                }
                Err(e) if e.is_invalid_container() => {
                    warn!(path = %path.display(), error = %e, "Invalid container left in inbound");
                    report.invalid.push((path, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            ingested = report.ingested.len(),
            already_present = report.already_present.len(),
            invalid = report.invalid.len(),
            "Inbound ingestion complete"
        );
        Ok(report)
    }

    async fn register_file(&self, path: &Path) -> RecorderResult<IngestOutcome> {
        let source = FileSource::open(path, FILE_FRAGMENT_SIZE).await?;
        let header = read_archive_header(Box::new(source)).await?;

        if self.catalog.lookup(&header.id).await?.is_some() {
            info!(container_id = %header.id, "Container already catalogued");
            return Ok(IngestOutcome::AlreadyExists(header.id));
        }

        let copied = self.upload_verbatim(path, &header).await?;
        let header_json = serde_json::to_string_pretty(&header)?;
        self.objects
            .write_text(&header_key(&header.id), &header_json)
            .await?;
        self.catalog.register(&header).await?;

        info!(container_id = %header.id, bytes = copied, "Ingested container");
        Ok(IngestOutcome::Ingested(header.id))
    }

    async fn upload_verbatim(&self, path: &Path, header: &ContainerHeader) -> RecorderResult<u64> {
        let mut source = FileSource::open(path, FILE_FRAGMENT_SIZE).await?;
        let mut sink = self.objects.write_stream(&archive_key(&header.id)).await?;
        let mut copied = 0u64;
        while let Some(fragment) = source.next_fragment().await? {
            sink.write(&fragment).await?;
            copied += fragment.len() as u64;
        }
        sink.finish().await?;
        Ok(copied)
    }

    /// Move a file into the processed directory
    async fn mark_processed(&self, path: &Path) -> RecorderResult<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| RecorderError::Io(format!("{} has no file name", path.display())))?;
        fs::create_dir_all(&self.config.processed_dir).await?;
        let target = self.config.processed_dir.join(file_name);

        if let Err(e) = fs::rename(path, &target).await {
            // Rename cannot cross filesystems
            debug!(error = %e, "Rename failed, copying instead");
            fs::copy(path, &target).await?;
            fs::remove_file(path).await?;
        }
        debug!(from = %path.display(), to = %target.display(), "Marked file processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyreel_core::{ChunkSpan, ManualClock, RecordingInfo};
    use skyreel_storage::{InMemoryCatalog, InMemoryLedger, InMemoryObjectStore};
    use tempfile::TempDir;

    use crate::archive::ArchiveWriter;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        objects: InMemoryObjectStore,
        catalog: Arc<InMemoryCatalog>,
        manager: RecoveryManager,
        temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(InMemoryLedger::new());
        let objects = InMemoryObjectStore::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        let builder = Arc::new(ContainerBuilder::new(
            ledger.clone(),
            Arc::new(objects.clone()),
            catalog.clone(),
        ));
        let manager = RecoveryManager::new(
            ledger.clone(),
            Arc::new(objects.clone()),
            catalog.clone(),
            builder,
            RecoveryConfig::with_data_dir(temp.path()),
        )
        .with_clock(Arc::new(ManualClock::new(90_000)));
        Fixture {
            ledger,
            objects,
            catalog,
            manager,
            temp,
        }
    }

    /// Write a container archive to a local file
    async fn container_file(dir: &Path, file: &str, id: &str) -> PathBuf {
        let scratch = InMemoryObjectStore::new();
        let header = ContainerHeader {
            id: id.to_string(),
            info: RecordingInfo {
                lobby_name: "Imported".into(),
                ..Default::default()
            },
            chunks: vec![ChunkSpan::new(0, 3)],
        };
        let sink = scratch.write_stream("tmp").await.unwrap();
        let mut writer = ArchiveWriter::begin(sink, &header).await.unwrap();
        writer.write_body(b"abc").await.unwrap();
        writer.finish().await.unwrap();

        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(file);
        std::fs::write(&path, scratch.get("tmp").unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_recover_without_packets_uses_now() {
        let f = fixture();
        f.ledger
            .append(&LogRecord::init("s1", "lobby-1", "{}".into(), 30_000))
            .await
            .unwrap();

        assert_eq!(f.manager.recover_dangling_sessions().await.unwrap(), 1);
        let header = f.catalog.lookup("s1").await.unwrap().unwrap();
        assert_eq!(header.info.duration, 60_000);
        assert_eq!(header.info.lobby_id, "lobby-1");
    }

    #[tokio::test]
    async fn test_recover_builds_stopped_but_unbuilt_session() {
        let f = fixture();
        f.ledger
            .append(&LogRecord::init("s1", "lobby-1", "{}".into(), 0))
            .await
            .unwrap();
        f.ledger
            .append(&LogRecord::stop("s1", "lobby-1", 10))
            .await
            .unwrap();

        assert_eq!(f.manager.recover_dangling_sessions().await.unwrap(), 1);
        assert_eq!(f.catalog.lookup("s1").await.unwrap().unwrap().info.duration, 10);
        assert_eq!(f.manager.recover_dangling_sessions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_moves_file_after_registration() {
        let f = fixture();
        let path = container_file(&f.temp.path().join("drop"), "external.skr", "ext-1").await;

        let outcome = f.manager.ingest(&path).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ingested("ext-1".into()));
        assert!(!path.exists());
        assert!(f.temp.path().join("ingest-finished/external.skr").exists());
        assert_eq!(
            f.catalog.lookup("ext-1").await.unwrap().unwrap().info.lobby_name,
            "Imported"
        );
        assert!(f.objects.get(&archive_key("ext-1")).is_some());
    }

    #[tokio::test]
    async fn test_ingest_invalid_file_is_rejected() {
        let f = fixture();
        let path = f.temp.path().join("broken.skr");
        std::fs::write(&path, b"not a container").unwrap();

        let err = f.manager.ingest(&path).await.unwrap_err();
        assert!(err.is_invalid_container());
        assert!(path.exists());
        assert_eq!(f.objects.write_count(), 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_overflowing_chunk_index() {
        let f = fixture();
        let header = ContainerHeader {
            id: "huge".into(),
            info: RecordingInfo::default(),
            chunks: vec![ChunkSpan::new(0, u64::MAX), ChunkSpan::new(u64::MAX, 1)],
        };
        let json = serde_json::to_vec(&header).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&crate::archive::ARCHIVE_MAGIC);
        bytes.push(crate::archive::ARCHIVE_VERSION);
        bytes.extend_from_slice(&(crate::archive::HEADER_ENTRY.len() as u16).to_be_bytes());
        bytes.extend_from_slice(crate::archive::HEADER_ENTRY.as_bytes());
        bytes.extend_from_slice(&(json.len() as u64).to_be_bytes());
        bytes.extend_from_slice(&json);
        let path = f.temp.path().join("huge.skr");
        std::fs::write(&path, &bytes).unwrap();

        let err = f.manager.ingest(&path).await.unwrap_err();
        assert!(err.is_invalid_container());
        assert!(path.exists());
        assert!(f.catalog.is_empty());
        assert_eq!(f.objects.write_count(), 0);
    }

    #[tokio::test]
    async fn test_ingest_inbound() {
        let f = fixture();
        let inbound = f.temp.path().join("ingest");
        container_file(&inbound, "a.skr", "rec-a").await;
        container_file(&inbound, "b.SKR", "rec-b").await;
        container_file(&inbound, "dup.skr", "rec-a").await;
        std::fs::write(inbound.join("notes.txt"), b"hello").unwrap();
        std::fs::write(inbound.join("junk.skr"), b"junk").unwrap();

        let report = f.manager.ingest_inbound().await.unwrap();
        assert_eq!(report.ingested, vec!["rec-a", "rec-b"]);
        assert_eq!(report.already_present, vec!["rec-a"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.invalid.len(), 1);

        let mut remaining: Vec<_> = std::fs::read_dir(&inbound)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["junk.skr", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_ingest_inbound_without_directory() {
        let f = fixture();
        let report = f.manager.ingest_inbound().await.unwrap();
        assert!(report.ingested.is_empty());
    }
}
