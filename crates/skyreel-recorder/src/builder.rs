//! Container builder
//!
//! Compiles a finished session's ledger history into an archived container.
//! The build is two streaming passes over the ledger: the first validates
//! the session and sizes every chunk, the second copies packet bytes into
//! the archive body. Nothing is deleted from the ledger until the archive,
//! the header document, and the catalog entry are all in place, so a build
//! interrupted at any point can simply be run again.

use std::sync::Arc;

use dashmap::DashMap;
use futures::TryStreamExt;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, warn};

use skyreel_core::{
    Catalog, ChunkIndex, ContainerHeader, Ledger, LogRecord, ObjectStore, RecordKind,
    RecordingInfo, ResyncSnapshot,
};

use crate::archive::{ArchiveWriter, archive_key, header_key};
use crate::error::{RecorderError, RecorderResult};

/// Default capacity of the finalized-notification channel
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Result of a build attempt
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// The container is archived, catalogued, and the ledger cleared
    Finalized(ContainerHeader),
    /// The session is not complete yet; nothing was written
    Deferred,
}

impl BuildOutcome {
    pub fn header(&self) -> Option<&ContainerHeader> {
        match self {
            Self::Finalized(header) => Some(header),
            Self::Deferred => None,
        }
    }
}

/// Broadcast after a container is published
#[derive(Debug, Clone)]
pub struct ContainerFinalized {
    pub lobby_id: String,
    pub header: ContainerHeader,
}

/// What the validation pass learned about a session
#[derive(Default)]
struct LedgerScan {
    records: usize,
    init: Option<LogRecord>,
    init_count: usize,
    stop: Option<LogRecord>,
    stop_count: usize,
    chunks: ChunkIndex,
}

/// Builds containers from ledger sessions
pub struct ContainerBuilder {
    ledger: Arc<dyn Ledger>,
    objects: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    /// Per-session build slots
    building: DashMap<String, Arc<Mutex<()>>>,
    finalized_tx: broadcast::Sender<ContainerFinalized>,
}

impl ContainerBuilder {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        objects: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self::with_event_capacity(ledger, objects, catalog, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        ledger: Arc<dyn Ledger>,
        objects: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
        capacity: usize,
    ) -> Self {
        let (finalized_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            ledger,
            objects,
            catalog,
            building: DashMap::new(),
            finalized_tx,
        }
    }

    /// Subscribe to container finalized notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerFinalized> {
        self.finalized_tx.subscribe()
    }

    /// Build the container for a session
    ///
    /// Concurrent calls for the same session run one after another; a
    /// repeat call after a successful build returns the catalogued header.
    #[instrument(skip(self))]
    pub async fn build(&self, session_id: &str) -> RecorderResult<BuildOutcome> {
        let slot = self
            .building
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = slot.lock().await;
            self.build_exclusive(session_id).await
        };
        drop(slot);
        self.building
            .remove_if(session_id, |_, slot| Arc::strong_count(slot) == 1);
        result
    }

    async fn build_exclusive(&self, session_id: &str) -> RecorderResult<BuildOutcome> {
        let scan = self.scan(session_id).await?;

        if scan.records == 0 {
            if let Some(header) = self.catalog.lookup(session_id).await? {
                debug!("Session already finalized");
                return Ok(BuildOutcome::Finalized(header));
            }
        }

        let (init, stop) = match (scan.init, scan.stop) {
            (Some(init), Some(stop)) if scan.init_count == 1 && scan.stop_count == 1 => {
                (init, stop)
            }
            _ => {
                debug!(
                    records = scan.records,
                    inits = scan.init_count,
                    stops = scan.stop_count,
                    "Session incomplete, deferring build"
                );
                return Ok(BuildOutcome::Deferred);
            }
        };

        let header = ContainerHeader {
            id: session_id.to_string(),
            info: recording_info(session_id, &init, stop.timestamp),
            chunks: scan.chunks.into_chunks(),
        };

        self.write_archive(&header).await?;
        let header_json = serde_json::to_string_pretty(&header)?;
        self.objects
            .write_text(&header_key(session_id), &header_json)
            .await?;
        self.catalog.register(&header).await?;

        // Only now is the ledger history redundant
        self.ledger.delete_all(session_id).await?;

        info!(
            container_id = %header.id,
            lobby_id = %init.lobby_id,
            chunks = header.chunks.len(),
            body_len = header.body_len(),
            duration_ms = header.info.duration,
            "Container finalized"
        );

        // No subscribers is fine
        let _ = self.finalized_tx.send(ContainerFinalized {
            lobby_id: init.lobby_id,
            header: header.clone(),
        });

        Ok(BuildOutcome::Finalized(header))
    }

    /// First pass: count lifecycle records and size every packet
    async fn scan(&self, session_id: &str) -> RecorderResult<LedgerScan> {
        let mut scan = LedgerScan::default();
        let mut records = self.ledger.stream_records(session_id).await?;

        while let Some(record) = records.try_next().await? {
            scan.records += 1;
            match record.kind {
                RecordKind::Init => {
                    scan.init_count += 1;
                    scan.init.get_or_insert(record);
                }
                RecordKind::Packet => {
                    if scan.stop.is_some() {
                        warn!(record_id = %record.id, "Packet recorded after stop marker");
                    }
                    let length = record.packet_bytes()?.len() as u64;
                    scan.chunks
                        .push(length)
                        .map_err(|e| RecorderError::MalformedHeader(e.to_string()))?;
                }
                RecordKind::Event if record.is_stop_marker() => {
                    scan.stop_count += 1;
                    scan.stop.get_or_insert(record);
                }
                RecordKind::Event => {
                    debug!(payload = %record.payload, "Ignoring lifecycle record");
                }
            }
        }
        Ok(scan)
    }

    /// Second pass: stream packet bytes into the archive
    async fn write_archive(&self, header: &ContainerHeader) -> RecorderResult<()> {
        let sink = self.objects.write_stream(&archive_key(&header.id)).await?;
        let mut writer = ArchiveWriter::begin(sink, header).await?;
        let mut records = self.ledger.stream_records(&header.id).await?;
        let mut chunks = header.chunks.iter();

        while let Some(record) = records.try_next().await? {
            if record.kind != RecordKind::Packet {
                continue;
            }
            let bytes = record.packet_bytes()?;
            match chunks.next() {
                Some(chunk) if chunk.length == bytes.len() as u64 => {
                    writer.write_body(&bytes).await?;
                }
                _ => return Err(RecorderError::LedgerChanged(header.id.clone())),
            }
        }
        if chunks.next().is_some() {
            return Err(RecorderError::LedgerChanged(header.id.clone()));
        }

        writer.finish().await
    }
}

/// Derive the recording info from the `Init` snapshot and the stop time
fn recording_info(session_id: &str, init: &LogRecord, stop_timestamp: i64) -> RecordingInfo {
    let mut duration = stop_timestamp.saturating_sub(init.timestamp);
    if duration < 0 {
        warn!(
            init = init.timestamp,
            stop = stop_timestamp,
            "Stop marker predates init, recording duration set to 0"
        );
        duration = 0;
    }
    let mut info = RecordingInfo {
        lobby_id: init.lobby_id.clone(),
        recording_id: session_id.to_string(),
        start_time: init.timestamp,
        duration,
        ..Default::default()
    };

    let snapshot: ResyncSnapshot = match serde_json::from_str(&init.payload) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Unreadable init snapshot, recording info left empty");
            return info;
        }
    };

    match snapshot.lobby() {
        Ok(Some(lobby)) => {
            info.lobby_name = lobby.name;
            info.host_id = lobby.host_id;
            info.host_name = lobby.host_name;
        }
        Ok(None) => warn!("Init snapshot has no lobby info"),
        Err(e) => warn!(error = %e, "Malformed lobby info in init snapshot"),
    }

    match snapshot.mission() {
        Ok(Some(mission)) => {
            info.mission_name = mission.name;
            info.mission_id = mission.mission_id;
            info.campaign_id = mission.campaign_id;
            info.workshop_id = mission.workshop_id;
            info.map = mission.map;
        }
        Ok(None) => warn!("Init snapshot has no mission info"),
        Err(e) => warn!(error = %e, "Malformed mission info in init snapshot"),
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyreel_core::{Event, LOBBY_CLASS, UPDATE_LOBBY_INFO, UPDATE_MISSION_INFO};
    use skyreel_storage::{InMemoryCatalog, InMemoryLedger, InMemoryObjectStore};

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        objects: InMemoryObjectStore,
        catalog: Arc<InMemoryCatalog>,
        builder: ContainerBuilder,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let objects = InMemoryObjectStore::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        let builder = ContainerBuilder::new(
            ledger.clone(),
            Arc::new(objects.clone()),
            catalog.clone(),
        );
        Fixture {
            ledger,
            objects,
            catalog,
            builder,
        }
    }

    fn snapshot_json() -> String {
        let snapshot = ResyncSnapshot {
            lobby_info: Some(Event::new(
                LOBBY_CLASS,
                UPDATE_LOBBY_INFO,
                vec![
                    json!("Friday Ops"),
                    json!(null),
                    json!(null),
                    json!(null),
                    json!(null),
                    json!(null),
                    json!([]),
                    json!("host-1"),
                    json!("Viper"),
                ],
            )),
            mission_info: Some(Event::new(
                LOBBY_CLASS,
                UPDATE_MISSION_INFO,
                vec![json!("Red Flag"), json!("rf-01"), json!(null), json!(null), json!("Akutan")],
            )),
        };
        serde_json::to_string(&snapshot).unwrap()
    }

    async fn append(ledger: &InMemoryLedger, record: LogRecord) {
        ledger.append(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_build_complete_session() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", snapshot_json(), 1_000)).await;
        append(&f.ledger, LogRecord::packet("s1", "lobby-1", b"first", 1_500)).await;
        append(&f.ledger, LogRecord::packet("s1", "lobby-1", b"second!", 2_000)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 4_000)).await;
        let mut finalized = f.builder.subscribe();

        let header = match f.builder.build("s1").await.unwrap() {
            BuildOutcome::Finalized(header) => header,
            BuildOutcome::Deferred => panic!("expected a container"),
        };

        assert_eq!(header.chunks.len(), 2);
        assert_eq!(header.chunks[1].start, 5);
        assert_eq!(header.body_len(), 12);
        assert_eq!(header.info.duration, 3_000);
        assert_eq!(header.info.lobby_name, "Friday Ops");
        assert_eq!(header.info.mission_name, "Red Flag");
        assert_eq!(header.info.map.as_deref(), Some("Akutan"));
        assert_eq!(header.info.host_name.as_deref(), Some("Viper"));

        assert!(f.objects.get(&archive_key("s1")).is_some());
        assert!(f.objects.get(&header_key("s1")).is_some());
        assert_eq!(f.catalog.lookup("s1").await.unwrap(), Some(header.clone()));
        assert!(f.ledger.records("s1").is_empty());

        let event = finalized.recv().await.unwrap();
        assert_eq!(event.lobby_id, "lobby-1");
        assert_eq!(event.header, header);
    }

    #[tokio::test]
    async fn test_incomplete_session_is_deferred() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", snapshot_json(), 0)).await;
        append(&f.ledger, LogRecord::packet("s1", "lobby-1", b"data", 1)).await;
        let before = f.ledger.records("s1");

        assert_eq!(f.builder.build("s1").await.unwrap(), BuildOutcome::Deferred);
        assert_eq!(f.ledger.records("s1"), before);
        assert_eq!(f.objects.write_count(), 0);
        assert!(f.catalog.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_stop_is_deferred() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", snapshot_json(), 0)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 5)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 6)).await;

        assert_eq!(f.builder.build("s1").await.unwrap(), BuildOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_rebuild_returns_catalogued_header() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", snapshot_json(), 0)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 10)).await;

        let first = f.builder.build("s1").await.unwrap();
        let writes = f.objects.write_count();
        let second = f.builder.build("s1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.header().unwrap().body_len(), 0);
        assert_eq!(f.objects.write_count(), writes);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_ledger() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", snapshot_json(), 0)).await;
        append(&f.ledger, LogRecord::packet("s1", "lobby-1", b"data", 1)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 2)).await;
        f.objects.set_fail_writes(true);

        assert!(f.builder.build("s1").await.is_err());
        assert_eq!(f.ledger.records("s1").len(), 3);
        assert!(f.catalog.is_empty());

        f.objects.set_fail_writes(false);
        assert!(f.builder.build("s1").await.unwrap().header().is_some());
        assert!(f.ledger.records("s1").is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_init_gives_zero_duration() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", snapshot_json(), 9_000)).await;
        append(&f.ledger, LogRecord::packet("s1", "lobby-1", b"data", 9_500)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 7_000)).await;

        let outcome = f.builder.build("s1").await.unwrap();
        let header = outcome.header().unwrap();
        assert_eq!(header.info.start_time, 9_000);
        assert_eq!(header.info.duration, 0);
        assert_eq!(header.info.lobby_name, "Friday Ops");
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_still_builds() {
        let f = fixture();
        append(&f.ledger, LogRecord::init("s1", "lobby-1", "not json".into(), 100)).await;
        append(&f.ledger, LogRecord::stop("s1", "lobby-1", 50)).await;

        let outcome = f.builder.build("s1").await.unwrap();
        let header = outcome.header().unwrap();
        assert_eq!(header.info.lobby_id, "lobby-1");
        assert_eq!(header.info.lobby_name, "");
        assert_eq!(header.info.duration, 0);
    }
}
