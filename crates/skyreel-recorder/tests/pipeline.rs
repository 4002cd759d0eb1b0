//! End-to-end tests: record, build, recover, ingest and decode

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use skyreel_core::{
    Catalog, ChunkSpan, Codec, CodecError, ContainerHeader, Event, Ledger, LogRecord,
    Lz4JsonCodec, ManualClock, ObjectStore, RecordingInfo,
};
use skyreel_recorder::{
    ArchiveWriter, BuildOutcome, ContainerBuilder, IngestOutcome, PlaybackContext, Recorder,
    RecorderContext, RecorderResult, RecoveryConfig, RecoveryManager, ReplayLibrary,
    StaticSnapshotSource, archive_key, decode_container, open_archive,
};
use skyreel_storage::{InMemoryCatalog, InMemoryLedger, InMemoryObjectStore, MemorySource};
use tempfile::TempDir;

/// Encodes each event as its method name padded to a fixed width
struct FixedWidthCodec;

const SLOT: usize = 40;

impl Codec for FixedWidthCodec {
    fn encode(&self, events: &[Event]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(events.len() * SLOT);
        for event in events {
            let mut slot = event.method.clone().into_bytes();
            if slot.len() > SLOT {
                return Err(CodecError::Serialization("method too long".into()));
            }
            slot.resize(SLOT, b' ');
            out.extend_from_slice(&slot);
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Event>, CodecError> {
        if bytes.len() % SLOT != 0 {
            return Err(CodecError::Decompression("partial slot".into()));
        }
        bytes
            .chunks_exact(SLOT)
            .map(|slot| {
                let method = std::str::from_utf8(slot)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
                Ok(Event::new("Fixed", method.trim_end(), vec![]))
            })
            .collect()
    }
}

struct Stack {
    ledger: Arc<InMemoryLedger>,
    objects: InMemoryObjectStore,
    catalog: Arc<InMemoryCatalog>,
    builder: Arc<ContainerBuilder>,
    clock: Arc<ManualClock>,
}

impl Stack {
    fn new() -> Self {
        let ledger = Arc::new(InMemoryLedger::new());
        let objects = InMemoryObjectStore::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        let builder = Arc::new(ContainerBuilder::new(
            ledger.clone(),
            Arc::new(objects.clone()),
            catalog.clone(),
        ));
        Self {
            ledger,
            objects,
            catalog,
            builder,
            clock: Arc::new(ManualClock::new(1_000)),
        }
    }

    fn context(&self) -> RecorderContext {
        RecorderContext::new(
            self.ledger.clone(),
            Arc::new(Lz4JsonCodec::new()),
            Arc::new(StaticSnapshotSource::default()),
            self.builder.clone(),
        )
        .with_clock(self.clock.clone())
    }

    fn recovery(&self, dir: &TempDir) -> RecoveryManager {
        RecoveryManager::new(
            self.ledger.clone(),
            Arc::new(self.objects.clone()),
            self.catalog.clone(),
            self.builder.clone(),
            RecoveryConfig::with_data_dir(dir.path()),
        )
        .with_clock(self.clock.clone())
    }

    fn library(&self) -> ReplayLibrary {
        ReplayLibrary::new(
            Arc::new(self.objects.clone()),
            self.catalog.clone(),
            Arc::new(Lz4JsonCodec::new()),
        )
    }
}

fn events(range: std::ops::Range<u32>) -> Vec<Event> {
    range
        .map(|i| Event::new("PlayerVehicle", "Move", vec![json!(i)]).with_entity(format!("v{i}")))
        .collect()
}

async fn record_two_batches(stack: &Stack) -> ContainerHeader {
    let recorder = Recorder::init(stack.context(), "lobby-1", 0).await.unwrap();
    recorder.record_events(events(0..10));
    assert_eq!(recorder.flush().await.unwrap(), 10);
    recorder.record_events(events(10..25));
    assert_eq!(recorder.flush().await.unwrap(), 15);
    stack.clock.set(9_000);

    match recorder.stop().await.unwrap() {
        Some(BuildOutcome::Finalized(header)) => header,
        other => panic!("expected a finalized container, got {other:?}"),
    }
}

#[tokio::test]
async fn test_two_flushes_make_two_chunks() {
    let stack = Stack::new();
    let header = record_two_batches(&stack).await;

    assert_eq!(header.chunks.len(), 2);
    assert_eq!(header.info.duration, 8_000);
    assert!(stack.ledger.sessions_with_init().await.unwrap().is_empty());

    let mut out: Vec<Event> = Vec::new();
    let summary = stack.library().read_events(&header.id, &mut out).await.unwrap();
    assert_eq!(summary.events, 25);
    assert_eq!(summary.chunks_decoded, 2);
    let args: Vec<_> = out.iter().map(|e| e.args[0].as_u64().unwrap()).collect();
    assert_eq!(args, (0..25).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_decoding_is_independent_of_fragmentation() {
    let stack = Stack::new();
    let header = record_two_batches(&stack).await;
    let archive = stack.objects.get(&archive_key(&header.id)).unwrap();
    let codec = Lz4JsonCodec::new();

    let mut outputs = Vec::new();
    for fragment in [1, 17, archive.len()] {
        let (header, mut body) = open_archive(Box::new(MemorySource::new(archive.clone(), fragment)))
            .await
            .unwrap();
        let mut out: Vec<Event> = Vec::new();
        decode_container(&header, &mut body, &codec, &mut out).await.unwrap();
        outputs.push(out);
    }

    assert_eq!(outputs[0].len(), 25);
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn test_uneven_chunks_in_small_fragments() {
    let codec = FixedWidthCodec;
    let first = codec
        .encode(&[
            Event::new("Fixed", "a", vec![]),
            Event::new("Fixed", "b", vec![]),
            Event::new("Fixed", "c", vec![]),
        ])
        .unwrap();
    let second = codec
        .encode(&[Event::new("Fixed", "d", vec![]), Event::new("Fixed", "e", vec![])])
        .unwrap();
    assert_eq!((first.len(), second.len()), (120, 80));

    let header = ContainerHeader {
        id: "fixed".into(),
        info: RecordingInfo::default(),
        chunks: vec![ChunkSpan::new(0, 120), ChunkSpan::new(120, 80)],
    };
    let mut body = first.clone();
    body.extend_from_slice(&second);

    let mut seen: Vec<String> = Vec::new();
    let mut sink = |event: &Event, _ctx: &PlaybackContext| -> RecorderResult<()> {
        seen.push(event.method.clone());
        Ok(())
    };
    let mut source = MemorySource::new(Bytes::from(body), 7);
    let summary = decode_container(&header, &mut source, &codec, &mut sink)
        .await
        .unwrap();

    assert_eq!(summary.chunks_decoded, 2);
    assert_eq!(summary.events, 5);
    assert!(!summary.truncated);
    assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn test_incomplete_session_is_deferred_untouched() {
    let stack = Stack::new();
    stack
        .ledger
        .append(&LogRecord::init("s1", "lobby-1", "{}".into(), 0))
        .await
        .unwrap();
    stack
        .ledger
        .append(&LogRecord::packet("s1", "lobby-1", b"zz", 5))
        .await
        .unwrap();
    let before = stack.ledger.records("s1");

    let outcome = stack.builder.build("s1").await.unwrap();
    assert!(matches!(outcome, BuildOutcome::Deferred));
    assert_eq!(stack.ledger.records("s1"), before);
    assert_eq!(stack.objects.write_count(), 0);
}

#[tokio::test]
async fn test_recovery_closes_dangling_session_once() {
    let stack = Stack::new();
    let dir = TempDir::new().unwrap();
    let recovery = stack.recovery(&dir);

    let recorder = Recorder::init(stack.context(), "lobby-1", 0).await.unwrap();
    recorder.record_events(events(0..3));
    stack.clock.set(4_000);
    recorder.flush().await.unwrap();
    let session_id = recorder.session_id().to_string();
    // Process dies without stopping
    drop(recorder);

    stack.clock.set(60_000);
    assert_eq!(recovery.recover_dangling_sessions().await.unwrap(), 1);
    let header = stack.catalog.lookup(&session_id).await.unwrap().unwrap();
    assert_eq!(header.info.duration, 3_000);
    assert_eq!(header.chunks.len(), 1);

    let writes = stack.objects.write_count();
    assert_eq!(recovery.recover_dangling_sessions().await.unwrap(), 0);
    assert_eq!(stack.objects.write_count(), writes);
}

#[tokio::test]
async fn test_failed_upload_keeps_session_for_recovery() {
    let stack = Stack::new();
    let dir = TempDir::new().unwrap();

    let recorder = Recorder::init(stack.context(), "lobby-1", 0).await.unwrap();
    recorder.record_events(events(0..4));
    stack.objects.set_fail_writes(true);
    assert!(recorder.stop().await.is_err());

    let session_id = recorder.session_id().to_string();
    assert_eq!(stack.ledger.sessions_with_init().await.unwrap(), vec![session_id.clone()]);
    assert!(stack.catalog.lookup(&session_id).await.unwrap().is_none());

    stack.objects.set_fail_writes(false);
    assert_eq!(stack.recovery(&dir).recover_dangling_sessions().await.unwrap(), 1);

    let mut out: Vec<Event> = Vec::new();
    stack.library().read_events(&session_id, &mut out).await.unwrap();
    assert_eq!(out.len(), 4);
}

#[tokio::test]
async fn test_ingest_twice_writes_once() {
    // Produce a container elsewhere
    let origin = Stack::new();
    let header = record_two_batches(&origin).await;
    let archive = origin.objects.get(&archive_key(&header.id)).unwrap();

    let stack = Stack::new();
    let dir = TempDir::new().unwrap();
    let recovery = stack.recovery(&dir);
    let path = dir.path().join("upload.skr");

    std::fs::write(&path, &archive).unwrap();
    assert_eq!(
        recovery.ingest(&path).await.unwrap(),
        IngestOutcome::Ingested(header.id.clone())
    );
    let writes = stack.objects.write_count();

    std::fs::write(&path, &archive).unwrap();
    assert_eq!(
        recovery.ingest(&path).await.unwrap(),
        IngestOutcome::AlreadyExists(header.id.clone())
    );
    assert_eq!(stack.objects.write_count(), writes);
    assert_eq!(stack.objects.get(&archive_key(&header.id)).unwrap(), archive);

    let mut out: Vec<Event> = Vec::new();
    stack.library().read_events(&header.id, &mut out).await.unwrap();
    assert_eq!(out.len(), 25);
}

#[tokio::test]
async fn test_short_body_never_published() {
    let stack = Stack::new();
    let header = ContainerHeader {
        id: "short".into(),
        info: RecordingInfo::default(),
        chunks: vec![ChunkSpan::new(0, 10)],
    };
    let sink = stack
        .objects
        .write_stream(&archive_key("short"))
        .await
        .unwrap();
    let mut writer = ArchiveWriter::begin(sink, &header).await.unwrap();
    writer.write_body(b"12345").await.unwrap();
    assert!(writer.finish().await.is_err());
    assert!(stack.objects.get(&archive_key("short")).is_none());
}
