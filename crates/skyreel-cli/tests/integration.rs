use serde_json::json;
use skyreel_cli::{Service, ServiceConfig};
use skyreel_core::{CatalogFilter, Codec, Event, Ledger, LogRecord, Lz4JsonCodec};
use skyreel_recorder::{IngestOutcome, WorkerMessage, archive_key};
use tempfile::TempDir;

fn config(dir: &TempDir) -> ServiceConfig {
    let mut config = ServiceConfig::with_data_dir(dir.path());
    config.ledger.sync_on_write = false;
    config
}

/// Leave a dangling session behind, as a crashed recorder would
async fn seed_dangling_session(service: &Service, session_id: &str, events: usize) {
    let ledger = service.ledger();
    ledger
        .append(&LogRecord::init(session_id, "lobby-1", "{}".into(), 10_000))
        .await
        .unwrap();

    let batch: Vec<Event> = (0..events)
        .map(|i| Event::new("PlayerVehicle", "Move", vec![json!(i)]).with_timestamp(10_000 + i as i64))
        .collect();
    let bytes = Lz4JsonCodec::new().encode(&batch).unwrap();
    ledger
        .append(&LogRecord::packet(session_id, "lobby-1", &bytes, 25_000))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_recover_list_dump() {
    let dir = TempDir::new().unwrap();
    let service = Service::open(&config(&dir)).await.unwrap();
    seed_dangling_session(&service, "session-a", 12).await;

    let report = service.recover().await.unwrap();
    assert_eq!(report.finalized, 1);
    assert!(report.inbound.ingested.is_empty());

    let listed = service.list(&CatalogFilter::all()).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "session-a");
    assert_eq!(listed[0].info.duration, 15_000);

    let mut out: Vec<u8> = Vec::new();
    let summary = service.dump("session-a", &mut out).await.unwrap();
    assert_eq!(summary.events, 12);

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 12);
    let first: Event = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.method, "Move");
    assert_eq!(first.args, vec![json!(0)]);

    // Nothing left to recover
    assert_eq!(service.recover().await.unwrap().finalized, 0);
}

#[tokio::test]
async fn test_reopen_after_recovery() {
    let dir = TempDir::new().unwrap();
    {
        let service = Service::open(&config(&dir)).await.unwrap();
        seed_dangling_session(&service, "session-b", 3).await;
    }

    let service = Service::open(&config(&dir)).await.unwrap();
    assert_eq!(service.recover().await.unwrap().finalized, 1);
    assert!(service.library().read_header("session-b").await.unwrap().is_some());
}

#[tokio::test]
async fn test_extract_attaches_metadata() {
    let dir = TempDir::new().unwrap();
    let service = Service::open(&config(&dir)).await.unwrap();
    seed_dangling_session(&service, "session-c", 5).await;
    service.recover().await.unwrap();

    let (count, mut messages) = service.extract().await.unwrap();
    assert_eq!(count, 1);

    let mut finished = 0;
    while let Some(message) = messages.recv().await {
        if let WorkerMessage::Finished { result, .. } = message {
            assert_eq!(result.unwrap().total_events, 5);
            finished += 1;
        }
    }
    assert_eq!(finished, 1);

    let header = service.library().read_header("session-c").await.unwrap().unwrap();
    let listed = service.list(&CatalogFilter::all()).await.unwrap();
    assert_eq!(header.id, listed[0].id);
    assert_eq!(listed[0].info.metadata.as_ref().unwrap().total_events, 5);
}

#[tokio::test]
async fn test_ingest_from_another_installation() {
    let origin_dir = TempDir::new().unwrap();
    let origin = Service::open(&config(&origin_dir)).await.unwrap();
    seed_dangling_session(&origin, "session-d", 4).await;
    origin.recover().await.unwrap();
    let archive = origin_dir
        .path()
        .join("objects")
        .join(archive_key("session-d"));

    let dir = TempDir::new().unwrap();
    let service = Service::open(&config(&dir)).await.unwrap();
    let inbound = dir.path().join("ingest");
    std::fs::create_dir_all(&inbound).unwrap();
    std::fs::copy(&archive, inbound.join("session-d.skr")).unwrap();

    let report = service.recover().await.unwrap();
    assert_eq!(report.inbound.ingested, vec!["session-d"]);
    assert!(dir.path().join("ingest-finished/session-d.skr").exists());

    let copy = dir.path().join("again.skr");
    std::fs::copy(&archive, &copy).unwrap();
    assert_eq!(
        service.ingest(&copy).await.unwrap(),
        IngestOutcome::AlreadyExists("session-d".into())
    );

    let mut out: Vec<u8> = Vec::new();
    assert_eq!(service.dump("session-d", &mut out).await.unwrap().events, 4);
}
