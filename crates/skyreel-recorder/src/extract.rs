//! Metadata extraction over finalized containers
//!
//! [`MetadataExtractor`] is an ordinary [`EventSink`]; the listener and the
//! pool only differ in where container ids come from.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use skyreel_core::{ByteSource, Event, KnownEvent, PlayerInfo, RecordingMetadata};

use crate::builder::ContainerFinalized;
use crate::config::ExtractionConfig;
use crate::decoder::{ChunkDecoder, EventSink, PlaybackContext};
use crate::error::RecorderResult;
use crate::library::ReplayLibrary;

/// Collects [`RecordingMetadata`] from a decoded event stream
#[derive(Debug, Default)]
pub struct MetadataExtractor {
    total_events: u64,
    net_instantiates: u64,
    players: Vec<PlayerInfo>,
    seen_players: HashSet<String>,
}

impl MetadataExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_metadata(self) -> RecordingMetadata {
        RecordingMetadata {
            players: self.players,
            net_instantiates: self.net_instantiates,
            total_events: self.total_events,
        }
    }
}

impl EventSink for MetadataExtractor {
    fn on_event(&mut self, event: &Event, _context: &PlaybackContext) -> RecorderResult<()> {
        self.total_events += 1;
        match KnownEvent::decode(event) {
            Ok(KnownEvent::NetInstantiate { .. }) => self.net_instantiates += 1,
            Ok(KnownEvent::LobbyInfo(lobby)) => {
                for player in lobby.players {
                    if self.seen_players.insert(player.id.clone()) {
                        self.players.push(player);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => trace!(error = %e, "Skipping malformed event"),
        }
        Ok(())
    }
}

/// Decode one container and collect its metadata
pub async fn extract_metadata(
    library: &ReplayLibrary,
    id: &str,
) -> RecorderResult<RecordingMetadata> {
    let mut extractor = MetadataExtractor::new();
    library.read_events(id, &mut extractor).await?;
    Ok(extractor.into_metadata())
}

/// Extract and attach metadata for every finalized container
///
/// Runs until `shutdown_rx` fires or the notification channel closes.
pub fn spawn_metadata_listener(
    mut finalized_rx: broadcast::Receiver<ContainerFinalized>,
    library: Arc<ReplayLibrary>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Metadata listener started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Metadata listener shutting down");
                    break;
                }
                received = finalized_rx.recv() => match received {
                    Ok(finalized) => {
                        let id = finalized.header.id;
                        let attached = match extract_metadata(&library, &id).await {
                            Ok(metadata) => library.attach_metadata(&id, metadata).await,
                            Err(e) => Err(e),
                        };
                        match attached {
                            Ok(()) => info!(container_id = %id, "Metadata attached"),
                            Err(e) => error!(container_id = %id, error = %e, "Metadata extraction failed"),
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metadata listener lagged behind finalized containers");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Message from an extraction worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Body bytes decoded so far
    Progress {
        worker_id: usize,
        current: u64,
        total: u64,
    },
    /// The worker is done; metadata is attached on success
    Finished {
        worker_id: usize,
        container_id: String,
        result: RecorderResult<RecordingMetadata>,
    },
}

/// Bounded pool running one extraction worker per container
pub struct ExtractionPool {
    library: Arc<ReplayLibrary>,
    config: ExtractionConfig,
}

impl ExtractionPool {
    pub fn new(library: Arc<ReplayLibrary>, config: ExtractionConfig) -> Self {
        Self { library, config }
    }

    /// Start extracting `ids`
    ///
    /// Worker ids are indexes into `ids`. The channel closes after the last
    /// worker has sent `Finished`.
    pub fn run(&self, ids: Vec<String>) -> mpsc::Receiver<WorkerMessage> {
        let (tx, rx) = mpsc::channel(self.config.message_capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let library = Arc::clone(&self.library);

        tokio::spawn(async move {
            debug!(containers = ids.len(), "Extraction pool started");
            for (worker_id, container_id) in ids.into_iter().enumerate() {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                let library = Arc::clone(&library);
                let tx = tx.clone();

                tokio::spawn(async move {
                    let mut result = extract_with_progress(&library, &container_id, worker_id, &tx).await;
                    if let Ok(metadata) = &result {
                        if let Err(e) = library.attach_metadata(&container_id, metadata.clone()).await {
                            result = Err(e);
                        }
                    }
                    if let Err(e) = &result {
                        warn!(container_id = %container_id, error = %e, "Extraction worker failed");
                    }
                    // Receiver gone means nobody is waiting for the result
                    let _ = tx
                        .send(WorkerMessage::Finished {
                            worker_id,
                            container_id,
                            result,
                        })
                        .await;
                    drop(permit);
                });
            }
        });

        rx
    }

    /// Run every worker and collect the results in input order
    pub async fn run_to_completion(
        &self,
        ids: Vec<String>,
    ) -> Vec<(String, RecorderResult<RecordingMetadata>)> {
        let count = ids.len();
        let mut rx = self.run(ids);
        let mut results: Vec<Option<(String, RecorderResult<RecordingMetadata>)>> =
            (0..count).map(|_| None).collect();

        while let Some(message) = rx.recv().await {
            if let WorkerMessage::Finished {
                worker_id,
                container_id,
                result,
            } = message
            {
                results[worker_id] = Some((container_id, result));
            }
        }
        results.into_iter().flatten().collect()
    }
}

async fn extract_with_progress(
    library: &ReplayLibrary,
    container_id: &str,
    worker_id: usize,
    tx: &mpsc::Sender<WorkerMessage>,
) -> RecorderResult<RecordingMetadata> {
    let (header, mut body) = library.open_body(container_id).await?;
    let mut extractor = MetadataExtractor::new();
    let mut decoder = ChunkDecoder::new(&header, library.codec());
    let total = decoder.total();

    while let Some(fragment) = body.next_fragment().await? {
        decoder.push(&fragment, &mut extractor)?;
        let progress = WorkerMessage::Progress {
            worker_id,
            current: decoder.received(),
            total,
        };
        if tx.send(progress).await.is_err() {
            trace!(worker_id, "Progress receiver dropped");
        }
    }
    decoder.finish(&mut extractor)?;

    Ok(extractor.into_metadata())
}
