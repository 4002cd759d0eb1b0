//! File-backed recording storage and the operations the CLI runs on it

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, instrument};

use skyreel_core::{CatalogFilter, Event, HeaderSummary, Ledger, Lz4JsonCodec};
use skyreel_recorder::{
    ContainerBuilder, DecodeSummary, ExtractionConfig, ExtractionPool, InboundReport,
    IngestOutcome, PlaybackContext, RecorderError, RecorderResult, RecoveryManager, ReplayLibrary,
    WorkerMessage,
};
use skyreel_storage::{FileLedger, FsObjectStore, RedbCatalog};

use crate::config::ServiceConfig;

/// What `recover` did
#[derive(Debug)]
pub struct RecoverReport {
    pub finalized: usize,
    pub inbound: InboundReport,
}

/// Storage collaborators opened from a [`ServiceConfig`]
pub struct Service {
    ledger: Arc<FileLedger>,
    library: Arc<ReplayLibrary>,
    recovery: RecoveryManager,
    extraction: ExtractionConfig,
}

impl Service {
    /// Open (creating if needed) the ledger, object store and catalog
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(config: &ServiceConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let ledger = Arc::new(FileLedger::open(config.ledger_config()).await?);
        let objects = Arc::new(FsObjectStore::new(config.object_store_config()).await?);
        let catalog = Arc::new(RedbCatalog::open(config.catalog_config())?);
        let codec = Arc::new(Lz4JsonCodec::new());

        let builder = Arc::new(ContainerBuilder::new(
            ledger.clone(),
            objects.clone(),
            catalog.clone(),
        ));
        let library = Arc::new(ReplayLibrary::new(objects.clone(), catalog.clone(), codec));
        let recovery = RecoveryManager::new(
            ledger.clone(),
            objects,
            catalog,
            builder,
            config.recovery_config(),
        );

        info!("Storage opened");
        Ok(Self {
            ledger,
            library,
            recovery,
            extraction: config.extraction_config(),
        })
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    pub fn library(&self) -> &ReplayLibrary {
        &self.library
    }

    /// Finalize dangling sessions, then ingest the inbound directory
    pub async fn recover(&self) -> RecorderResult<RecoverReport> {
        let finalized = self.recovery.recover_dangling_sessions().await?;
        let inbound = self.recovery.ingest_inbound().await?;
        Ok(RecoverReport { finalized, inbound })
    }

    pub async fn ingest(&self, path: &Path) -> RecorderResult<IngestOutcome> {
        self.recovery.ingest(path).await
    }

    pub async fn list(&self, filter: &CatalogFilter) -> RecorderResult<Vec<HeaderSummary>> {
        self.library.list(filter).await
    }

    /// Decode a container to `out`, one JSON object per line
    pub async fn dump(
        &self,
        id: &str,
        out: &mut (dyn Write + Send),
    ) -> RecorderResult<DecodeSummary> {
        let mut sink = |event: &Event, _ctx: &PlaybackContext| -> RecorderResult<()> {
            serde_json::to_writer(&mut *out, event)
                .map_err(|e| RecorderError::Io(e.to_string()))?;
            out.write_all(b"\n")?;
            Ok(())
        };
        let summary = self.library.read_events(id, &mut sink).await?;
        out.flush()?;
        Ok(summary)
    }

    /// Start extraction over every catalogued container
    ///
    /// Returns the number of containers and the worker message stream.
    pub async fn extract(&self) -> RecorderResult<(usize, mpsc::Receiver<WorkerMessage>)> {
        let ids = self.library.all_ids().await?;
        let count = ids.len();
        let pool = ExtractionPool::new(Arc::clone(&self.library), self.extraction.clone());
        Ok((count, pool.run(ids)))
    }
}
