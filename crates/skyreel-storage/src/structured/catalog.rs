//! redb-backed container catalog

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, instrument};

use skyreel_core::{
    Catalog, CatalogFilter, ContainerHeader, HeaderSummary, RecordingMetadata, StorageError,
};

// Key: container id bytes, Value: postcard ContainerHeader
pub const RECORDINGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("recordings");

/// Configuration for [`RedbCatalog`]
#[derive(Debug, Clone)]
pub struct RedbCatalogConfig {
    /// Path to the database file
    pub db_path: PathBuf,
}

impl Default for RedbCatalogConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/catalog.redb"),
        }
    }
}

impl RedbCatalogConfig {
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

/// Catalog of finalized containers stored in a redb table
pub struct RedbCatalog {
    db: Arc<Database>,
}

impl RedbCatalog {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbCatalogConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db =
            Database::create(&config.db_path).map_err(|e| StorageError::Database(e.to_string()))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        write_txn
            .open_table(RECORDINGS)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        info!("Opened catalog database");
        Ok(Self { db: Arc::new(db) })
    }

    fn put(&self, header: &ContainerHeader) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(header)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(RECORDINGS)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            table
                .insert(header.id.as_bytes(), value.as_slice())
                .map_err(|e| StorageError::Database(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<ContainerHeader>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let table = read_txn
            .open_table(RECORDINGS)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let Some(value) = table
            .get(id.as_bytes())
            .map_err(|e| StorageError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        postcard::from_bytes(value.value())
            .map(Some)
            .map_err(|e| StorageError::Deserialization(e.to_string()))
    }

    fn all(&self) -> Result<Vec<ContainerHeader>, StorageError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let table = read_txn
            .open_table(RECORDINGS)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut headers = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let (_, value) = entry.map_err(|e| StorageError::Database(e.to_string()))?;
            let header = postcard::from_bytes(value.value())
                .map_err(|e| StorageError::Deserialization(e.to_string()))?;
            headers.push(header);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Catalog for RedbCatalog {
    #[instrument(skip(self, header), fields(container_id = %header.id))]
    async fn register(&self, header: &ContainerHeader) -> Result<(), StorageError> {
        self.put(header)?;
        debug!(chunks = header.chunks.len(), "Registered container");
        Ok(())
    }

    async fn lookup(&self, id: &str) -> Result<Option<ContainerHeader>, StorageError> {
        self.get(id)
    }

    async fn list(&self, filter: &CatalogFilter) -> Result<Vec<HeaderSummary>, StorageError> {
        let headers = self.all()?;
        Ok(filter.apply(headers.iter()))
    }

    #[instrument(skip(self, metadata), fields(container_id = %id))]
    async fn attach_metadata(
        &self,
        id: &str,
        metadata: RecordingMetadata,
    ) -> Result<(), StorageError> {
        let mut header = self.get(id)?.ok_or_else(|| StorageError::not_found(id))?;
        header.info.metadata = Some(metadata);
        self.put(&header)?;
        debug!("Attached metadata");
        Ok(())
    }
}
