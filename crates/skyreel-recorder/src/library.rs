//! Retrieval of finalized containers

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use skyreel_core::{
    Catalog, CatalogFilter, Codec, ContainerHeader, HeaderSummary, ObjectStore, RecordingMetadata,
};

use crate::archive::{BodySource, archive_key, header_key, open_archive, read_archive_header};
use crate::decoder::{DecodeSummary, EventSink, decode_container};
use crate::error::RecorderResult;

/// Read access to archived containers and their catalog entries
pub struct ReplayLibrary {
    objects: Arc<dyn ObjectStore>,
    catalog: Arc<dyn Catalog>,
    codec: Arc<dyn Codec>,
}

impl ReplayLibrary {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        catalog: Arc<dyn Catalog>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            objects,
            catalog,
            codec,
        }
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    /// Header of a container, without reading its body
    ///
    /// Falls back to the archive's header entry when the header document is
    /// missing, and writes the document back for next time.
    #[instrument(skip(self))]
    pub async fn read_header(&self, id: &str) -> RecorderResult<Option<ContainerHeader>> {
        let doc_key = header_key(id);
        if self.objects.exists(&doc_key).await? {
            let text = self.objects.read_text(&doc_key).await?;
            return Ok(Some(serde_json::from_str(&text)?));
        }

        let key = archive_key(id);
        if !self.objects.exists(&key).await? {
            return Ok(None);
        }

        let header = read_archive_header(self.objects.read_stream(&key).await?).await?;
        debug!(container_id = id, "Backfilling header document from archive");
        match serde_json::to_string_pretty(&header) {
            Ok(json) => {
                if let Err(e) = self.objects.write_text(&doc_key, &json).await {
                    warn!(container_id = id, error = %e, "Failed to backfill header document");
                }
            }
            Err(e) => warn!(container_id = id, error = %e, "Failed to serialize header"),
        }
        Ok(Some(header))
    }

    /// The archive's header and a source over its body
    pub async fn open_body(&self, id: &str) -> RecorderResult<(ContainerHeader, BodySource)> {
        let source = self.objects.read_stream(&archive_key(id)).await?;
        open_archive(source).await
    }

    /// Stream every event of a container into `sink`
    #[instrument(skip(self, sink))]
    pub async fn read_events(
        &self,
        id: &str,
        sink: &mut dyn EventSink,
    ) -> RecorderResult<DecodeSummary> {
        let (header, mut body) = self.open_body(id).await?;
        decode_container(&header, &mut body, self.codec.as_ref(), sink).await
    }

    /// Archive size in bytes
    pub async fn container_size(&self, id: &str) -> RecorderResult<u64> {
        Ok(self.objects.sizeof(&archive_key(id)).await?)
    }

    pub async fn list(&self, filter: &CatalogFilter) -> RecorderResult<Vec<HeaderSummary>> {
        Ok(self.catalog.list(filter).await?)
    }

    /// Ids of every catalogued container, newest first
    pub async fn all_ids(&self) -> RecorderResult<Vec<String>> {
        let filter = CatalogFilter::all().with_limit(usize::MAX);
        Ok(self
            .catalog
            .list(&filter)
            .await?
            .into_iter()
            .map(|summary| summary.id)
            .collect())
    }

    pub async fn attach_metadata(
        &self,
        id: &str,
        metadata: RecordingMetadata,
    ) -> RecorderResult<()> {
        Ok(self.catalog.attach_metadata(id, metadata).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skyreel_core::{ChunkSpan, Event, Lz4JsonCodec, StorageError};
    use skyreel_storage::{InMemoryCatalog, InMemoryObjectStore};

    use crate::archive::ArchiveWriter;
    use crate::error::RecorderError;

    async fn store_container(objects: &InMemoryObjectStore, events: &[Event]) -> ContainerHeader {
        let body = Lz4JsonCodec::new().encode(events).unwrap();
        let header = ContainerHeader {
            id: "rec-1".into(),
            info: Default::default(),
            chunks: vec![ChunkSpan::new(0, body.len() as u64)],
        };
        let sink = objects.write_stream(&archive_key("rec-1")).await.unwrap();
        let mut writer = ArchiveWriter::begin(sink, &header).await.unwrap();
        writer.write_body(&body).await.unwrap();
        writer.finish().await.unwrap();
        header
    }

    fn library(objects: &InMemoryObjectStore) -> ReplayLibrary {
        ReplayLibrary::new(
            Arc::new(objects.clone()),
            Arc::new(InMemoryCatalog::new()),
            Arc::new(Lz4JsonCodec::new()),
        )
    }

    #[tokio::test]
    async fn test_read_header_backfills_document() {
        let objects = InMemoryObjectStore::new().with_fragment_size(7);
        let header = store_container(&objects, &[]).await;
        let library = library(&objects);

        assert!(objects.get(&header_key("rec-1")).is_none());
        assert_eq!(library.read_header("rec-1").await.unwrap(), Some(header.clone()));
        assert!(objects.get(&header_key("rec-1")).is_some());

        // Served from the document this time
        assert_eq!(library.read_header("rec-1").await.unwrap(), Some(header));
    }

    #[tokio::test]
    async fn test_read_header_missing() {
        let objects = InMemoryObjectStore::new();
        assert_eq!(library(&objects).read_header("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_events() {
        let objects = InMemoryObjectStore::new().with_fragment_size(5);
        let events: Vec<Event> = (0..8)
            .map(|i| Event::new("PlayerVehicle", "Fire", vec![json!(i)]))
            .collect();
        store_container(&objects, &events).await;
        let library = library(&objects);

        let mut out: Vec<Event> = Vec::new();
        let summary = library.read_events("rec-1", &mut out).await.unwrap();
        assert_eq!(summary.events, 8);
        assert_eq!(out, events);
        assert!(library.container_size("rec-1").await.unwrap() > summary.bytes_received);
    }

    #[tokio::test]
    async fn test_open_missing_body() {
        let objects = InMemoryObjectStore::new();
        let err = library(&objects).open_body("nope").await.err().unwrap();
        assert!(matches!(err, RecorderError::Storage(StorageError::NotFound(_))));
    }
}
