//! Filesystem object store
//!
//! Objects live at `base_dir/<key>`. Writes go to a temporary sibling file
//! and are renamed into place once complete, so a reader never observes a
//! partially written object.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use skyreel_core::{ByteSource, ObjectSink, ObjectStore, StorageError};

/// Configuration for [`FsObjectStore`]
#[derive(Debug, Clone)]
pub struct FsObjectStoreConfig {
    /// Root directory of the store
    pub base_dir: PathBuf,
    /// Size of the fragments handed out by read streams
    pub read_fragment_size: usize,
}

impl Default for FsObjectStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/objects"),
            read_fragment_size: 512 * 1024, // 512KB
        }
    }
}

impl FsObjectStoreConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_read_fragment_size(mut self, size: usize) -> Self {
        self.read_fragment_size = size.max(1);
        self
    }
}

/// Object store rooted in a local directory
pub struct FsObjectStore {
    config: FsObjectStoreConfig,
}

impl FsObjectStore {
    /// Create the store, ensuring its root exists
    pub async fn new(config: FsObjectStoreConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.base_dir)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        info!(path = %config.base_dir.display(), "Object store initialized");
        Ok(Self { config })
    }

    /// Root directory of the store
    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// Resolve a key to a path, rejecting keys that escape the root
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::io(format!("invalid object key: {key:?}")));
        }
        Ok(self.config.base_dir.join(relative))
    }

    async fn create_sink(&self, key: &str) -> Result<FsObjectSink, StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let temp_path = temp_path_for(&path);
        let file = File::create(&temp_path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(FsObjectSink {
            key: key.to_string(),
            path,
            temp_path,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn not_found_or_io(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::not_found(key)
    } else {
        StorageError::Io(e.to_string())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn sizeof(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.object_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;
        Ok(metadata.len())
    }

    #[instrument(skip(self))]
    async fn write_stream(&self, key: &str) -> Result<Box<dyn ObjectSink>, StorageError> {
        Ok(Box::new(self.create_sink(key).await?))
    }

    async fn read_stream(&self, key: &str) -> Result<Box<dyn ByteSource>, StorageError> {
        let path = self.object_path(key)?;
        let file = File::open(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))?;

        Ok(Box::new(FileSource::new(file, self.config.read_fragment_size)))
    }

    #[instrument(skip(self, text), fields(size = text.len()))]
    async fn write_text(&self, key: &str, text: &str) -> Result<(), StorageError> {
        let mut sink = self.create_sink(key).await?;
        sink.write(text.as_bytes()).await?;
        sink.finish().await
    }

    async fn read_text(&self, key: &str) -> Result<String, StorageError> {
        let path = self.object_path(key)?;
        fs::read_to_string(&path)
            .await
            .map_err(|e| not_found_or_io(key, e))
    }
}

/// Streaming writer publishing on `finish`
struct FsObjectSink {
    key: String,
    path: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

#[async_trait]
impl ObjectSink for FsObjectSink {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StorageError::SinkClosed(self.key.clone()))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| StorageError::SinkClosed(self.key.clone()))?;

        writer
            .flush()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        drop(writer);

        fs::rename(&self.temp_path, &self.path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        debug!(key = %self.key, size = self.written, "Stored object");
        Ok(())
    }
}

impl Drop for FsObjectSink {
    fn drop(&mut self) {
        // Abandoned before finish: never publish the partial object.
        if self.writer.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.temp_path) {
                warn!(key = %self.key, error = %e, "Failed to remove abandoned object");
            }
        }
    }
}

/// Reads a file in fixed-size fragments
pub struct FileSource {
    file: File,
    fragment_size: usize,
}

impl FileSource {
    pub fn new(file: File, fragment_size: usize) -> Self {
        Self {
            file,
            fragment_size: fragment_size.max(1),
        }
    }

    /// Open a local file outside any store
    pub async fn open(path: impl AsRef<Path>, fragment_size: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .map_err(|e| not_found_or_io(&path.display().to_string(), e))?;
        Ok(Self::new(file, fragment_size))
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn next_fragment(&mut self) -> Result<Option<Bytes>, StorageError> {
        let mut buf = BytesMut::zeroed(self.fragment_size);
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }
}
