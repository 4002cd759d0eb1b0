//! File-backed ledger
//!
//! One append-only file per session holding length-prefixed postcard
//! records: `[u32 BE length][postcard LogRecord]`.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use skyreel_core::{Ledger, LogRecord, RecordKind, RecordStream, StorageError};

const LOG_EXTENSION: &str = "log";

/// Configuration for [`FileLedger`]
#[derive(Debug, Clone)]
pub struct FileLedgerConfig {
    /// Directory holding one log file per session
    pub base_dir: PathBuf,
    /// Whether to sync every append to disk
    pub sync_on_write: bool,
    /// Largest accepted serialized record
    pub max_record_size: usize,
}

impl Default for FileLedgerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/ledger"),
            sync_on_write: true,
            max_record_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl FileLedgerConfig {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }
}

/// In-memory index of one session log
#[derive(Debug)]
struct SessionLog {
    path: PathBuf,
    /// Append handle, opened on first write
    file: Option<File>,
    /// Offset one past the last valid record
    end: u64,
    records: usize,
    has_init: bool,
    last_packet: Option<u64>,
    stop_marker: Option<u64>,
}

impl SessionLog {
    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            end: 0,
            records: 0,
            has_init: false,
            last_packet: None,
            stop_marker: None,
        }
    }

    /// Append handle positioned at `end`
    ///
    /// Bytes past `end` are leftovers of a failed write and are cut off
    /// before the handle is cached.
    async fn writer(&mut self) -> Result<&mut File, StorageError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            if file.metadata().await?.len() > self.end {
                warn!(path = %self.path.display(), end = self.end, "Discarding stale ledger tail");
                file.set_len(self.end).await?;
            }
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| StorageError::io("log file not open"))
    }

    /// Undo a partially written entry
    ///
    /// The handle is dropped either way, so the next append goes through
    /// `writer` and re-checks the file length.
    async fn roll_back(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.set_len(self.end).await {
                warn!(path = %self.path.display(), error = %e, "Failed to truncate torn ledger entry");
            }
        }
    }

    fn index(&mut self, record: &LogRecord, offset: u64) {
        self.records += 1;
        match record.kind {
            RecordKind::Init => self.has_init = true,
            RecordKind::Packet => self.last_packet = Some(offset),
            RecordKind::Event if record.is_stop_marker() => self.stop_marker = Some(offset),
            RecordKind::Event => {}
        }
    }
}

/// Append-only ledger storing one file per session
pub struct FileLedger {
    config: FileLedgerConfig,
    sessions: DashMap<String, Arc<Mutex<SessionLog>>>,
}

impl FileLedger {
    /// Open the ledger directory and replay every session log
    ///
    /// A torn record at the tail of a log (crash mid-append) is truncated
    /// away so later appends stay readable.
    #[instrument(skip(config), fields(path = %config.base_dir.display()))]
    pub async fn open(config: FileLedgerConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.base_dir)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let sessions = DashMap::new();
        let mut entries = fs::read_dir(&config.base_dir)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };

            let log = replay(&path, config.max_record_size).await?;
            debug!(session_id = %session_id, records = log.records, "Replayed session log");
            sessions.insert(session_id, Arc::new(Mutex::new(log)));
        }

        info!(sessions = sessions.len(), "Opened file ledger");
        Ok(Self { config, sessions })
    }

    /// Number of sessions with a log file
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::io(format!("invalid session id: {session_id:?}")));
        }
        Ok(self
            .config
            .base_dir
            .join(format!("{session_id}.{LOG_EXTENSION}")))
    }

    fn session(&self, session_id: &str) -> Option<Arc<Mutex<SessionLog>>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    async fn read_indexed(
        &self,
        session_id: &str,
        pick: impl FnOnce(&SessionLog) -> Option<u64>,
    ) -> Result<Option<LogRecord>, StorageError> {
        let Some(session) = self.session(session_id) else {
            return Ok(None);
        };
        let (path, offset) = {
            let log = session.lock().await;
            match pick(&log) {
                Some(offset) => (log.path.clone(), offset),
                None => return Ok(None),
            }
        };

        let mut file = File::open(&path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        let (record, _) = read_entry(&mut file, self.config.max_record_size).await?;
        Ok(Some(record))
    }
}

#[async_trait]
impl Ledger for FileLedger {
    #[instrument(skip(self, record), fields(session_id = %record.session_id, kind = ?record.kind))]
    async fn append(&self, record: &LogRecord) -> Result<(), StorageError> {
        let serialized = postcard::to_allocvec(record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        if serialized.len() > self.config.max_record_size {
            return Err(StorageError::RecordTooLarge {
                size: serialized.len(),
                limit: self.config.max_record_size,
            });
        }

        let path = self.session_path(&record.session_id)?;
        let session = Arc::clone(
            self.sessions
                .entry(record.session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionLog::empty(path))))
                .value(),
        );
        let mut log = session.lock().await;

        let mut entry = Vec::with_capacity(4 + serialized.len());
        entry.extend_from_slice(&(serialized.len() as u32).to_be_bytes());
        entry.extend_from_slice(&serialized);

        let sync = self.config.sync_on_write;
        let written = async {
            let file = log.writer().await?;
            file.write_all(&entry).await?;
            if sync {
                file.sync_data().await?;
            }
            Ok::<_, StorageError>(())
        }
        .await;
        if let Err(e) = written {
            log.roll_back().await;
            return Err(e);
        }

        let offset = log.end;
        log.end += entry.len() as u64;
        log.index(record, offset);

        debug!(offset, size = entry.len(), "Appended record");
        Ok(())
    }

    async fn stream_records(&self, session_id: &str) -> Result<RecordStream, StorageError> {
        let Some(session) = self.session(session_id) else {
            return Ok(futures::stream::empty().boxed());
        };
        let (path, end) = {
            let log = session.lock().await;
            (log.path.clone(), log.end)
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(futures::stream::empty().boxed());
            }
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };
        let max = self.config.max_record_size;

        let stream = futures::stream::try_unfold(
            (BufReader::new(file), 0u64),
            move |(mut reader, offset)| async move {
                if offset >= end {
                    return Ok::<_, StorageError>(None);
                }
                let (record, len) = read_entry(&mut reader, max).await?;
                Ok(Some((record, (reader, offset + len))))
            },
        );
        Ok(stream.boxed())
    }

    async fn find_last_packet_record(
        &self,
        session_id: &str,
    ) -> Result<Option<LogRecord>, StorageError> {
        self.read_indexed(session_id, |log| log.last_packet).await
    }

    async fn find_stop_marker(&self, session_id: &str) -> Result<Option<LogRecord>, StorageError> {
        self.read_indexed(session_id, |log| log.stop_marker).await
    }

    async fn sessions_with_init(&self) -> Result<Vec<String>, StorageError> {
        let sessions: Vec<(String, Arc<Mutex<SessionLog>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut ids = Vec::new();
        for (id, session) in sessions {
            if session.lock().await.has_init {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn delete_all(&self, session_id: &str) -> Result<(), StorageError> {
        let path = self.session_path(session_id)?;
        let session = self.sessions.remove(session_id).map(|(_, s)| s);

        // Wait out any in-flight append before removing the file.
        if let Some(session) = session {
            let mut log = session.lock().await;
            log.file.take();
        }

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted session log");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

/// Read one entry, returning the record and its on-disk size
async fn read_entry<R>(reader: &mut R, max_len: usize) -> Result<(LogRecord, u64), StorageError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_len {
        return Err(StorageError::deserialization(format!(
            "invalid record length {len}"
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?;
    let record =
        postcard::from_bytes(&buf).map_err(|e| StorageError::Deserialization(e.to_string()))?;
    Ok((record, 4 + len as u64))
}

/// Rebuild a session index from its log, truncating a torn tail
async fn replay(path: &Path, max_len: usize) -> Result<SessionLog, StorageError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?
        .len();

    let mut log = SessionLog::empty(path.to_path_buf());
    let mut reader = BufReader::new(
        file.try_clone()
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?,
    );

    while log.end < file_size {
        match read_entry(&mut reader, max_len).await {
            Ok((record, len)) => {
                let offset = log.end;
                log.index(&record, offset);
                log.end += len;
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    offset = log.end,
                    error = %e,
                    "Torn ledger entry, truncating"
                );
                break;
            }
        }
    }

    if log.end < file_size {
        file.set_len(log.end)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
    }
    Ok(log)
}
