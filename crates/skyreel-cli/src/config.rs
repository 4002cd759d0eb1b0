use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use skyreel_logging::LogConfig;
use skyreel_recorder::{
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_SESSION_DURATION, ExtractionConfig, RecorderConfig,
    RecoveryConfig,
};
use skyreel_storage::{FileLedgerConfig, FsObjectStoreConfig, RedbCatalogConfig};

/// Recorder timing, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSection {
    pub flush_interval_secs: u64,
    pub max_session_duration_secs: u64,
}

impl Default for RecorderSection {
    fn default() -> Self {
        Self {
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL.as_secs(),
            max_session_duration_secs: DEFAULT_MAX_SESSION_DURATION.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub sync_on_write: bool,
    pub max_record_size: usize,
}

impl Default for LedgerSection {
    fn default() -> Self {
        let defaults = FileLedgerConfig::default();
        Self {
            sync_on_write: defaults.sync_on_write,
            max_record_size: defaults.max_record_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSection {
    pub read_fragment_size: usize,
}

impl Default for ObjectStoreSection {
    fn default() -> Self {
        Self {
            read_fragment_size: FsObjectStoreConfig::default().read_fragment_size,
        }
    }
}

/// Inbound/processed directories; default to `ingest` and
/// `ingest-finished` under the data directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub inbound_dir: Option<PathBuf>,
    pub processed_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSection {
    pub max_workers: usize,
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            max_workers: ExtractionConfig::default().max_workers,
        }
    }
}

/// Service configuration, loadable from TOML
///
/// Every field is optional; the layout under `data_dir` is
/// `ledger/`, `objects/`, `catalog.redb`, `ingest/` and `ingest-finished/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub recorder: RecorderSection,
    pub ledger: LedgerSection,
    pub objects: ObjectStoreSection,
    pub recovery: RecoverySection,
    pub extraction: ExtractionSection,
    pub logging: LogConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            recorder: RecorderSection::default(),
            ledger: LedgerSection::default(),
            objects: ObjectStoreSection::default(),
            recovery: RecoverySection::default(),
            extraction: ExtractionSection::default(),
            logging: LogConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Read a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig::default()
            .with_flush_interval(Duration::from_secs(self.recorder.flush_interval_secs))
            .with_max_session_duration(Duration::from_secs(
                self.recorder.max_session_duration_secs,
            ))
    }

    pub fn ledger_config(&self) -> FileLedgerConfig {
        FileLedgerConfig::with_base_dir(self.data_dir.join("ledger"))
            .with_sync_on_write(self.ledger.sync_on_write)
            .with_max_record_size(self.ledger.max_record_size)
    }

    pub fn object_store_config(&self) -> FsObjectStoreConfig {
        FsObjectStoreConfig::with_base_dir(self.data_dir.join("objects"))
            .with_read_fragment_size(self.objects.read_fragment_size)
    }

    pub fn catalog_config(&self) -> RedbCatalogConfig {
        RedbCatalogConfig::with_db_path(self.data_dir.join("catalog.redb"))
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        let mut config = RecoveryConfig::with_data_dir(&self.data_dir);
        if let Some(dir) = &self.recovery.inbound_dir {
            config = config.with_inbound_dir(dir);
        }
        if let Some(dir) = &self.recovery.processed_dir {
            config = config.with_processed_dir(dir);
        }
        config
    }

    pub fn extraction_config(&self) -> ExtractionConfig {
        ExtractionConfig::default().with_max_workers(self.extraction.max_workers)
    }
}

#[derive(Parser)]
#[command(name = "skyreel", about = "Replay recording storage maintenance")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Data directory, overrides the configuration file
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Finalize dangling sessions, then ingest the inbound directory
    Recover,
    /// Ingest a single container file
    Ingest {
        /// Container file path
        path: PathBuf,
    },
    /// List catalogued recordings, newest first
    List {
        /// Lobby name substring
        #[arg(long)]
        lobby: Option<String>,
        /// Player name substring
        #[arg(long)]
        player: Option<String>,
        /// Host name substring
        #[arg(long)]
        host: Option<String>,
        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Decode a recording to JSON lines
    Dump {
        /// Container id
        id: String,
        /// Output file, stdout if omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Extract metadata of every catalogued recording
    Extract,
}
