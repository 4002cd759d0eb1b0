//! # Skyreel Recorder
//!
//! Live recording of lobby sessions and everything that happens to a
//! recording afterwards.
//!
//! This crate provides:
//! - [`Recorder`] and [`LobbyManager`]: buffer events per lobby, flush them
//!   to the ledger in compressed batches, roll sessions over
//! - [`ContainerBuilder`]: turn a stopped session into a container archive
//! - [`ChunkDecoder`]: decode a container body from fragments of any size
//! - [`RecoveryManager`]: finalize dangling sessions, ingest external files
//! - [`ExtractionPool`]: compute recording metadata in parallel
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use skyreel_core::Lz4JsonCodec;
//! use skyreel_recorder::{ContainerBuilder, LobbyManager, RecorderContext, StaticSnapshotSource};
//!
//! let builder = Arc::new(ContainerBuilder::new(ledger.clone(), objects, catalog));
//! let ctx = RecorderContext::new(
//!     ledger,
//!     Arc::new(Lz4JsonCodec::new()),
//!     Arc::new(StaticSnapshotSource::default()),
//!     builder,
//! );
//!
//! let manager = LobbyManager::spawn(ctx);
//! manager.lobby_connected("lobby-1").await?;
//! manager.lobby_data("lobby-1", events);
//! let outcome = manager.lobby_disconnected("lobby-1").await?;
//! ```

pub mod archive;
pub mod builder;
mod config;
pub mod decoder;
mod error;
pub mod extract;
mod flush_task;
pub mod library;
pub mod manager;
pub mod recorder;
pub mod recovery;

pub use archive::{ArchiveWriter, BodySource, archive_key, header_key, open_archive, read_archive_header};
pub use builder::{BuildOutcome, ContainerBuilder, ContainerFinalized};
pub use config::{
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_SESSION_DURATION, ExtractionConfig, RecorderConfig,
    RecoveryConfig,
};
pub use decoder::{
    ChunkDecoder, DecodeSummary, EntityInfo, EntityRegistry, EventSink, PlaybackContext,
    decode_container,
};
pub use error::{RecorderError, RecorderResult};
pub use extract::{ExtractionPool, MetadataExtractor, WorkerMessage, extract_metadata};
pub use library::ReplayLibrary;
pub use manager::LobbyManager;
pub use recorder::{
    Recorder, RecorderContext, RecordingSession, RolloverRequest, SessionState, SnapshotSource,
    StaticSnapshotSource,
};
pub use recovery::{InboundReport, IngestOutcome, RecoveryManager};
