//! # Skyreel Storage
//!
//! Concrete storage collaborators for the Skyreel recording pipeline.
//!
//! ## Features
//!
//! - **FileLedger**: per-session append-only log files with torn-tail recovery
//! - **FsObjectStore**: directory-backed object store with atomic publish
//! - **RedbCatalog**: container catalog in a redb database
//! - **In-memory variants** of all three for tests and embedding
//!
//! ## Example
//!
//! ```rust,ignore
//! use skyreel_core::{Ledger, LogRecord};
//! use skyreel_storage::{FileLedger, FileLedgerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ledger = FileLedger::open(FileLedgerConfig::with_base_dir("./data/ledger"))
//!         .await
//!         .unwrap();
//!
//!     ledger
//!         .append(&LogRecord::init("session-1", "lobby-1", "{}".into(), 0))
//!         .await
//!         .unwrap();
//!     assert_eq!(ledger.sessions_with_init().await.unwrap(), vec!["session-1"]);
//! }
//! ```

pub mod append_log;
pub mod blobs;
pub mod memory;
pub mod structured;

// Re-exports
pub use append_log::{FileLedger, FileLedgerConfig};
pub use blobs::{FileSource, FsObjectStore, FsObjectStoreConfig};
pub use memory::{InMemoryCatalog, InMemoryLedger, InMemoryObjectStore, MemorySource};
pub use structured::{RedbCatalog, RedbCatalogConfig};

// Re-export the collaborator traits for convenience
pub use skyreel_core::{ByteSource, Catalog, Ledger, ObjectSink, ObjectStore, StorageError};
