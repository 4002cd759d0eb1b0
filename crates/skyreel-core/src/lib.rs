//! # Skyreel Core
//!
//! Core types, collaborator traits, and errors for the Skyreel replay stack.
//!
//! This crate is the shared vocabulary between the live recorder, the
//! container builder, and every consumer that streams a finished replay
//! back. It deliberately contains no I/O of its own: storage, cataloguing
//! and compression are expressed as traits so that the same recording logic
//! runs against in-memory collaborators in tests and file-backed ones in
//! production.
//!
//! ## Key Traits
//!
//! - [`Codec`]: ordered event batch <-> opaque bytes
//! - [`Ledger`]: append-only durable store of [`LogRecord`]s per session
//! - [`ObjectStore`]: key-addressed blob storage with streaming read/write
//! - [`Catalog`]: discoverable index of finalized containers
//! - [`Clock`]: wall-clock abstraction for testability
//!
//! ## Key Types
//!
//! - [`Event`]: one captured remote-invocation record
//! - [`KnownEvent`]: typed view over the events the core interprets
//! - [`LogRecord`]: one persisted unit in the ledger (init, packet, marker)
//! - [`ContainerHeader`]: chunk index and recording info of a container

pub mod codec;
pub mod error;
pub mod event;
pub mod header;
pub mod record;
pub mod traits;

// Re-export main types
pub use codec::Lz4JsonCodec;
pub use error::*;
pub use event::*;
pub use header::*;
pub use record::*;
pub use traits::*;
