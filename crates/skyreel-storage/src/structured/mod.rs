//! Structured storage using redb
//!
//! Holds the catalog of finalized containers.

pub mod catalog;

pub use catalog::{RECORDINGS, RedbCatalog, RedbCatalogConfig};
