//! Blob storage for containers and header documents

pub mod fs_store;

pub use fs_store::{FileSource, FsObjectStore, FsObjectStoreConfig};
