//! Append-only session ledger
//!
//! Each session's records live in their own log file and can only be
//! appended, never modified. Finished sessions are removed wholesale once
//! their container has been archived.
//!
//! ## Storage Format
//!
//! Each log file contains length-prefixed, postcard-serialized records:
//! ```text
//! [4 bytes: len][len bytes: serialized LogRecord][4 bytes: len][...]
//! ```

pub mod file_ledger;

pub use file_ledger::{FileLedger, FileLedgerConfig};
