//! Container header, chunk index, and catalog listing types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::PlayerInfo;

/// Default number of headers returned by a catalog listing
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// One independently decodable byte range of a container body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub start: u64,
    pub length: u64,
}

impl ChunkSpan {
    /// Create a new chunk span
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Offset one past the last byte of this chunk
    ///
    /// Saturates for spans that run past `u64::MAX`; `validate` rejects those.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    fn checked_end(&self) -> Option<u64> {
        self.start.checked_add(self.length)
    }
}

/// Incrementally built contiguous chunk index
#[derive(Debug, Clone, Default)]
pub struct ChunkIndex {
    chunks: Vec<ChunkSpan>,
    next_start: u64,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of `length` bytes directly after the previous one
    pub fn push(&mut self, length: u64) -> Result<ChunkSpan, HeaderError> {
        let span = ChunkSpan::new(self.next_start, length);
        self.next_start = span.checked_end().ok_or(HeaderError::Overflow {
            index: self.chunks.len(),
        })?;
        self.chunks.push(span);
        Ok(span)
    }

    /// Total body bytes covered so far
    pub fn body_len(&self) -> u64 {
        self.next_start
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn into_chunks(self) -> Vec<ChunkSpan> {
        self.chunks
    }
}

/// Violation of the chunk index layout
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("first chunk starts at {0}, expected 0")]
    NonZeroStart(u64),

    #[error("chunk {index} starts at {actual}, expected {expected}")]
    NotContiguous {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("chunk {index} extends past the largest representable offset")]
    Overflow { index: usize },
}

/// Statistics extracted from a finished container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub players: Vec<PlayerInfo>,
    pub net_instantiates: u64,
    pub total_events: u64,
}

/// Descriptive information about one recording
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingInfo {
    pub lobby_id: String,
    pub lobby_name: String,
    pub mission_name: String,
    pub mission_id: Option<String>,
    pub campaign_id: Option<String>,
    pub workshop_id: Option<String>,
    pub map: Option<String>,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
    pub recording_id: String,
    /// Unix millis of the `Init` record
    pub start_time: i64,
    /// `stop.timestamp - init.timestamp`
    pub duration: i64,
    /// Filled in after extraction
    pub metadata: Option<RecordingMetadata>,
}

/// Header of a finished container
///
/// `chunks` is sorted, contiguous and starts at 0; the declared body size is
/// the end of the last chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub id: String,
    pub info: RecordingInfo,
    pub chunks: Vec<ChunkSpan>,
}

impl ContainerHeader {
    /// Declared body size in bytes
    pub fn body_len(&self) -> u64 {
        self.chunks.last().map(ChunkSpan::end).unwrap_or(0)
    }

    /// Check the contiguity invariants of the chunk index
    pub fn validate(&self) -> Result<(), HeaderError> {
        let mut expected = 0u64;
        for (index, chunk) in self.chunks.iter().enumerate() {
            if chunk.start != expected {
                return Err(if index == 0 {
                    HeaderError::NonZeroStart(chunk.start)
                } else {
                    HeaderError::NotContiguous {
                        index,
                        expected,
                        actual: chunk.start,
                    }
                });
            }
            expected = chunk
                .checked_end()
                .ok_or(HeaderError::Overflow { index })?;
        }
        Ok(())
    }

    /// Listing view without the chunk index
    pub fn summary(&self) -> HeaderSummary {
        HeaderSummary {
            id: self.id.clone(),
            info: self.info.clone(),
        }
    }
}

/// Catalog listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSummary {
    pub id: String,
    pub info: RecordingInfo,
}

/// Catalog listing filter
///
/// String queries are case-insensitive substring matches. Results are
/// ordered by start time, newest first, and truncated to `limit`.
#[derive(Debug, Clone)]
pub struct CatalogFilter {
    pub id: Option<String>,
    pub lobby_name: Option<String>,
    pub player_name: Option<String>,
    pub host_name: Option<String>,
    /// Inclusive lower bound on `startTime`
    pub start_after: Option<i64>,
    /// Inclusive upper bound on `startTime`
    pub start_before: Option<i64>,
    pub limit: usize,
}

impl Default for CatalogFilter {
    fn default() -> Self {
        Self {
            id: None,
            lobby_name: None,
            player_name: None,
            host_name: None,
            start_after: None,
            start_before: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl CatalogFilter {
    /// Match everything
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_lobby_name(mut self, query: impl Into<String>) -> Self {
        self.lobby_name = Some(query.into());
        self
    }

    pub fn with_player_name(mut self, query: impl Into<String>) -> Self {
        self.player_name = Some(query.into());
        self
    }

    pub fn with_host_name(mut self, query: impl Into<String>) -> Self {
        self.host_name = Some(query.into());
        self
    }

    pub fn with_start_range(mut self, after: Option<i64>, before: Option<i64>) -> Self {
        self.start_after = after;
        self.start_before = before;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether a header passes this filter
    pub fn matches(&self, header: &ContainerHeader) -> bool {
        let info = &header.info;

        if self.id.as_ref().is_some_and(|id| *id != header.id) {
            return false;
        }
        if !query_matches(&self.lobby_name, Some(&info.lobby_name)) {
            return false;
        }
        if !query_matches(&self.host_name, info.host_name.as_ref()) {
            return false;
        }
        if let Some(query) = &self.player_name {
            let found = info.metadata.as_ref().is_some_and(|meta| {
                meta.players
                    .iter()
                    .any(|p| contains_ignore_case(&p.name, query))
            });
            if !found {
                return false;
            }
        }
        if self.start_after.is_some_and(|after| info.start_time < after) {
            return false;
        }
        if self.start_before.is_some_and(|before| info.start_time > before) {
            return false;
        }
        true
    }

    /// Filter, order newest first, and truncate
    pub fn apply<'a>(&self, headers: impl Iterator<Item = &'a ContainerHeader>) -> Vec<HeaderSummary> {
        let mut matched: Vec<&ContainerHeader> = headers.filter(|h| self.matches(h)).collect();
        matched.sort_by(|a, b| b.info.start_time.cmp(&a.info.start_time));
        matched
            .into_iter()
            .take(self.limit)
            .map(ContainerHeader::summary)
            .collect()
    }
}

fn query_matches(query: &Option<String>, value: Option<&String>) -> bool {
    match query {
        None => true,
        Some(q) => value.is_some_and(|v| contains_ignore_case(v, q)),
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
