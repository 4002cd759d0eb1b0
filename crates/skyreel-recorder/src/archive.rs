//! Container archive framing
//!
//! An archive is `SKRA`, a version byte, then two entries in order:
//!
//! ```text
//! u16 BE name length | UTF-8 name | u64 BE data length | data
//! ```
//!
//! The `header` entry holds the JSON [`ContainerHeader`], the `body` entry
//! holds the concatenated compressed chunks. The header comes first so a
//! reader can stop before touching the body.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use skyreel_core::{ByteSource, ContainerHeader, ObjectSink, StorageError};

use crate::error::{RecorderError, RecorderResult};

/// Leading magic bytes of every archive
pub const ARCHIVE_MAGIC: [u8; 4] = *b"SKRA";
/// Current archive format version
pub const ARCHIVE_VERSION: u8 = 1;
/// Name of the header entry
pub const HEADER_ENTRY: &str = "header";
/// Name of the body entry
pub const BODY_ENTRY: &str = "body";
/// File extension of container archives
pub const CONTAINER_EXTENSION: &str = "skr";

/// Headers larger than this are rejected as corrupt
const MAX_HEADER_LEN: u64 = 64 * 1024 * 1024;

/// Object key of a container archive
pub fn archive_key(id: &str) -> String {
    format!("recordings/{id}.{CONTAINER_EXTENSION}")
}

/// Object key of a header-only document
pub fn header_key(id: &str) -> String {
    format!("recordings/{id}.json")
}

fn put_entry_prefix(buf: &mut Vec<u8>, name: &str, len: u64) {
    buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
}

/// Streams one archive into an [`ObjectSink`]
///
/// The header is written up front, so the body length is fixed before the
/// first body byte; `finish` refuses to publish a short body.
pub struct ArchiveWriter {
    sink: Box<dyn ObjectSink>,
    remaining: u64,
}

impl ArchiveWriter {
    /// Write the preamble and header entry, and open the body entry
    pub async fn begin(
        mut sink: Box<dyn ObjectSink>,
        header: &ContainerHeader,
    ) -> RecorderResult<Self> {
        header
            .validate()
            .map_err(|e| RecorderError::MalformedHeader(e.to_string()))?;
        let json = serde_json::to_vec(header)?;
        let body_len = header.body_len();

        let mut preamble = Vec::with_capacity(json.len() + 32);
        preamble.extend_from_slice(&ARCHIVE_MAGIC);
        preamble.push(ARCHIVE_VERSION);
        put_entry_prefix(&mut preamble, HEADER_ENTRY, json.len() as u64);
        preamble.extend_from_slice(&json);
        put_entry_prefix(&mut preamble, BODY_ENTRY, body_len);
        sink.write(&preamble).await?;

        Ok(Self {
            sink,
            remaining: body_len,
        })
    }

    /// Body bytes still expected
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Append body bytes
    pub async fn write_body(&mut self, data: &[u8]) -> RecorderResult<()> {
        if data.len() as u64 > self.remaining {
            return Err(RecorderError::Archive(format!(
                "body write of {} bytes exceeds the {} declared bytes left",
                data.len(),
                self.remaining
            )));
        }
        self.sink.write(data).await?;
        self.remaining -= data.len() as u64;
        Ok(())
    }

    /// Publish the archive
    pub async fn finish(mut self) -> RecorderResult<()> {
        if self.remaining != 0 {
            return Err(RecorderError::Archive(format!(
                "body is {} bytes short of its declared length",
                self.remaining
            )));
        }
        self.sink.finish().await?;
        Ok(())
    }
}

/// Buffered reader over a fragment source
struct FramedReader {
    source: Box<dyn ByteSource>,
    buffer: BytesMut,
}

impl FramedReader {
    async fn fill(&mut self, needed: usize) -> RecorderResult<()> {
        while self.buffer.len() < needed {
            match self.source.next_fragment().await? {
                Some(fragment) => self.buffer.extend_from_slice(&fragment),
                None => {
                    return Err(RecorderError::Archive(format!(
                        "unexpected end of archive: needed {needed} bytes, have {}",
                        self.buffer.len()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn take(&mut self, len: usize) -> RecorderResult<Bytes> {
        self.fill(len).await?;
        Ok(self.buffer.split_to(len).freeze())
    }

    /// Read one entry prefix, returning its name and data length
    async fn entry_prefix(&mut self) -> RecorderResult<(String, u64)> {
        self.fill(2).await?;
        let name_len = self.buffer.get_u16() as usize;
        let name = self.take(name_len).await?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| RecorderError::Archive("entry name is not UTF-8".into()))?;
        self.fill(8).await?;
        Ok((name, self.buffer.get_u64()))
    }
}

/// Parse an archive's preamble and header entry
///
/// Returns the header and a source positioned at the first body byte.
pub async fn open_archive(
    source: Box<dyn ByteSource>,
) -> RecorderResult<(ContainerHeader, BodySource)> {
    let mut reader = FramedReader {
        source,
        buffer: BytesMut::new(),
    };

    let preamble = reader.take(ARCHIVE_MAGIC.len() + 1).await?;
    if preamble[..4] != ARCHIVE_MAGIC {
        return Err(RecorderError::Archive("missing SKRA magic".into()));
    }
    if preamble[4] != ARCHIVE_VERSION {
        return Err(RecorderError::Archive(format!(
            "unsupported archive version {}",
            preamble[4]
        )));
    }

    let (name, header_len) = reader.entry_prefix().await?;
    if name != HEADER_ENTRY {
        return Err(RecorderError::Archive(format!(
            "first entry is {name:?}, expected {HEADER_ENTRY:?}"
        )));
    }
    if header_len > MAX_HEADER_LEN {
        return Err(RecorderError::Archive(format!(
            "header entry of {header_len} bytes is too large"
        )));
    }
    let json = reader.take(header_len as usize).await?;
    let header: ContainerHeader = serde_json::from_slice(&json)?;
    header
        .validate()
        .map_err(|e| RecorderError::MalformedHeader(e.to_string()))?;

    let (name, body_len) = reader.entry_prefix().await?;
    if name != BODY_ENTRY {
        return Err(RecorderError::Archive(format!(
            "second entry is {name:?}, expected {BODY_ENTRY:?}"
        )));
    }
    if body_len != header.body_len() {
        return Err(RecorderError::Archive(format!(
            "body entry holds {body_len} bytes, header declares {}",
            header.body_len()
        )));
    }

    debug!(container_id = %header.id, body_len, "Opened archive");
    let body = BodySource {
        buffered: reader.buffer.freeze(),
        source: reader.source,
        remaining: body_len,
    };
    Ok((header, body))
}

/// Parse only the header entry of an archive
pub async fn read_archive_header(source: Box<dyn ByteSource>) -> RecorderResult<ContainerHeader> {
    open_archive(source).await.map(|(header, _)| header)
}

/// The body entry of an archive as a fragment source
///
/// Ends after the declared body length, or earlier if the archive is
/// truncated.
pub struct BodySource {
    buffered: Bytes,
    source: Box<dyn ByteSource>,
    remaining: u64,
}

impl BodySource {
    /// Body bytes not yet delivered
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn limit(&mut self, mut fragment: Bytes) -> Bytes {
        if fragment.len() as u64 > self.remaining {
            fragment.truncate(self.remaining as usize);
        }
        self.remaining -= fragment.len() as u64;
        fragment
    }
}

#[async_trait]
impl ByteSource for BodySource {
    async fn next_fragment(&mut self) -> Result<Option<Bytes>, StorageError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if !self.buffered.is_empty() {
            let fragment = std::mem::take(&mut self.buffered);
            return Ok(Some(self.limit(fragment)));
        }
        match self.source.next_fragment().await? {
            Some(fragment) => Ok(Some(self.limit(fragment))),
            None => Ok(None),
        }
    }
}
