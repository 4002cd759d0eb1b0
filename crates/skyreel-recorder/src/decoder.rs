//! Streaming chunk decoder
//!
//! Reassembles a container body delivered in fragments of any size into its
//! chunks, decodes each chunk with the [`Codec`], and hands every event to an
//! [`EventSink`] in recorded order. The fragment pattern never changes the
//! result: feeding one byte at a time or the whole body at once yields the
//! same event sequence.
//!
//! Each decode owns its [`PlaybackContext`], so any number of decodes can
//! run in parallel.

use std::collections::HashMap;

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use skyreel_core::{ByteSource, ChunkSpan, Codec, ContainerHeader, Event, KnownEvent};

use crate::error::RecorderResult;

/// A live entity spawned by `NetInstantiate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityInfo {
    pub entity_id: String,
    pub owner_id: Option<String>,
    pub path: Option<String>,
    /// Timestamp of the spawning event
    pub spawned_at: i64,
}

/// Entities alive at the current point of playback
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: HashMap<String, EntityInfo>,
}

impl EntityRegistry {
    pub fn get(&self, entity_id: &str) -> Option<&EntityInfo> {
        self.entities.get(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entities.contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityInfo> {
        self.entities.values()
    }

    fn insert(&mut self, info: EntityInfo) {
        self.entities.insert(info.entity_id.clone(), info);
    }

    fn remove(&mut self, entity_id: &str) -> Option<EntityInfo> {
        self.entities.remove(entity_id)
    }
}

/// Playback state passed alongside every decoded event
#[derive(Debug, Clone, Default)]
pub struct PlaybackContext {
    current_time: i64,
    entities: EntityRegistry,
}

impl PlaybackContext {
    /// Timestamp of the event being delivered
    pub fn current_time(&self) -> i64 {
        self.current_time
    }

    pub fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    /// Apply an event before it is delivered
    ///
    /// Spawns take effect immediately. A destroyed entity stays visible
    /// until the sink has seen the destroy, so its id is returned instead.
    fn advance(&mut self, event: &Event) -> Option<String> {
        self.current_time = event.timestamp;
        match KnownEvent::decode(event) {
            Ok(KnownEvent::NetInstantiate {
                entity_id,
                owner_id,
                path,
            }) => {
                self.entities.insert(EntityInfo {
                    entity_id,
                    owner_id,
                    path,
                    spawned_at: event.timestamp,
                });
                None
            }
            Ok(KnownEvent::NetDestroy { entity_id }) => Some(entity_id),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Skipping malformed event in playback context");
                None
            }
        }
    }
}

/// Consumer of decoded events
pub trait EventSink: Send {
    /// Handle one event
    ///
    /// An error aborts the decode and is returned to its caller.
    fn on_event(&mut self, event: &Event, context: &PlaybackContext) -> RecorderResult<()>;
}

impl<F> EventSink for F
where
    F: FnMut(&Event, &PlaybackContext) -> RecorderResult<()> + Send,
{
    fn on_event(&mut self, event: &Event, context: &PlaybackContext) -> RecorderResult<()> {
        self(event, context)
    }
}

impl EventSink for Vec<Event> {
    fn on_event(&mut self, event: &Event, _context: &PlaybackContext) -> RecorderResult<()> {
        self.push(event.clone());
        Ok(())
    }
}

/// What one decode produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Events delivered to the sink
    pub events: u64,
    /// Chunks fully received and decoded
    pub chunks_decoded: usize,
    /// Chunks whose bytes did not fully decode
    pub corrupt_chunks: usize,
    /// Body bytes consumed
    pub bytes_received: u64,
    /// The stream ended before the last chunk was complete
    pub truncated: bool,
    /// Bytes delivered past the declared body and ignored
    pub trailing_bytes: u64,
}

/// Incremental decoder for one container body
pub struct ChunkDecoder<'a> {
    codec: &'a dyn Codec,
    chunks: &'a [ChunkSpan],
    buffer: BytesMut,
    next_chunk: usize,
    received: u64,
    total: u64,
    context: PlaybackContext,
    summary: DecodeSummary,
}

impl<'a> ChunkDecoder<'a> {
    pub fn new(header: &'a ContainerHeader, codec: &'a dyn Codec) -> Self {
        Self {
            codec,
            chunks: &header.chunks,
            buffer: BytesMut::new(),
            next_chunk: 0,
            received: 0,
            total: header.body_len(),
            context: PlaybackContext::default(),
            summary: DecodeSummary::default(),
        }
    }

    /// Body bytes consumed so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Declared body size
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Fraction of the body received, in `[0, 1]`
    ///
    /// An empty body counts as complete.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.received as f64 / self.total as f64).min(1.0)
    }

    pub fn context(&self) -> &PlaybackContext {
        &self.context
    }

    /// Feed the next fragment, decoding every chunk it completes
    pub fn push(&mut self, fragment: &[u8], sink: &mut dyn EventSink) -> RecorderResult<()> {
        let room = self.total - self.received;
        let accepted = fragment.len().min(room.try_into().unwrap_or(usize::MAX));
        self.summary.trailing_bytes += (fragment.len() - accepted) as u64;
        self.buffer.extend_from_slice(&fragment[..accepted]);
        self.received += accepted as u64;
        self.decode_ready(sink)
    }

    /// Decode every chunk fully held in the buffer
    fn decode_ready(&mut self, sink: &mut dyn EventSink) -> RecorderResult<()> {
        while let Some(chunk) = self.chunks.get(self.next_chunk) {
            let length = chunk.length as usize;
            if self.buffer.len() < length {
                break;
            }
            let bytes = self.buffer.split_to(length);
            let index = self.next_chunk;
            self.next_chunk += 1;
            self.decode_chunk(index, &bytes, sink)?;
            self.summary.chunks_decoded += 1;
        }
        Ok(())
    }

    /// End of stream: decode any partial chunk and return the summary
    pub fn finish(mut self, sink: &mut dyn EventSink) -> RecorderResult<DecodeSummary> {
        // Zero-length chunks complete without any fragment
        self.decode_ready(sink)?;
        if self.next_chunk < self.chunks.len() {
            self.summary.truncated = true;
            let remainder = std::mem::take(&mut self.buffer);
            warn!(
                chunk = self.next_chunk,
                chunks = self.chunks.len(),
                available = remainder.len(),
                "Body truncated, decoding partial final chunk"
            );
            if !remainder.is_empty() {
                self.decode_chunk(self.next_chunk, &remainder, sink)?;
            }
        }
        if self.summary.trailing_bytes > 0 {
            warn!(
                trailing = self.summary.trailing_bytes,
                "Ignoring bytes past the last chunk"
            );
        }

        self.summary.bytes_received = self.received;
        Ok(self.summary)
    }

    fn decode_chunk(
        &mut self,
        index: usize,
        bytes: &[u8],
        sink: &mut dyn EventSink,
    ) -> RecorderResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let partial = self.codec.decode_lossy(bytes);
        if let Some(error) = &partial.error {
            self.summary.corrupt_chunks += 1;
            warn!(
                chunk = index,
                error = %error,
                recovered = partial.events.len(),
                "Corrupt chunk, keeping recovered events"
            );
        }
        trace!(chunk = index, events = partial.events.len(), "Decoded chunk");

        for event in &partial.events {
            let destroyed = self.context.advance(event);
            sink.on_event(event, &self.context)?;
            if let Some(entity_id) = destroyed {
                self.context.entities.remove(&entity_id);
            }
            self.summary.events += 1;
        }
        Ok(())
    }
}

/// Decode a whole container body from a fragment source
pub async fn decode_container(
    header: &ContainerHeader,
    source: &mut dyn ByteSource,
    codec: &dyn Codec,
    sink: &mut dyn EventSink,
) -> RecorderResult<DecodeSummary> {
    let mut decoder = ChunkDecoder::new(header, codec);
    while let Some(fragment) = source.next_fragment().await? {
        decoder.push(&fragment, sink)?;
    }
    let summary = decoder.finish(sink)?;
    debug!(
        container_id = %header.id,
        events = summary.events,
        chunks = summary.chunks_decoded,
        "Decoded container"
    );
    Ok(summary)
}
