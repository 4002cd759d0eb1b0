//! Reference event batch codec
//!
//! A batch is encoded as newline-delimited JSON events wrapped in an LZ4
//! frame. The frame format is block-structured, so a truncated chunk still
//! yields the events held by its complete blocks.

use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::error::CodecError;
use crate::event::Event;
use crate::traits::{Codec, PartialDecode};

/// LZ4-framed NDJSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4JsonCodec;

impl Lz4JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for Lz4JsonCodec {
    fn encode(&self, events: &[Event]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = FrameEncoder::new(Vec::new());
        for event in events {
            let line =
                serde_json::to_vec(event).map_err(|e| CodecError::Serialization(e.to_string()))?;
            encoder
                .write_all(&line)
                .and_then(|_| encoder.write_all(b"\n"))
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Event>, CodecError> {
        let mut plain = Vec::new();
        FrameDecoder::new(bytes)
            .read_to_end(&mut plain)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        parse_lines(&plain)
    }

    fn decode_lossy(&self, bytes: &[u8]) -> PartialDecode {
        let mut decoder = FrameDecoder::new(bytes);
        let mut plain = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        let mut error = None;

        loop {
            match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => plain.extend_from_slice(&buf[..n]),
                Err(e) => {
                    error = Some(CodecError::Decompression(e.to_string()));
                    break;
                }
            }
        }

        // A torn stream can end mid-line; only complete lines count then.
        let complete = if error.is_some() {
            plain
                .iter()
                .rposition(|&b| b == b'\n')
                .map(|pos| &plain[..=pos])
                .unwrap_or(&[])
        } else {
            &plain[..]
        };

        let mut events = Vec::new();
        for (index, line) in non_empty_lines(complete).enumerate() {
            match parse_line(index, line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error.get_or_insert(e);
                    break;
                }
            }
        }

        PartialDecode { events, error }
    }
}

fn non_empty_lines(plain: &[u8]) -> impl Iterator<Item = &[u8]> {
    plain
        .split(|&b| b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}

fn parse_line(index: usize, line: &[u8]) -> Result<Event, CodecError> {
    serde_json::from_slice(line).map_err(|e| CodecError::MalformedEvent {
        index,
        reason: e.to_string(),
    })
}

fn parse_lines(plain: &[u8]) -> Result<Vec<Event>, CodecError> {
    non_empty_lines(plain)
        .enumerate()
        .map(|(index, line)| parse_line(index, line))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| {
                Event::new("PlayerVehicle", "SyncState", vec![json!(i), json!("payload")])
                    .with_entity(format!("e{i}"))
                    .with_timestamp(i as i64)
            })
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let codec = Lz4JsonCodec::new();
        let batch = events(50);
        let bytes = codec.encode(&batch).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), batch);
    }

    #[test]
    fn test_empty_batch() {
        let codec = Lz4JsonCodec::new();
        let bytes = codec.encode(&[]).unwrap();
        assert!(codec.decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = Lz4JsonCodec::new();
        assert!(matches!(
            codec.decode(b"definitely not lz4"),
            Err(CodecError::Decompression(_))
        ));
    }

    #[test]
    fn test_lossy_decode_of_truncated_bytes_never_panics() {
        let codec = Lz4JsonCodec::new();
        let bytes = codec.encode(&events(20)).unwrap();

        for cut in [0, 1, 7, bytes.len() / 2, bytes.len() - 1] {
            let partial = codec.decode_lossy(&bytes[..cut]);
            assert!(partial.events.len() <= 20);
        }
        assert!(codec.decode_lossy(&bytes[..bytes.len() / 2]).error.is_some());

        let whole = codec.decode_lossy(&bytes);
        assert_eq!(whole.events.len(), 20);
        assert!(whole.error.is_none());
    }
}
