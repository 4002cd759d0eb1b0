//! Ledger records

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

/// Payload of the terminal lifecycle marker
pub const STOP_MARKER: &str = "stop";

/// Kind of a persisted ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// Session/lobby snapshot captured at recording start
    Init,
    /// One codec-compressed flush batch, base64 in the payload
    Packet,
    /// Lifecycle marker such as [`STOP_MARKER`]
    Event,
}

/// One durably persisted unit in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unique record id
    pub id: String,
    /// Recording session this record belongs to
    pub session_id: String,
    /// Lobby being recorded
    pub lobby_id: String,
    pub kind: RecordKind,
    /// Text-safe payload; interpretation depends on `kind`
    pub payload: String,
    /// Unix millis
    pub timestamp: i64,
}

impl LogRecord {
    fn new(
        session_id: &str,
        lobby_id: &str,
        kind: RecordKind,
        payload: String,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            lobby_id: lobby_id.to_string(),
            kind,
            payload,
            timestamp,
        }
    }

    /// Create the `Init` record carrying a serialized snapshot
    pub fn init(session_id: &str, lobby_id: &str, snapshot_json: String, timestamp: i64) -> Self {
        Self::new(session_id, lobby_id, RecordKind::Init, snapshot_json, timestamp)
    }

    /// Create a `Packet` record from compressed batch bytes
    pub fn packet(session_id: &str, lobby_id: &str, compressed: &[u8], timestamp: i64) -> Self {
        Self::new(
            session_id,
            lobby_id,
            RecordKind::Packet,
            BASE64.encode(compressed),
            timestamp,
        )
    }

    /// Create the terminal `stop` marker
    pub fn stop(session_id: &str, lobby_id: &str, timestamp: i64) -> Self {
        Self::new(
            session_id,
            lobby_id,
            RecordKind::Event,
            STOP_MARKER.to_string(),
            timestamp,
        )
    }

    /// Whether this is the terminal `stop` marker
    pub fn is_stop_marker(&self) -> bool {
        self.kind == RecordKind::Event && self.payload == STOP_MARKER
    }

    /// Decoded compressed bytes of a `Packet` record
    pub fn packet_bytes(&self) -> Result<Vec<u8>, CodecError> {
        BASE64
            .decode(self.payload.as_bytes())
            .map_err(|e| CodecError::Payload(e.to_string()))
    }
}
