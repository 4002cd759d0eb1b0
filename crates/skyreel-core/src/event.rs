//! Captured telemetry events and their typed interpretations

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Class name of the network message handler
pub const MESSAGE_HANDLER_CLASS: &str = "MessageHandler";
/// Class name of the lobby object
pub const LOBBY_CLASS: &str = "VTOLLobby";

/// Method spawning a networked entity
pub const NET_INSTANTIATE: &str = "NetInstantiate";
/// Method removing a networked entity
pub const NET_DESTROY: &str = "NetDestroy";
/// Method carrying the full lobby description
pub const UPDATE_LOBBY_INFO: &str = "UpdateLobbyInfo";
/// Method carrying the loaded mission description
pub const UPDATE_MISSION_INFO: &str = "UpdateMissionInfo";

/// One captured remote-invocation record
///
/// Events are immutable once they leave the recorder: the recorder stamps
/// `timestamp` with the ingestion wall-clock time before buffering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Target entity, absent for class-level invocations
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Invoked class
    pub class_name: String,
    /// Invoked method
    pub method: String,
    /// Positional arguments, opaque to the recording pipeline
    #[serde(default)]
    pub args: Vec<Value>,
    /// Unix millis
    #[serde(default)]
    pub timestamp: i64,
}

impl Event {
    /// Create a class-level event with timestamp 0
    pub fn new(class_name: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            entity_id: None,
            class_name: class_name.into(),
            method: method.into(),
            args,
            timestamp: 0,
        }
    }

    /// Target a specific entity
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Set the timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `Class.Method` pair, used in diagnostics
    pub fn class_method(&self) -> String {
        format!("{}.{}", self.class_name, self.method)
    }

    fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index).filter(|v| !v.is_null())
    }

    fn arg_string(&self, index: usize) -> Option<String> {
        self.arg(index).and_then(value_to_string)
    }

    fn required_string(&self, index: usize, expected: &'static str) -> Result<String, EventDecodeError> {
        self.arg_string(index)
            .ok_or_else(|| EventDecodeError::new(self, index, expected))
    }
}

/// Error decoding a known event from its positional arguments
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{class_method}: argument {index} is not a valid {expected}")]
pub struct EventDecodeError {
    pub class_method: String,
    pub index: usize,
    pub expected: &'static str,
}

impl EventDecodeError {
    fn new(event: &Event, index: usize, expected: &'static str) -> Self {
        Self {
            class_method: event.class_method(),
            index,
            expected,
        }
    }
}

/// A player entry in the lobby description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: String,
    pub name: String,
}

/// Typed lobby description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LobbyInfo {
    pub name: String,
    pub players: Vec<PlayerInfo>,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
}

/// Typed mission description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissionInfo {
    pub name: String,
    pub mission_id: Option<String>,
    pub campaign_id: Option<String>,
    pub workshop_id: Option<String>,
    pub map: Option<String>,
}

/// The events the core interprets, each with a validated payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownEvent {
    NetInstantiate {
        entity_id: String,
        owner_id: Option<String>,
        path: Option<String>,
    },
    NetDestroy {
        entity_id: String,
    },
    LobbyInfo(LobbyInfo),
    MissionInfo(MissionInfo),
    /// Anything the core passes through without interpreting
    Other,
}

impl KnownEvent {
    /// Decode an event into its typed form
    ///
    /// Unknown class/method pairs decode to [`KnownEvent::Other`]; a known
    /// pair with malformed arguments is an error.
    pub fn decode(event: &Event) -> Result<Self, EventDecodeError> {
        match (event.class_name.as_str(), event.method.as_str()) {
            (MESSAGE_HANDLER_CLASS, NET_INSTANTIATE) => Ok(Self::NetInstantiate {
                entity_id: event.required_string(0, "entity id")?,
                owner_id: event.arg_string(1),
                path: event.arg_string(2),
            }),
            (MESSAGE_HANDLER_CLASS, NET_DESTROY) => Ok(Self::NetDestroy {
                entity_id: event.required_string(0, "entity id")?,
            }),
            (LOBBY_CLASS, UPDATE_LOBBY_INFO) => decode_lobby_info(event).map(Self::LobbyInfo),
            (LOBBY_CLASS, UPDATE_MISSION_INFO) => {
                decode_mission_info(event).map(Self::MissionInfo)
            }
            _ => Ok(Self::Other),
        }
    }
}

/// Lobby info layout: `[0]` name, `[6]` players, `[7]` host id, `[8]` host name
fn decode_lobby_info(event: &Event) -> Result<LobbyInfo, EventDecodeError> {
    let name = event.required_string(0, "lobby name")?;

    let players = match event.arg(6) {
        None => Vec::new(),
        Some(Value::Array(entries)) => entries.iter().filter_map(decode_player).collect(),
        Some(_) => return Err(EventDecodeError::new(event, 6, "player list")),
    };

    Ok(LobbyInfo {
        name,
        players,
        host_id: event.arg_string(7),
        host_name: event.arg_string(8),
    })
}

/// Mission info layout: `[0]` name, `[1]` id, `[2]` campaign, `[3]` workshop id, `[4]` map
fn decode_mission_info(event: &Event) -> Result<MissionInfo, EventDecodeError> {
    Ok(MissionInfo {
        name: event.required_string(0, "mission name")?,
        mission_id: event.arg_string(1),
        campaign_id: event.arg_string(2),
        workshop_id: event.arg_string(3),
        map: event.arg_string(4),
    })
}

fn decode_player(value: &Value) -> Option<PlayerInfo> {
    let id = value.get("steamId").and_then(value_to_string)?;
    let name = value
        .get("pilotName")
        .and_then(value_to_string)
        .unwrap_or_default();
    Some(PlayerInfo { id, name })
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resynchronization snapshot captured when a recording starts
///
/// Serialized verbatim as the payload of the session's `Init` record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncSnapshot {
    #[serde(default)]
    pub lobby_info: Option<Event>,
    #[serde(default)]
    pub mission_info: Option<Event>,
}

impl ResyncSnapshot {
    /// Typed lobby info, if present and well formed
    pub fn lobby(&self) -> Result<Option<LobbyInfo>, EventDecodeError> {
        self.lobby_info
            .as_ref()
            .map(decode_lobby_info)
            .transpose()
    }

    /// Typed mission info, if present and well formed
    pub fn mission(&self) -> Result<Option<MissionInfo>, EventDecodeError> {
        self.mission_info
            .as_ref()
            .map(decode_mission_info)
            .transpose()
    }
}
