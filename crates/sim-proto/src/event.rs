use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{BatteryTally, GameSnapshot, GameSnapshotPatch, ProtoError};

/// Discriminator of an inbound simulator event. Handlers are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    Progress,
    Victory,
    Lose,
    Error,
    Status,
    ProgramStarted,
    ProgramPaused,
    ProgramStopped,
    Unknown,
}

impl EventKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "READY" => EventKind::Ready,
            "PROGRESS" => EventKind::Progress,
            "VICTORY" => EventKind::Victory,
            "LOSE" => EventKind::Lose,
            "ERROR" => EventKind::Error,
            "STATUS" => EventKind::Status,
            "PROGRAM_STARTED" => EventKind::ProgramStarted,
            "PROGRAM_PAUSED" => EventKind::ProgramPaused,
            "PROGRAM_STOPPED" => EventKind::ProgramStopped,
            _ => EventKind::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Ready => "READY",
            EventKind::Progress => "PROGRESS",
            EventKind::Victory => "VICTORY",
            EventKind::Lose => "LOSE",
            EventKind::Error => "ERROR",
            EventKind::Status => "STATUS",
            EventKind::ProgramStarted => "PROGRAM_STARTED",
            EventKind::ProgramPaused => "PROGRAM_PAUSED",
            EventKind::ProgramStopped => "PROGRAM_STOPPED",
            EventKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task completion announcement. The simulator does not always know its map key.
///
/// Every field is optional and a field of the wrong shape decodes as absent,
/// so a sloppy payload still counts as a victory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VictoryEvent {
    #[serde(deserialize_with = "lenient")]
    pub map_key: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub is_victory: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    pub progress: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub collected: Option<BatteryTally>,
    #[serde(deserialize_with = "lenient")]
    pub required: Option<BatteryTally>,
}

/// Older simulator builds send the failed step as `step`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "LoseWire")]
pub struct LoseEvent {
    pub map_key: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub failed_step: Option<u32>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LoseWire {
    #[serde(deserialize_with = "lenient")]
    map_key: Option<String>,
    #[serde(deserialize_with = "lenient")]
    reason: Option<String>,
    #[serde(deserialize_with = "lenient")]
    message: Option<String>,
    #[serde(deserialize_with = "lenient")]
    failed_step: Option<u32>,
    #[serde(deserialize_with = "lenient")]
    step: Option<u32>,
}

impl From<LoseWire> for LoseEvent {
    fn from(wire: LoseWire) -> Self {
        Self {
            map_key: wire.map_key,
            reason: wire.reason,
            message: wire.message,
            failed_step: wire.failed_step.or(wire.step),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub details: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    pub step: Option<u32>,
}

/// Typed inbound event. Unrecognised types are kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatorEvent {
    Ready,
    Progress(GameSnapshotPatch),
    Victory(VictoryEvent),
    Lose(LoseEvent),
    Error(ErrorEvent),
    Status(GameSnapshot),
    ProgramStarted,
    ProgramPaused,
    ProgramStopped,
    Unknown { kind: String, data: Value },
}

impl SimulatorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimulatorEvent::Ready => EventKind::Ready,
            SimulatorEvent::Progress(_) => EventKind::Progress,
            SimulatorEvent::Victory(_) => EventKind::Victory,
            SimulatorEvent::Lose(_) => EventKind::Lose,
            SimulatorEvent::Error(_) => EventKind::Error,
            SimulatorEvent::Status(_) => EventKind::Status,
            SimulatorEvent::ProgramStarted => EventKind::ProgramStarted,
            SimulatorEvent::ProgramPaused => EventKind::ProgramPaused,
            SimulatorEvent::ProgramStopped => EventKind::ProgramStopped,
            SimulatorEvent::Unknown { .. } => EventKind::Unknown,
        }
    }

    pub fn decode(kind: &str, data: Value) -> Result<Self, ProtoError> {
        let event = match EventKind::from_wire(kind) {
            EventKind::Ready => SimulatorEvent::Ready,
            EventKind::Progress => SimulatorEvent::Progress(payload("PROGRESS", data)?),
            EventKind::Victory => SimulatorEvent::Victory(payload("VICTORY", data)?),
            EventKind::Lose => SimulatorEvent::Lose(payload("LOSE", data)?),
            EventKind::Error => SimulatorEvent::Error(payload("ERROR", data)?),
            EventKind::Status => SimulatorEvent::Status(payload("STATUS", data)?),
            EventKind::ProgramStarted => SimulatorEvent::ProgramStarted,
            EventKind::ProgramPaused => SimulatorEvent::ProgramPaused,
            EventKind::ProgramStopped => SimulatorEvent::ProgramStopped,
            EventKind::Unknown => SimulatorEvent::Unknown {
                kind: kind.to_string(),
                data,
            },
        };
        Ok(event)
    }

    /// Inverse of [`SimulatorEvent::decode`], used by simulator-side fakes.
    pub fn to_envelope(&self, source: &str) -> Value {
        let (kind, data) = match self {
            SimulatorEvent::Progress(patch) => ("PROGRESS", to_data(patch)),
            SimulatorEvent::Victory(victory) => ("VICTORY", to_data(victory)),
            SimulatorEvent::Lose(lose) => ("LOSE", to_data(lose)),
            SimulatorEvent::Error(error) => ("ERROR", to_data(error)),
            SimulatorEvent::Status(snapshot) => ("STATUS", to_data(snapshot)),
            SimulatorEvent::Unknown { kind, data } => {
                return serde_json::json!({"source": source, "type": kind, "data": data});
            }
            other => (other.kind().as_str(), Value::Object(Map::new())),
        };
        serde_json::json!({"source": source, "type": kind, "data": data})
    }
}

fn payload<T: DeserializeOwned>(kind: &'static str, data: Value) -> Result<T, ProtoError> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|source| ProtoError::Payload { kind, source })
}

/// Decodes an optional field, treating a value of the wrong shape as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value::<Option<T>>(value).ok().flatten())
}

fn to_data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| Value::Object(Map::new()))
}
