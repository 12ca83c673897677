use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Program, ProtoError};

/// Commands the host sends into the simulator frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostCommand {
    StartMap(StartMap),
    LoadMapAndChallenge(LoadMapAndChallenge),
    LoadLevel(LoadLevel),
    RunProgram { program: Program },
    PauseProgram {},
    StopProgram {},
    GetStatus {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMap {
    pub map_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_json: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMapAndChallenge {
    pub map_json: Value,
    pub challenge_json: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadLevel {
    pub level_id: String,
    pub map_key: String,
    #[serde(default)]
    pub metadata: Value,
}

impl HostCommand {
    pub fn start_map(map_key: impl Into<String>) -> Self {
        HostCommand::StartMap(StartMap {
            map_key: map_key.into(),
            map_json: None,
            challenge_json: None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::StartMap(_) => "START_MAP",
            HostCommand::LoadMapAndChallenge(_) => "LOAD_MAP_AND_CHALLENGE",
            HostCommand::LoadLevel(_) => "LOAD_LEVEL",
            HostCommand::RunProgram { .. } => "RUN_PROGRAM",
            HostCommand::PauseProgram {} => "PAUSE_PROGRAM",
            HostCommand::StopProgram {} => "STOP_PROGRAM",
            HostCommand::GetStatus {} => "GET_STATUS",
        }
    }

    /// Builds the `{ source, type, data }` envelope posted across the frame boundary.
    pub fn to_envelope(&self, source: &str) -> Result<Value, ProtoError> {
        let mut value = serde_json::to_value(self).map_err(|source| ProtoError::Encode {
            kind: self.name(),
            source,
        })?;
        if let Value::Object(map) = &mut value {
            map.insert("source".into(), Value::String(source.to_string()));
        }
        Ok(value)
    }
}
