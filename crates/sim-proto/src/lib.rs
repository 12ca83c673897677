//! Wire protocol shared by the simulator host and the embedded simulator.
//!
//! Every message crossing the frame boundary is an [`Envelope`] of the shape
//! `{ source, type, data }`. Host-issued commands and simulator-issued events
//! are decoded into tagged unions so callers never touch raw JSON payloads.

pub mod command;
pub mod event;
pub mod program;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use command::{HostCommand, LoadLevel, LoadMapAndChallenge, StartMap};
pub use event::{ErrorEvent, EventKind, LoseEvent, SimulatorEvent, VictoryEvent};
pub use program::{ActionKind, Program, ProgramAction, ProgramFunction, ValidationError};
pub use snapshot::{
    BatteryCounts, BatteryTally, GameSnapshot, GameSnapshotPatch, Position, ProgramStatus,
};

/// Default sender tag for messages written by the host page.
pub const HOST_SOURCE: &str = "host";
/// Default sender tag for messages written by the simulator.
pub const SIMULATOR_SOURCE: &str = "simulator";

/// Untyped wire unit. `kind` carries the `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn from_value(value: Value) -> Result<Self, ProtoError> {
        serde_json::from_value(value).map_err(ProtoError::Envelope)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {kind} command: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_defaults_missing_data_to_null() {
        let envelope =
            Envelope::from_value(json!({"source": "simulator", "type": "READY"})).unwrap();
        assert_eq!(envelope.kind, "READY");
        assert!(envelope.data.is_null());
    }

    #[test]
    fn envelope_requires_source() {
        let err = Envelope::from_value(json!({"type": "READY", "data": {}})).unwrap_err();
        assert!(matches!(err, ProtoError::Envelope(_)));
    }
}
