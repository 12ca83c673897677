use serde::{Deserialize, Serialize};

/// Execution status of the program currently loaded in the simulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryCounts {
    pub red: u32,
    pub yellow: u32,
    pub green: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatteryTally {
    pub total: u32,
    pub by_type: BatteryCounts,
}

/// Last authoritative status reported by the simulator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameSnapshot {
    pub map_key: Option<String>,
    pub robot_position: Position,
    /// 0: north, 1: east, 2: south, 3: west.
    pub robot_direction: u8,
    pub collected_batteries: u32,
    pub collected_battery_types: BatteryCounts,
    pub program_status: ProgramStatus,
    pub current_step: u32,
    pub total_steps: u32,
}

impl GameSnapshot {
    /// Zeroed snapshot used right after a map load, before the simulator reports back.
    pub fn fresh(map_key: impl Into<String>) -> Self {
        Self {
            map_key: Some(map_key.into()),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, patch: &GameSnapshotPatch) {
        if let Some(map_key) = &patch.map_key {
            self.map_key = Some(map_key.clone());
        }
        if let Some(position) = patch.robot_position {
            self.robot_position = position;
        }
        if let Some(direction) = patch.robot_direction {
            self.robot_direction = direction;
        }
        if let Some(collected) = patch.collected_batteries {
            self.collected_batteries = collected;
        }
        if let Some(types) = patch.collected_battery_types {
            self.collected_battery_types = types;
        }
        if let Some(status) = patch.program_status {
            self.program_status = status;
        }
        if let Some(step) = patch.current_step {
            self.current_step = step;
        }
        if let Some(total) = patch.total_steps {
            self.total_steps = total;
        }
    }
}

/// Partial snapshot carried by PROGRESS events. Absent fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GameSnapshotPatch {
    pub map_key: Option<String>,
    pub robot_position: Option<Position>,
    pub robot_direction: Option<u8>,
    pub collected_batteries: Option<u32>,
    pub collected_battery_types: Option<BatteryCounts>,
    pub program_status: Option<ProgramStatus>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub progress: Option<f64>,
    pub message: Option<String>,
}
