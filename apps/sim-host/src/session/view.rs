use serde::Serialize;
use sim_proto::{BatteryTally, ErrorEvent, LoseEvent, VictoryEvent};

/// Presentational grouping of a defeat so the UI can pick an icon and wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureCategory {
    MapError,
    ValidationError,
    ProgramError,
}

impl FailureCategory {
    /// Case-insensitive keyword match on a free-text reason.
    pub fn classify(reason: &str) -> Self {
        let reason = reason.to_ascii_uppercase();
        let any = |needles: &[&str]| needles.iter().any(|needle| reason.contains(needle));
        if any(&["BOUND", "COLLISION", "WALL"]) {
            FailureCategory::MapError
        } else if any(&["VALIDATION", "STATEMENT"]) {
            FailureCategory::ValidationError
        } else {
            FailureCategory::ProgramError
        }
    }

    /// ERROR events may already name their category in `type`.
    pub fn from_error_type(kind: &str) -> Option<Self> {
        match kind.trim().to_ascii_uppercase().as_str() {
            "MAP_ERROR" => Some(FailureCategory::MapError),
            "VALIDATION_ERROR" => Some(FailureCategory::ValidationError),
            "PROGRAM_ERROR" => Some(FailureCategory::ProgramError),
            _ => None,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            FailureCategory::MapError => "The robot left the track",
            FailureCategory::ValidationError => "The program is not valid",
            FailureCategory::ProgramError => "The program failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VictoryView {
    pub map_key: Option<String>,
    pub message: String,
    pub progress: Option<f64>,
    pub collected: Option<BatteryTally>,
    pub required: Option<BatteryTally>,
}

impl VictoryView {
    pub fn from_event(event: &VictoryEvent) -> Self {
        Self {
            map_key: event.map_key.clone(),
            message: event
                .message
                .clone()
                .unwrap_or_else(|| "Level complete".to_string()),
            progress: event.progress,
            collected: event.collected,
            required: event.required,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefeatView {
    pub category: FailureCategory,
    pub title: &'static str,
    pub reason: String,
    pub message: String,
    pub step: Option<u32>,
}

impl DefeatView {
    pub fn from_lose(event: &LoseEvent) -> Self {
        let reason = event
            .reason
            .clone()
            .or_else(|| event.message.clone())
            .unwrap_or_default();
        let category = FailureCategory::classify(&reason);
        Self {
            category,
            title: category.title(),
            message: event.message.clone().unwrap_or_else(|| reason.clone()),
            reason,
            step: event.failed_step,
        }
    }

    pub fn from_error(event: &ErrorEvent) -> Self {
        let category = FailureCategory::from_error_type(&event.kind).unwrap_or_else(|| {
            FailureCategory::classify(&format!("{} {}", event.kind, event.message))
        });
        let reason = if event.kind.is_empty() {
            event.message.clone()
        } else {
            event.kind.clone()
        };
        Self {
            category,
            title: category.title(),
            reason,
            message: event.message.clone(),
            step: event.step,
        }
    }
}
