use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Program submitted to the simulator by RUN_PROGRAM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub version: String,
    pub program_name: String,
    pub actions: Vec<ProgramAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<ProgramFunction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramFunction {
    pub name: String,
    pub body: Vec<ProgramAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Forward,
    TurnRight,
    TurnLeft,
    TurnBack,
    Collect,
    CollectOnce,
    TakeBox,
    PutBox,
    Repeat,
    RepeatRange,
    If,
    While,
    CallFunction,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Forward => "forward",
            ActionKind::TurnRight => "turnRight",
            ActionKind::TurnLeft => "turnLeft",
            ActionKind::TurnBack => "turnBack",
            ActionKind::Collect => "collect",
            ActionKind::CollectOnce => "collectOnce",
            ActionKind::TakeBox => "takeBox",
            ActionKind::PutBox => "putBox",
            ActionKind::Repeat => "repeat",
            ActionKind::RepeatRange => "repeatRange",
            ActionKind::If => "if",
            ActionKind::While => "while",
            ActionKind::CallFunction => "callFunction",
        }
    }

    fn requires_count(self) -> bool {
        matches!(
            self,
            ActionKind::Forward | ActionKind::Collect | ActionKind::CollectOnce
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub colors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<ProgramAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub then: Vec<ProgramAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

impl ProgramAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            count: None,
            color: None,
            colors: Vec::new(),
            body: Vec::new(),
            variable: None,
            from: None,
            to: None,
            step: None,
            cond: None,
            condition: None,
            then: Vec::new(),
            function_name: None,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_body(mut self, body: Vec<ProgramAction>) -> Self {
        self.body = body;
        self
    }

    pub fn call(function_name: impl Into<String>) -> Self {
        let mut action = Self::new(ActionKind::CallFunction);
        action.function_name = Some(function_name.into());
        action
    }
}

/// Structural problems found in a program before it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid program: {}", .problems.join(", "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl Program {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut problems = Vec::new();
        if self.version.trim().is_empty() {
            problems.push("program version is required".to_string());
        }
        if self.program_name.trim().is_empty() {
            problems.push("program name is required".to_string());
        }

        let declared: HashSet<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
        validate_actions(&self.actions, "action", &declared, &mut problems);
        for function in &self.functions {
            if function.name.trim().is_empty() {
                problems.push("function name is required".to_string());
            }
            let scope = format!("function {}", function.name);
            validate_actions(&function.body, &scope, &declared, &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { problems })
        }
    }
}

fn validate_actions(
    actions: &[ProgramAction],
    scope: &str,
    declared: &HashSet<&str>,
    problems: &mut Vec<String>,
) {
    for (index, action) in actions.iter().enumerate() {
        let path = format!("{scope} {index}");
        if action.kind.requires_count() && action.count.unwrap_or(0) < 1 {
            problems.push(format!(
                "{path}: {} action requires count >= 1",
                action.kind.as_str()
            ));
        }
        if action.kind == ActionKind::CallFunction {
            match action.function_name.as_deref() {
                Some(name) if declared.contains(name) => {}
                Some(name) => problems.push(format!("{path}: unknown function {name}")),
                None => problems.push(format!("{path}: callFunction requires functionName")),
            }
        }
        validate_actions(&action.body, &format!("{path} body"), declared, problems);
        validate_actions(&action.then, &format!("{path} then"), declared, problems);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn program(actions: Vec<ProgramAction>) -> Program {
        Program {
            version: "1.0".into(),
            program_name: "test".into(),
            actions,
            functions: Vec::new(),
        }
    }

    #[test]
    fn accepts_simple_program() {
        let program = program(vec![
            ProgramAction::new(ActionKind::Forward).with_count(2),
            ProgramAction::new(ActionKind::TurnRight),
            ProgramAction::new(ActionKind::Collect).with_count(1),
        ]);
        assert!(program.validate().is_ok());
    }

    #[test]
    fn rejects_forward_without_count() {
        let err = program(vec![ProgramAction::new(ActionKind::Forward)])
            .validate()
            .unwrap_err();
        assert_eq!(err.problems, ["action 0: forward action requires count >= 1"]);
    }

    #[test]
    fn reports_every_problem() {
        let mut invalid = program(vec![
            ProgramAction::new(ActionKind::Repeat)
                .with_count(3)
                .with_body(vec![ProgramAction::new(ActionKind::CollectOnce).with_count(0)]),
            ProgramAction::call("missing"),
        ]);
        invalid.version.clear();

        let err = invalid.validate().unwrap_err();
        assert_eq!(err.problems.len(), 3);
        assert!(err.problems[0].contains("version"));
        assert!(err.problems[1].contains("action 0 body 0"));
        assert!(err.problems[2].contains("unknown function missing"));
        assert!(err.to_string().starts_with("invalid program:"));
    }

    #[test]
    fn call_to_declared_function_is_valid() {
        let mut program = program(vec![ProgramAction::call("zigzag")]);
        program.functions.push(ProgramFunction {
            name: "zigzag".into(),
            body: vec![ProgramAction::new(ActionKind::TurnLeft)],
        });
        assert!(program.validate().is_ok());
    }

    #[test]
    fn decodes_wire_shape() {
        let program: Program = serde_json::from_value(json!({
            "version": "1.0.0",
            "programName": "user_program",
            "actions": [
                {"type": "forward", "count": 3},
                {"type": "repeat", "count": 2, "body": [{"type": "turnLeft"}]},
                {"type": "callFunction", "functionName": "f"}
            ],
            "functions": [{"name": "f", "body": [{"type": "collect", "count": 1, "color": "red"}]}]
        }))
        .unwrap();
        assert_eq!(program.actions[1].body[0].kind, ActionKind::TurnLeft);
        assert_eq!(program.functions[0].body[0].color.as_deref(), Some("red"));
        assert!(program.validate().is_ok());
    }
}
