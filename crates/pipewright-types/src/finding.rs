use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Fatal,
    Warning,
}

/// Stable identifiers for every problem the validator (or the orchestrator's
/// regression check) can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCode {
    MalformedDocument,
    EmptyPipeline,
    UnknownDependency,
    DependencyCycle,
    MissingRunner,
    MissingCommands,
    MissingTrigger,
    DisallowedKey,
    DeprecatedKey,
    UndeclaredStage,
    DeprecatedCommand,
    RepairRegression,
}

impl FindingCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingCode::MalformedDocument => "MALFORMED_DOCUMENT",
            FindingCode::EmptyPipeline => "EMPTY_PIPELINE",
            FindingCode::UnknownDependency => "UNKNOWN_DEPENDENCY",
            FindingCode::DependencyCycle => "DEPENDENCY_CYCLE",
            FindingCode::MissingRunner => "MISSING_RUNNER",
            FindingCode::MissingCommands => "MISSING_COMMANDS",
            FindingCode::MissingTrigger => "MISSING_TRIGGER",
            FindingCode::DisallowedKey => "DISALLOWED_KEY",
            FindingCode::DeprecatedKey => "DEPRECATED_KEY",
            FindingCode::UndeclaredStage => "UNDECLARED_STAGE",
            FindingCode::DeprecatedCommand => "DEPRECATED_COMMAND",
            FindingCode::RepairRegression => "REPAIR_REGRESSION",
        }
    }
}

impl fmt::Display for FindingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem detected in an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub code: FindingCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationFinding {
    pub fn fatal(code: FindingCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            code,
            stage: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn warning(code: FindingCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            stage: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// Single-line encoding used in generation and repair prompts.
    pub fn compact(&self) -> String {
        let severity = match self.severity {
            Severity::Fatal => "FATAL",
            Severity::Warning => "WARN",
        };
        let mut line = format!("{severity} {}", self.code);
        if let Some(ref stage) = self.stage {
            line.push_str(&format!(" stage={stage}"));
        }
        if let Some(ref field) = self.field {
            line.push_str(&format!(" field={field}"));
        }
        line.push_str(": ");
        line.push_str(&self.message);
        line
    }
}

pub fn has_fatal(findings: &[ValidationFinding]) -> bool {
    findings.iter().any(ValidationFinding::is_fatal)
}
