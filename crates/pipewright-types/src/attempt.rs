//! Attempts of the self-healing loop and the append-only log that holds them.

use serde::{Deserialize, Serialize};

use crate::{PipelineArtifact, ValidationFinding};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptAction {
    Accept,
    Repair,
    Abandon,
}

/// Which backend call produced an attempt's artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOrigin {
    Synthesis,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Accepted,
    Abandoned,
    Fatal,
}

/// One iteration of the self-healing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub sequence: usize,
    pub origin: AttemptOrigin,
    pub artifact: PipelineArtifact,
    /// Validator output for `artifact` and nothing else.
    pub findings: Vec<ValidationFinding>,
    /// Stages a repair dropped relative to its input, reported by the orchestrator.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regressions: Vec<ValidationFinding>,
    pub action: AttemptAction,
}

impl Attempt {
    /// Fatal validator findings followed by regression findings.
    pub fn blocking_findings(&self) -> Vec<ValidationFinding> {
        self.findings
            .iter()
            .filter(|f| f.is_fatal())
            .chain(self.regressions.iter())
            .cloned()
            .collect()
    }

    pub fn is_blocked(&self) -> bool {
        !self.regressions.is_empty() || self.findings.iter().any(ValidationFinding::is_fatal)
    }
}

/// Ordered, append-only attempt history for one request.
///
/// Sequence numbers are assigned on append, so they are always contiguous
/// starting at 1; appended attempts are only ever handed out by shared reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptLog {
    attempts: Vec<Attempt>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        origin: AttemptOrigin,
        artifact: PipelineArtifact,
        findings: Vec<ValidationFinding>,
        regressions: Vec<ValidationFinding>,
        action: AttemptAction,
    ) -> &Attempt {
        let sequence = self.attempts.len() + 1;
        self.attempts.push(Attempt {
            sequence,
            origin,
            artifact,
            findings,
            regressions,
            action,
        });
        &self.attempts[sequence - 1]
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn last(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter()
    }

    pub fn as_slice(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn into_vec(self) -> Vec<Attempt> {
        self.attempts
    }
}
