//! Pipeline artifacts: dialect-native text plus the structural view the validator checks.

use serde::{Deserialize, Serialize};

use crate::Dialect;

/// One executable unit of a pipeline (a GitLab job or a GitHub Actions job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
    pub name: String,
    /// GitLab `stage:` grouping; `None` for dialects without stage groups.
    pub group: Option<String>,
    /// Image or runner reference (`image:` / `runs-on:`).
    pub runner: Option<String>,
    pub commands: Vec<String>,
    /// Names this stage depends on (`needs:` / `dependencies:`).
    pub needs: Vec<String>,
    /// Keys present on the stage definition, in document order.
    pub keys: Vec<String>,
    /// `false` for bridge/trigger jobs and reusable-workflow calls, which
    /// neither run commands nor need a runner.
    pub executable: bool,
}

impl StageDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            runner: None,
            commands: Vec::new(),
            needs: Vec::new(),
            keys: Vec::new(),
            executable: true,
        }
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Parsed view of a pipeline document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStructure {
    /// Stage definitions in document order.
    pub stages: Vec<StageDef>,
    /// Top-level keys of the document, in document order.
    pub top_level_keys: Vec<String>,
    /// Declared stage groups (GitLab `stages:`), when the document lists them.
    pub declared_groups: Option<Vec<String>>,
    /// Document-wide runner default (GitLab top-level or `default:` image).
    pub default_runner: Option<String>,
}

impl PipelineStructure {
    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn has_top_level_key(&self, key: &str) -> bool {
        self.top_level_keys.iter().any(|k| k == key)
    }
}

/// A generated or repaired pipeline document.
///
/// Artifacts are never edited in place; a repair yields a new artifact so
/// every attempt keeps the exact text it was validated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub dialect: Dialect,
    pub raw: String,
    structure: Option<PipelineStructure>,
    malformed: Option<String>,
}

impl PipelineArtifact {
    /// Build an artifact from successfully parsed text.
    pub fn parsed(dialect: Dialect, raw: impl Into<String>, structure: PipelineStructure) -> Self {
        Self {
            dialect,
            raw: raw.into(),
            structure: Some(structure),
            malformed: None,
        }
    }

    /// Retain text that could not be parsed, flagged with the parse error.
    pub fn malformed(dialect: Dialect, raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            dialect,
            raw: raw.into(),
            structure: None,
            malformed: Some(reason.into()),
        }
    }

    pub fn structure(&self) -> Option<&PipelineStructure> {
        self.structure.as_ref()
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed.is_some()
    }

    pub fn malformed_reason(&self) -> Option<&str> {
        self.malformed.as_deref()
    }

    /// Stage names of the structural view; empty for malformed artifacts.
    pub fn stage_names(&self) -> Vec<&str> {
        self.structure
            .as_ref()
            .map(PipelineStructure::stage_names)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_artifact_keeps_text_and_reason() {
        let a = PipelineArtifact::malformed(Dialect::GitlabCi, "jobs: [", "unexpected end");
        assert!(a.is_malformed());
        assert_eq!(a.raw, "jobs: [");
        assert_eq!(a.malformed_reason(), Some("unexpected end"));
        assert!(a.structure().is_none());
        assert!(a.stage_names().is_empty());
    }

    #[test]
    fn parsed_artifact_exposes_stage_names_in_order() {
        let structure = PipelineStructure {
            stages: vec![StageDef::new("compile"), StageDef::new("test")],
            ..Default::default()
        };
        let a = PipelineArtifact::parsed(Dialect::GithubActions, "...", structure);
        assert!(!a.is_malformed());
        assert_eq!(a.stage_names(), vec!["compile", "test"]);
        assert!(a.structure().unwrap().stage("test").is_some());
        assert!(a.structure().unwrap().stage("deploy").is_none());
    }
}
