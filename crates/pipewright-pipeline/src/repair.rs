//! Repair engine: failing artifact + fatal findings -> revised artifact.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pipewright_llm::{GenerativeBackend, Prompt};
use pipewright_types::{
    Attempt, FindingCode, PipelineArtifact, PipewrightError, Result, ValidationFinding,
};

use crate::dialect::{parse_artifact, strip_code_fence};
use crate::synthesizer::dialect_label;

pub struct RepairEngine {
    backend: Arc<GenerativeBackend>,
    timeout: Duration,
}

impl RepairEngine {
    pub fn new(backend: Arc<GenerativeBackend>) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask the backend for a corrected version of `artifact`.
    ///
    /// Only fatal entries of `findings` are sent. `preserve` names the
    /// stages the revision must keep. The output is not validated here.
    pub async fn repair(
        &self,
        artifact: &PipelineArtifact,
        findings: &[ValidationFinding],
        preserve: &[String],
        cancel: &CancellationToken,
    ) -> Result<PipelineArtifact> {
        let fatal: Vec<&ValidationFinding> = findings.iter().filter(|f| f.is_fatal()).collect();
        if fatal.is_empty() {
            return Err(PipewrightError::InvalidRequest(
                "repair requires at least one fatal finding".into(),
            ));
        }

        let prompt = build_prompt(artifact, &fatal, preserve);
        let text = self.backend.generate(&prompt, self.timeout, cancel).await?;
        let revised = parse_artifact(artifact.dialect, strip_code_fence(&text));
        tracing::info!(
            fixing = fatal.len(),
            stages = revised.stage_names().len(),
            malformed = revised.is_malformed(),
            "Repair candidate received"
        );
        Ok(revised)
    }
}

/// Stages a repair must keep: every stage any well-formed attempt of the
/// request has defined, plus any a previous repair dropped and still owes,
/// in first-seen order.
///
/// A malformed attempt contributes nothing, but it does not clear what
/// earlier attempts established either.
pub fn preserved_stages(history: &[Attempt]) -> Vec<String> {
    let mut stages: Vec<String> = Vec::new();
    for attempt in history {
        let defined = (!attempt.artifact.is_malformed())
            .then(|| attempt.artifact.stage_names())
            .unwrap_or_default();
        let owed = attempt.regressions.iter().filter_map(|f| f.stage.as_deref());
        for stage in defined.into_iter().chain(owed) {
            if !stages.iter().any(|s| s == stage) {
                stages.push(stage.to_string());
            }
        }
    }
    stages
}

/// Entries of `required` that `output` does not define, as
/// `REPAIR_REGRESSION` findings. Empty when `output` did not parse, since
/// the validator already reports that.
pub fn regressions(required: &[String], output: &PipelineArtifact) -> Vec<ValidationFinding> {
    if output.is_malformed() {
        return Vec::new();
    }
    let kept = output.stage_names();
    required
        .iter()
        .filter(|name| !kept.contains(&name.as_str()))
        .map(|name| {
            ValidationFinding::fatal(
                FindingCode::RepairRegression,
                format!("Repair removed stage '{name}', which must be kept"),
            )
            .with_stage(name.as_str())
        })
        .collect()
}

fn build_prompt(
    artifact: &PipelineArtifact,
    fatal: &[&ValidationFinding],
    preserve: &[String],
) -> Prompt {
    let label = dialect_label(artifact.dialect);
    let system = format!(
        "You repair {label} pipeline definitions. Change only what is needed to fix the \
         listed problems. Reply with the complete corrected YAML document inside a single \
         ```yaml code block and nothing else."
    );

    let mut user = format!("This {label} document failed validation:\n");
    user.push_str(&format!("```yaml\n{}\n```\n", artifact.raw.trim_end()));
    user.push_str("\nFix these problems:\n");
    for f in fatal {
        user.push_str(&format!("- {}\n", f.compact()));
    }
    if !preserve.is_empty() {
        user.push_str(&format!(
            "\nKeep these stages, with the same names: {}\n",
            preserve.join(", ")
        ));
    }
    Prompt::new(system, user)
}
