//! Pipeline synthesizer: project context + ranked templates -> candidate artifact.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pipewright_llm::{GenerativeBackend, Prompt};
use pipewright_types::{Dialect, PipelineArtifact, ProjectContext, Result, ValidationFinding};

use crate::dialect::{parse_artifact, strip_code_fence};
use crate::feedback::FeedbackService;
use crate::templates::{Skeleton, TemplateStore};

/// A candidate artifact and the templates its prompt was built from.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub artifact: PipelineArtifact,
    pub template_ids: Vec<String>,
}

pub struct Synthesizer {
    backend: Arc<GenerativeBackend>,
    templates: Arc<TemplateStore>,
    feedback: FeedbackService,
    timeout: Duration,
}

impl Synthesizer {
    pub fn new(
        backend: Arc<GenerativeBackend>,
        templates: Arc<TemplateStore>,
        feedback: FeedbackService,
    ) -> Self {
        Self {
            backend,
            templates,
            feedback,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rank the applicable templates by feedback score and render the skeleton.
    pub async fn plan(&self, ctx: &ProjectContext) -> Result<Skeleton> {
        let signature = ctx.signature();
        let candidate_ids: Vec<&str> = self
            .templates
            .candidates(ctx)
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();
        let scores = self.feedback.scores_for(&signature, &candidate_ids).await;
        let ranked = self.templates.rank(ctx, &scores);
        tracing::debug!(
            signature = %signature,
            ranked = ?ranked.iter().map(|r| (r.template.id.as_str(), r.score)).collect::<Vec<_>>(),
            "Templates ranked"
        );
        self.templates.render_skeleton(ctx, &ranked)
    }

    /// Generate a candidate pipeline for `ctx`.
    ///
    /// `prior_findings`, when given, are appended to the prompt in compact
    /// form so the backend can steer clear of them. Text that does not parse
    /// comes back as a malformed artifact, not an error.
    pub async fn synthesize(
        &self,
        ctx: &ProjectContext,
        prior_findings: Option<&[ValidationFinding]>,
        cancel: &CancellationToken,
    ) -> Result<Synthesis> {
        let skeleton = self.plan(ctx).await?;
        let prompt = build_prompt(ctx, &skeleton, prior_findings);
        let text = self.backend.generate(&prompt, self.timeout, cancel).await?;
        let artifact = parse_artifact(ctx.dialect(), strip_code_fence(&text));
        tracing::info!(
            templates = ?skeleton.template_ids,
            stages = artifact.stage_names().len(),
            malformed = artifact.is_malformed(),
            "Candidate pipeline synthesized"
        );
        Ok(Synthesis {
            artifact,
            template_ids: skeleton.template_ids,
        })
    }
}

pub(crate) fn dialect_label(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::GitlabCi => "GitLab CI",
        Dialect::GithubActions => "GitHub Actions",
    }
}

fn build_prompt(
    ctx: &ProjectContext,
    skeleton: &Skeleton,
    prior_findings: Option<&[ValidationFinding]>,
) -> Prompt {
    let dialect = ctx.dialect();
    let system = format!(
        "You are a CI/CD engineer who writes {label} pipeline definitions. \
         Reply with exactly one YAML document inside a single ```yaml code block and nothing else.",
        label = dialect_label(dialect)
    );

    let languages: Vec<&str> = ctx.languages().iter().map(|l| l.as_str()).collect();
    let mut user = String::new();
    if let Some(name) = ctx.project_name() {
        user.push_str(&format!("Project: {name}\n"));
    }
    user.push_str(&format!("Languages: {}\n", languages.join(", ")));
    user.push_str(&format!("Build tool: {}\n", ctx.build_tool()));
    user.push_str(&format!(
        "Target: {} ({})\n",
        dialect_label(dialect),
        dialect.default_path()
    ));
    user.push_str(&format!(
        "Required stages, in order: {}\n\n",
        ctx.requested_stage_names().join(", ")
    ));
    user.push_str(
        "Start from this skeleton, assembled from templates that worked for similar projects. \
         Keep one job per required stage and keep the job names.\n",
    );
    user.push_str(&format!("```yaml\n{}```\n", skeleton.text));

    if let Some(findings) = prior_findings.filter(|f| !f.is_empty()) {
        user.push_str("\nA previous candidate was rejected by the validator:\n");
        for f in findings {
            user.push_str(&format!("- {}\n", f.compact()));
        }
        user.push_str("Do not repeat these problems.\n");
    }

    Prompt::new(system, user)
}
