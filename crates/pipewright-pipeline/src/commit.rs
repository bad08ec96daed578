//! Commit gateway: persists an accepted artifact to a source repository.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use pipewright_types::{PipelineArtifact, PipewrightError, Result};

/// Where an accepted artifact should be committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLocator {
    /// Numeric project id or `group/project` path.
    pub project: String,
    pub branch: String,
    /// Overrides the dialect's default pipeline path.
    #[serde(default)]
    pub pipeline_path: Option<String>,
    #[serde(default = "default_container_path")]
    pub container_path: String,
}

fn default_container_path() -> String {
    "Dockerfile".to_string()
}

impl RepositoryLocator {
    pub fn new(project: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            branch: branch.into(),
            pipeline_path: None,
            container_path: default_container_path(),
        }
    }

    pub fn with_pipeline_path(mut self, path: impl Into<String>) -> Self {
        self.pipeline_path = Some(path.into());
        self
    }

    /// Repository path the pipeline document is written to.
    pub fn pipeline_path_for(&self, artifact: &PipelineArtifact) -> String {
        self.pipeline_path
            .clone()
            .unwrap_or_else(|| artifact.dialect.default_path().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub commit_id: String,
    pub branch: String,
    pub files: Vec<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[async_trait]
pub trait CommitGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Write the pipeline document (and the container file when given) in a
    /// single commit. Failures surface as [`PipewrightError::CommitFailed`].
    async fn commit(
        &self,
        artifact: &PipelineArtifact,
        container_file: Option<&str>,
        locator: &RepositoryLocator,
    ) -> Result<CommitResult>;
}

// ---------------------------------------------------------------------------
// GitLabCommitGateway
// ---------------------------------------------------------------------------

/// Creates or updates files through the GitLab repository commits API.
#[derive(Debug)]
pub struct GitLabCommitGateway {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl GitLabCommitGateway {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Read the access token from `token_env`.
    pub fn from_env(base_url: impl Into<String>, token_env: &str) -> Result<Self> {
        let token = std::env::var(token_env).map_err(|_| {
            PipewrightError::Config(format!("environment variable {token_env} is not set"))
        })?;
        Ok(Self::new(base_url, token))
    }

    fn project_url(&self, project: &str) -> String {
        format!(
            "{}/api/v4/projects/{}",
            self.base_url,
            urlencoding::encode(project)
        )
    }

    fn file_url(&self, project: &str, path: &str) -> String {
        format!(
            "{}/repository/files/{}",
            self.project_url(project),
            urlencoding::encode(path)
        )
    }

    async fn file_exists(&self, locator: &RepositoryLocator, path: &str) -> Result<bool> {
        let url = self.file_url(&locator.project, path);
        let resp = self
            .client
            .head(url)
            .query(&[("ref", locator.branch.as_str())])
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(transport_error)?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(PipewrightError::CommitFailed {
                gateway: "gitlab".into(),
                status,
                message: format!("could not check whether {path} exists"),
            }),
        }
    }
}

fn transport_error(e: reqwest::Error) -> PipewrightError {
    PipewrightError::CommitFailed {
        gateway: "gitlab".into(),
        status: 0,
        message: e.to_string(),
    }
}

fn commit_action(path: &str, content: &str, exists: bool) -> serde_json::Value {
    json!({
        "action": if exists { "update" } else { "create" },
        "file_path": path,
        "content": content,
    })
}

fn map_error(status: reqwest::StatusCode, body: &str) -> PipewrightError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v["message"]
                .as_str()
                .map(String::from)
                .or_else(|| v["error"].as_str().map(String::from))
        })
        .unwrap_or_else(|| body.to_string());
    PipewrightError::CommitFailed {
        gateway: "gitlab".into(),
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl CommitGateway for GitLabCommitGateway {
    fn name(&self) -> &str {
        "gitlab"
    }

    async fn commit(
        &self,
        artifact: &PipelineArtifact,
        container_file: Option<&str>,
        locator: &RepositoryLocator,
    ) -> Result<CommitResult> {
        let pipeline = format!("{}\n", artifact.raw.trim_end());
        let mut files: Vec<(String, &str)> =
            vec![(locator.pipeline_path_for(artifact), pipeline.as_str())];
        if let Some(content) = container_file {
            files.push((locator.container_path.clone(), content));
        }

        let mut actions = Vec::with_capacity(files.len());
        for (path, content) in &files {
            let exists = self.file_exists(locator, path).await?;
            actions.push(commit_action(path, content, exists));
        }

        let body = json!({
            "branch": locator.branch,
            "commit_message": format!("ci: update {}", artifact.dialect.default_path()),
            "actions": actions,
        });

        let resp = self
            .client
            .post(format!("{}/repository/commits", self.project_url(&locator.project)))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(map_error(status, &text));
        }

        let json: serde_json::Value = serde_json::from_str(&text)?;
        let result = CommitResult {
            commit_id: json["id"].as_str().unwrap_or_default().to_string(),
            branch: locator.branch.clone(),
            files: files.into_iter().map(|(p, _)| p).collect(),
            web_url: json["web_url"].as_str().map(String::from),
        };
        tracing::info!(
            project = %locator.project,
            branch = %locator.branch,
            commit = %result.commit_id,
            "Committed pipeline"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::{Dialect, PipelineStructure};

    #[test]
    fn project_and_file_paths_are_single_url_segments() {
        let gateway = GitLabCommitGateway::new("https://gitlab.example.com", "t");
        assert_eq!(
            gateway.project_url("group/sub/app"),
            "https://gitlab.example.com/api/v4/projects/group%2Fsub%2Fapp"
        );
        assert_eq!(
            gateway.file_url("42", ".github/workflows/ci.yml"),
            "https://gitlab.example.com/api/v4/projects/42/repository/files/.github%2Fworkflows%2Fci.yml"
        );
        assert_eq!(
            gateway.file_url("42", ".gitlab-ci.yml"),
            "https://gitlab.example.com/api/v4/projects/42/repository/files/.gitlab-ci.yml"
        );
    }

    #[test]
    fn pipeline_path_defaults_to_dialect_path() {
        let artifact =
            PipelineArtifact::parsed(Dialect::GithubActions, "on: push", PipelineStructure::default());
        let locator = RepositoryLocator::new("g/p", "main");
        assert_eq!(locator.pipeline_path_for(&artifact), ".github/workflows/ci.yml");
        let custom = locator.with_pipeline_path("ci/build.yml");
        assert_eq!(custom.pipeline_path_for(&artifact), "ci/build.yml");
    }

    #[test]
    fn commit_action_chooses_create_or_update() {
        assert_eq!(commit_action("a", "x", false)["action"], "create");
        assert_eq!(commit_action("a", "x", true)["action"], "update");
    }

    #[test]
    fn error_message_is_extracted() {
        let err = map_error(
            reqwest::StatusCode::FORBIDDEN,
            r#"{"message":"403 Forbidden - protected branch"}"#,
        );
        assert!(matches!(
            err,
            PipewrightError::CommitFailed { status: 403, .. }
        ));
        assert!(err.to_string().contains("protected branch"));
    }

    #[test]
    fn from_env_requires_token() {
        std::env::remove_var("PIPEWRIGHT_TEST_MISSING_TOKEN");
        let err = GitLabCommitGateway::from_env("https://gitlab.example.com", "PIPEWRIGHT_TEST_MISSING_TOKEN")
            .unwrap_err();
        assert!(matches!(err, PipewrightError::Config(_)));
    }

    #[test]
    fn locator_deserializes_with_defaults() {
        let locator: RepositoryLocator =
            serde_json::from_str(r#"{"project":"7","branch":"ci"}"#).unwrap();
        assert_eq!(locator.container_path, "Dockerfile");
        assert!(locator.pipeline_path.is_none());
    }
}
