//! `pipewright.toml` loading.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use pipewright_llm::BackendConfig;
use pipewright_pipeline::{HealingPolicy, ScoringPolicy};

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "pipewright.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipewrightConfig {
    pub backend: BackendConfig,
    pub policy: HealingPolicy,
    pub feedback: FeedbackConfig,
    pub commit: CommitConfig,
    /// Directory for per-request attempt archives; none are written when unset.
    pub archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// JSON-lines file holding the feedback history.
    pub path: PathBuf,
    #[serde(flatten)]
    pub scoring: ScoringPolicy,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".pipewright/feedback.jsonl"),
            scoring: ScoringPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub base_url: String,
    /// Environment variable holding the GitLab access token.
    pub token_env: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gitlab.com".into(),
            token_env: "GITLAB_TOKEN".into(),
        }
    }
}

impl PipewrightConfig {
    pub fn from_toml(source: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Load `path`, or `./pipewright.toml` when it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    tracing::debug!("No {DEFAULT_CONFIG_FILE} found; using defaults");
                    return Ok(Self::default());
                }
                default
            }
        };
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&source)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::debug!(path = %path.display(), backend = %config.backend.kind(), "Config loaded");
        Ok(config)
    }
}
