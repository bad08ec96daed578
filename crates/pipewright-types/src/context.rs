//! Project context: the typed, validated inputs that drive one generation request.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{PipewrightError, Result};

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Rust,
    Java,
    JavaScript,
    Go,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Rust,
        Language::Java,
        Language::JavaScript,
        Language::Go,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::Java => "java",
            Language::JavaScript => "javascript",
            Language::Go => "go",
        }
    }

    /// The build tool assumed when the caller does not name one.
    pub fn default_build_tool(&self) -> BuildTool {
        match self {
            Language::Python => BuildTool::Pip,
            Language::Rust => BuildTool::Cargo,
            Language::Java => BuildTool::Maven,
            Language::JavaScript => BuildTool::Npm,
            Language::Go => BuildTool::GoModules,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "rust" | "rs" => Ok(Language::Rust),
            "java" => Ok(Language::Java),
            "javascript" | "js" | "node" | "nodejs" | "typescript" | "ts" => {
                Ok(Language::JavaScript)
            }
            "go" | "golang" => Ok(Language::Go),
            other => Err(PipewrightError::InvalidContext(format!(
                "unsupported language '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// BuildTool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTool {
    Pip,
    Poetry,
    Cargo,
    Maven,
    Gradle,
    Npm,
    Yarn,
    GoModules,
}

impl BuildTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildTool::Pip => "pip",
            BuildTool::Poetry => "poetry",
            BuildTool::Cargo => "cargo",
            BuildTool::Maven => "maven",
            BuildTool::Gradle => "gradle",
            BuildTool::Npm => "npm",
            BuildTool::Yarn => "yarn",
            BuildTool::GoModules => "go_modules",
        }
    }

    /// The language a build tool implies.
    pub fn language(&self) -> Language {
        match self {
            BuildTool::Pip | BuildTool::Poetry => Language::Python,
            BuildTool::Cargo => Language::Rust,
            BuildTool::Maven | BuildTool::Gradle => Language::Java,
            BuildTool::Npm | BuildTool::Yarn => Language::JavaScript,
            BuildTool::GoModules => Language::Go,
        }
    }
}

impl fmt::Display for BuildTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildTool {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pip" => Ok(BuildTool::Pip),
            "poetry" => Ok(BuildTool::Poetry),
            "cargo" => Ok(BuildTool::Cargo),
            "maven" | "mvn" => Ok(BuildTool::Maven),
            "gradle" => Ok(BuildTool::Gradle),
            "npm" => Ok(BuildTool::Npm),
            "yarn" => Ok(BuildTool::Yarn),
            "go" | "go_modules" | "gomod" => Ok(BuildTool::GoModules),
            other => Err(PipewrightError::InvalidContext(format!(
                "unsupported build tool '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Compile,
    Test,
    Package,
    Scan,
    Deploy,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Compile,
        StageKind::Test,
        StageKind::Package,
        StageKind::Scan,
        StageKind::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Compile => "compile",
            StageKind::Test => "test",
            StageKind::Package => "package",
            StageKind::Scan => "scan",
            StageKind::Deploy => "deploy",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compile" | "build" => Ok(StageKind::Compile),
            "test" => Ok(StageKind::Test),
            "package" => Ok(StageKind::Package),
            "scan" => Ok(StageKind::Scan),
            "deploy" => Ok(StageKind::Deploy),
            other => Err(PipewrightError::InvalidContext(format!(
                "unknown stage '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// Target CI vendor whose document syntax generation and validation are parameterised over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    GitlabCi,
    GithubActions,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::GitlabCi => "gitlab_ci",
            Dialect::GithubActions => "github_actions",
        }
    }

    /// Repository path the pipeline document is committed to.
    pub fn default_path(&self) -> &'static str {
        match self {
            Dialect::GitlabCi => ".gitlab-ci.yml",
            Dialect::GithubActions => ".github/workflows/ci.yml",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = PipewrightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "gitlab" | "gitlab_ci" => Ok(Dialect::GitlabCi),
            "github" | "github_actions" | "gha" => Ok(Dialect::GithubActions),
            other => Err(PipewrightError::InvalidContext(format!(
                "unsupported dialect '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextSignature
// ---------------------------------------------------------------------------

/// Deterministic lookup key derived from a [`ProjectContext`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSignature(String);

impl ContextSignature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ProjectContext
// ---------------------------------------------------------------------------

/// Immutable snapshot of the inputs driving one generation request.
///
/// Fields are private so a context can only be obtained through
/// [`ProjectContext::new`] (or deserialisation, which goes through the same
/// checks) and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawProjectContext")]
pub struct ProjectContext {
    languages: Vec<Language>,
    build_tool: Option<BuildTool>,
    stages: Vec<StageKind>,
    dialect: Dialect,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_name: Option<String>,
}

#[derive(Deserialize)]
struct RawProjectContext {
    languages: Vec<Language>,
    #[serde(default)]
    build_tool: Option<BuildTool>,
    stages: Vec<StageKind>,
    dialect: Dialect,
    #[serde(default)]
    project_name: Option<String>,
}

impl TryFrom<RawProjectContext> for ProjectContext {
    type Error = PipewrightError;

    fn try_from(raw: RawProjectContext) -> Result<Self> {
        let mut ctx = ProjectContext::new(raw.languages, raw.stages, raw.dialect)?;
        if let Some(tool) = raw.build_tool {
            ctx = ctx.with_build_tool(tool);
        }
        if let Some(name) = raw.project_name {
            ctx = ctx.with_project_name(name);
        }
        Ok(ctx)
    }
}

impl ProjectContext {
    /// Validate and build a context. Languages keep their given order (the
    /// first one is the primary language); duplicates are rejected.
    pub fn new(languages: Vec<Language>, stages: Vec<StageKind>, dialect: Dialect) -> Result<Self> {
        if languages.is_empty() {
            return Err(PipewrightError::InvalidContext(
                "at least one language is required".into(),
            ));
        }
        if stages.is_empty() {
            return Err(PipewrightError::InvalidContext(
                "at least one stage must be requested".into(),
            ));
        }
        if let Some(dup) = first_duplicate(&languages) {
            return Err(PipewrightError::InvalidContext(format!(
                "language '{dup}' listed more than once"
            )));
        }
        if let Some(dup) = first_duplicate(&stages) {
            return Err(PipewrightError::InvalidContext(format!(
                "stage '{dup}' requested more than once"
            )));
        }
        Ok(Self {
            languages,
            build_tool: None,
            stages,
            dialect,
            project_name: None,
        })
    }

    pub fn with_build_tool(mut self, tool: BuildTool) -> Self {
        self.build_tool = Some(tool);
        self
    }

    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.project_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    pub fn primary_language(&self) -> Language {
        self.languages[0]
    }

    /// Explicit build tool, or the primary language's default.
    pub fn build_tool(&self) -> BuildTool {
        self.build_tool
            .unwrap_or_else(|| self.primary_language().default_build_tool())
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    /// Stage names the caller explicitly requested, in request order.
    pub fn requested_stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(StageKind::as_str).collect()
    }

    /// Derive the feedback lookup key.
    ///
    /// Order-insensitive over languages and stages; the project name is not
    /// part of the key so that history generalises across projects.
    pub fn signature(&self) -> ContextSignature {
        let mut langs: Vec<&str> = self.languages.iter().map(Language::as_str).collect();
        langs.sort_unstable();
        let mut stages: Vec<&str> = self.stages.iter().map(StageKind::as_str).collect();
        stages.sort_unstable();

        let canonical = format!(
            "v1|{}|{}|{}|{}",
            langs.join(","),
            self.build_tool().as_str(),
            stages.join(","),
            self.dialect.as_str()
        );
        let digest = Sha256::digest(canonical.as_bytes());
        ContextSignature(hex::encode(&digest[..16]))
    }
}

fn first_duplicate<T: PartialEq + Copy>(items: &[T]) -> Option<T> {
    items
        .iter()
        .enumerate()
        .find(|&(i, item)| items[..i].contains(item))
        .map(|(_, item)| *item)
}
