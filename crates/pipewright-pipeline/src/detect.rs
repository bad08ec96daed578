//! Project-context extraction from marker files in a checkout.

use std::path::Path;

use pipewright_types::{
    BuildTool, Dialect, Language, PipewrightError, ProjectContext, Result, StageKind,
};

/// A marker file and the language/build tool its presence implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextRule {
    pub marker: &'static str,
    pub language: Language,
    pub build_tool: BuildTool,
}

/// Extraction rules in priority order. A lock file outranks the manifest
/// it belongs to so that the more specific build tool wins.
pub const CONTEXT_RULES: &[ContextRule] = &[
    ContextRule { marker: "Cargo.toml", language: Language::Rust, build_tool: BuildTool::Cargo },
    ContextRule { marker: "poetry.lock", language: Language::Python, build_tool: BuildTool::Poetry },
    ContextRule { marker: "pyproject.toml", language: Language::Python, build_tool: BuildTool::Poetry },
    ContextRule { marker: "requirements.txt", language: Language::Python, build_tool: BuildTool::Pip },
    ContextRule { marker: "pom.xml", language: Language::Java, build_tool: BuildTool::Maven },
    ContextRule { marker: "build.gradle", language: Language::Java, build_tool: BuildTool::Gradle },
    ContextRule { marker: "build.gradle.kts", language: Language::Java, build_tool: BuildTool::Gradle },
    ContextRule { marker: "yarn.lock", language: Language::JavaScript, build_tool: BuildTool::Yarn },
    ContextRule { marker: "package.json", language: Language::JavaScript, build_tool: BuildTool::Npm },
    ContextRule { marker: "go.mod", language: Language::Go, build_tool: BuildTool::GoModules },
];

/// Rules whose marker file exists directly under `dir`, in priority order.
pub fn matching_rules(dir: &Path) -> Vec<&'static ContextRule> {
    CONTEXT_RULES
        .iter()
        .filter(|rule| dir.join(rule.marker).is_file())
        .collect()
}

/// Build a [`ProjectContext`] for the checkout at `dir`.
///
/// Languages are listed in rule order without repeats; the build tool comes
/// from the first matching rule. The directory name becomes the project name.
pub fn detect_context(
    dir: &Path,
    stages: Vec<StageKind>,
    dialect: Dialect,
) -> Result<ProjectContext> {
    if !dir.is_dir() {
        return Err(PipewrightError::InvalidContext(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let rules = matching_rules(dir);
    let Some(first) = rules.first() else {
        return Err(PipewrightError::InvalidContext(format!(
            "no recognised project files in '{}'",
            dir.display()
        )));
    };

    let mut languages: Vec<Language> = Vec::new();
    for rule in &rules {
        if !languages.contains(&rule.language) {
            languages.push(rule.language);
        }
    }
    tracing::debug!(
        dir = %dir.display(),
        languages = ?languages,
        build_tool = %first.build_tool,
        "Detected project context"
    );

    let mut ctx = ProjectContext::new(languages, stages, dialect)?.with_build_tool(first.build_tool);
    if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
        ctx = ctx.with_project_name(name);
    }
    Ok(ctx)
}
