//! Dry-run validation: lint rules over the structural view of an artifact.
//!
//! [`validate`] is pure and deterministic. Rules run in a fixed order
//! (well-formedness, dependencies, cycles, required fields, dialect lints)
//! and each rule reports in document order, so the same artifact always
//! yields byte-identical findings. The orchestrator's convergence guard
//! relies on that.

use std::collections::{HashMap, HashSet, VecDeque};

use pipewright_types::{
    Dialect, FindingCode, PipelineArtifact, PipelineStructure, StageDef, ValidationFinding,
};

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &PipelineStructure, dialect: Dialect) -> Vec<ValidationFinding>;
}

// ---------------------------------------------------------------------------
// Dialect vocabularies
// ---------------------------------------------------------------------------

const GITLAB_JOB_KEYS: &[&str] = &[
    "after_script",
    "allow_failure",
    "artifacts",
    "before_script",
    "cache",
    "coverage",
    "dast_configuration",
    "dependencies",
    "environment",
    "except",
    "extends",
    "hooks",
    "id_tokens",
    "identity",
    "image",
    "inherit",
    "interruptible",
    "manual_confirmation",
    "needs",
    "only",
    "pages",
    "parallel",
    "release",
    "resource_group",
    "retry",
    "rules",
    "run",
    "script",
    "secrets",
    "services",
    "stage",
    "tags",
    "timeout",
    "trigger",
    "variables",
    "when",
];

/// Job keywords GitLab still accepts but has superseded (`rules:`).
const GITLAB_DEPRECATED_JOB_KEYS: &[&str] = &["only", "except"];

/// Global keywords superseded by `default:` (and `stages:` for `types`).
const GITLAB_DEPRECATED_TOP_LEVEL: &[&str] =
    &["types", "image", "services", "cache", "before_script", "after_script"];

/// Stage groups GitLab provides when the document declares none.
const GITLAB_DEFAULT_GROUPS: &[&str] = &["build", "test", "deploy"];

const GITHUB_TOP_LEVEL_KEYS: &[&str] = &[
    "name",
    "run-name",
    "on",
    "permissions",
    "env",
    "defaults",
    "concurrency",
    "jobs",
];

const GITHUB_JOB_KEYS: &[&str] = &[
    "name",
    "permissions",
    "needs",
    "if",
    "runs-on",
    "snapshot",
    "environment",
    "concurrency",
    "outputs",
    "env",
    "defaults",
    "steps",
    "timeout-minutes",
    "strategy",
    "continue-on-error",
    "container",
    "services",
    "uses",
    "with",
    "secrets",
];

/// Workflow commands GitHub replaced with environment files.
const GITHUB_DEPRECATED_COMMANDS: &[(&str, &str)] = &[
    ("::set-output", "$GITHUB_OUTPUT"),
    ("::save-state", "$GITHUB_STATE"),
];

fn runner_field(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::GitlabCi => "image",
        Dialect::GithubActions => "runs-on",
    }
}

fn commands_field(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::GitlabCi => "script",
        Dialect::GithubActions => "steps",
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct EmptyPipelineRule;
impl LintRule for EmptyPipelineRule {
    fn name(&self) -> &str {
        "empty_pipeline"
    }
    fn apply(&self, pipeline: &PipelineStructure, _dialect: Dialect) -> Vec<ValidationFinding> {
        if pipeline.stages.is_empty() {
            vec![ValidationFinding::fatal(
                FindingCode::EmptyPipeline,
                "Pipeline defines no stages",
            )]
        } else {
            vec![]
        }
    }
}

struct UnknownDependencyRule;
impl LintRule for UnknownDependencyRule {
    fn name(&self) -> &str {
        "unknown_dependency"
    }
    fn apply(&self, pipeline: &PipelineStructure, _dialect: Dialect) -> Vec<ValidationFinding> {
        let known: HashSet<&str> = pipeline.stages.iter().map(|s| s.name.as_str()).collect();
        let mut findings = Vec::new();
        for stage in &pipeline.stages {
            for dep in &stage.needs {
                if !known.contains(dep.as_str()) {
                    findings.push(
                        ValidationFinding::fatal(
                            FindingCode::UnknownDependency,
                            format!("Stage '{}' depends on unknown stage '{dep}'", stage.name),
                        )
                        .with_stage(&stage.name)
                        .with_field("needs"),
                    );
                }
            }
        }
        findings
    }
}

struct DependencyCycleRule;
impl LintRule for DependencyCycleRule {
    fn name(&self) -> &str {
        "dependency_cycle"
    }
    fn apply(&self, pipeline: &PipelineStructure, _dialect: Dialect) -> Vec<ValidationFinding> {
        match shortest_cycle(&pipeline.stages) {
            Some(cycle) => {
                let start = cycle[0].clone();
                vec![ValidationFinding::fatal(
                    FindingCode::DependencyCycle,
                    format!("Dependency cycle: {}", cycle.join(" -> ")),
                )
                .with_stage(start)
                .with_field("needs")]
            }
            None => vec![],
        }
    }
}

/// Shortest dependency cycle as a closed path (`a -> b -> a`).
///
/// BFS from every stage in document order; a later stage only replaces the
/// current best when its cycle is strictly shorter.
fn shortest_cycle(stages: &[StageDef]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let edges: Vec<Vec<usize>> = stages
        .iter()
        .map(|s| {
            s.needs
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut best: Option<Vec<usize>> = None;
    for start in 0..stages.len() {
        let mut parent: Vec<Option<usize>> = vec![None; stages.len()];
        let mut seen = vec![false; stages.len()];
        let mut queue = VecDeque::from([start]);
        seen[start] = true;
        let mut closing: Option<usize> = None;

        'bfs: while let Some(node) = queue.pop_front() {
            for &next in &edges[node] {
                if next == start {
                    closing = Some(node);
                    break 'bfs;
                }
                if !seen[next] {
                    seen[next] = true;
                    parent[next] = Some(node);
                    queue.push_back(next);
                }
            }
        }

        if let Some(last) = closing {
            let mut path = vec![last];
            let mut cur = last;
            while let Some(p) = parent[cur] {
                path.push(p);
                cur = p;
            }
            path.reverse();
            if path[0] != start {
                path.insert(0, start);
            }
            if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                best = Some(path);
            }
        }
    }

    best.map(|path| {
        let mut names: Vec<String> = path.iter().map(|&i| stages[i].name.clone()).collect();
        names.push(stages[path[0]].name.clone());
        names
    })
}

struct RequiredFieldsRule;
impl LintRule for RequiredFieldsRule {
    fn name(&self) -> &str {
        "required_fields"
    }
    fn apply(&self, pipeline: &PipelineStructure, dialect: Dialect) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();
        for stage in pipeline.stages.iter().filter(|s| s.executable) {
            let runner = stage.runner.as_ref().or(pipeline.default_runner.as_ref());
            if runner.is_none() {
                findings.push(
                    ValidationFinding::fatal(
                        FindingCode::MissingRunner,
                        format!(
                            "Stage '{}' has no {} and no default is set",
                            stage.name,
                            runner_field(dialect)
                        ),
                    )
                    .with_stage(&stage.name)
                    .with_field(runner_field(dialect)),
                );
            }
            if stage.commands.is_empty() {
                findings.push(
                    ValidationFinding::fatal(
                        FindingCode::MissingCommands,
                        format!("Stage '{}' has no {}", stage.name, commands_field(dialect)),
                    )
                    .with_stage(&stage.name)
                    .with_field(commands_field(dialect)),
                );
            }
        }
        if dialect == Dialect::GithubActions && !pipeline.has_top_level_key("on") {
            findings.push(
                ValidationFinding::fatal(
                    FindingCode::MissingTrigger,
                    "Workflow has no 'on' trigger",
                )
                .with_field("on"),
            );
        }
        findings
    }
}

struct GitlabLintRule;
impl LintRule for GitlabLintRule {
    fn name(&self) -> &str {
        "gitlab_lint"
    }
    fn apply(&self, pipeline: &PipelineStructure, dialect: Dialect) -> Vec<ValidationFinding> {
        if dialect != Dialect::GitlabCi {
            return vec![];
        }
        let mut findings = Vec::new();

        for key in &pipeline.top_level_keys {
            if GITLAB_DEPRECATED_TOP_LEVEL.contains(&key.as_str()) {
                let replacement = if key == "types" { "stages" } else { "default" };
                findings.push(
                    ValidationFinding::warning(
                        FindingCode::DeprecatedKey,
                        format!("Top-level '{key}' is deprecated; use '{replacement}'"),
                    )
                    .with_field(key),
                );
            }
        }

        let declared: Vec<&str> = match pipeline.declared_groups {
            Some(ref groups) => groups.iter().map(String::as_str).collect(),
            None => GITLAB_DEFAULT_GROUPS.to_vec(),
        };

        for stage in &pipeline.stages {
            for key in &stage.keys {
                if !GITLAB_JOB_KEYS.contains(&key.as_str()) {
                    findings.push(
                        ValidationFinding::fatal(
                            FindingCode::DisallowedKey,
                            format!("Key '{key}' is not a GitLab CI job keyword"),
                        )
                        .with_stage(&stage.name)
                        .with_field(key),
                    );
                } else if GITLAB_DEPRECATED_JOB_KEYS.contains(&key.as_str()) {
                    findings.push(
                        ValidationFinding::warning(
                            FindingCode::DeprecatedKey,
                            format!("Key '{key}' is deprecated; use 'rules'"),
                        )
                        .with_stage(&stage.name)
                        .with_field(key),
                    );
                }
            }

            let group = stage.group.as_deref().unwrap_or("test");
            let builtin = group == ".pre" || group == ".post";
            if !builtin && !declared.contains(&group) {
                findings.push(
                    ValidationFinding::fatal(
                        FindingCode::UndeclaredStage,
                        format!(
                            "Stage '{}' uses stage '{group}' which is not declared in 'stages' ({})",
                            stage.name,
                            declared.join(", ")
                        ),
                    )
                    .with_stage(&stage.name)
                    .with_field("stage"),
                );
            }
        }
        findings
    }
}

struct GithubLintRule;
impl LintRule for GithubLintRule {
    fn name(&self) -> &str {
        "github_lint"
    }
    fn apply(&self, pipeline: &PipelineStructure, dialect: Dialect) -> Vec<ValidationFinding> {
        if dialect != Dialect::GithubActions {
            return vec![];
        }
        let mut findings = Vec::new();

        for key in &pipeline.top_level_keys {
            if !GITHUB_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                findings.push(
                    ValidationFinding::fatal(
                        FindingCode::DisallowedKey,
                        format!("Key '{key}' is not a workflow keyword"),
                    )
                    .with_field(key),
                );
            }
        }

        for stage in &pipeline.stages {
            for key in &stage.keys {
                if !GITHUB_JOB_KEYS.contains(&key.as_str()) {
                    findings.push(
                        ValidationFinding::fatal(
                            FindingCode::DisallowedKey,
                            format!("Key '{key}' is not a job keyword"),
                        )
                        .with_stage(&stage.name)
                        .with_field(key),
                    );
                }
            }
            for (command, replacement) in GITHUB_DEPRECATED_COMMANDS {
                if stage.commands.iter().any(|c| c.contains(command)) {
                    findings.push(
                        ValidationFinding::warning(
                            FindingCode::DeprecatedCommand,
                            format!("'{command}' is deprecated; write to {replacement}"),
                        )
                        .with_stage(&stage.name)
                        .with_field("steps"),
                    );
                }
            }
        }
        findings
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Built-in rules in evaluation order.
pub fn default_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(EmptyPipelineRule),
        Box::new(UnknownDependencyRule),
        Box::new(DependencyCycleRule),
        Box::new(RequiredFieldsRule),
        Box::new(GitlabLintRule),
        Box::new(GithubLintRule),
    ]
}

/// Validate `artifact` as a `dialect` document.
///
/// A malformed artifact yields exactly one `MALFORMED_DOCUMENT` finding; no
/// other rule runs against it. An empty result means the artifact is clean.
pub fn validate(artifact: &PipelineArtifact, dialect: Dialect) -> Vec<ValidationFinding> {
    let Some(pipeline) = artifact.structure() else {
        let reason = artifact.malformed_reason().unwrap_or("document could not be parsed");
        return vec![ValidationFinding::fatal(
            FindingCode::MalformedDocument,
            format!("Malformed {dialect} document: {reason}"),
        )];
    };

    let mut findings = Vec::new();
    for rule in default_rules() {
        let found = rule.apply(pipeline, dialect);
        if !found.is_empty() {
            tracing::debug!(rule = rule.name(), count = found.len(), "Lint rule reported findings");
        }
        findings.extend(found);
    }
    findings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
