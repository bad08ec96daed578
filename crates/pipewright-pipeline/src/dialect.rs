//! Dialect-native parsing: pipeline text to [`PipelineArtifact`].
//!
//! Both supported dialects are YAML. Parsing never fails; text that is not a
//! well-formed pipeline document becomes a malformed artifact carrying the
//! reason, so the validator can report it like any other finding.

use serde_yaml::{Mapping, Value};

use pipewright_types::{Dialect, PipelineArtifact, PipelineStructure, StageDef};

/// Top-level GitLab keywords that configure the pipeline rather than define a job.
pub const GITLAB_RESERVED_KEYS: &[&str] = &[
    "after_script",
    "before_script",
    "cache",
    "default",
    "image",
    "include",
    "services",
    "spec",
    "stages",
    "types",
    "variables",
    "workflow",
];

/// Remove a surrounding Markdown code fence, if the text carries one.
///
/// Models often wrap YAML in a fence even when told not to. Anything before
/// the opening fence or after the closing one is discarded.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[start + 3..];
    let body_start = match after_open.find('\n') {
        Some(nl) => nl + 1,
        None => return trimmed,
    };
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim_end(),
        None => body.trim_end(),
    }
}

/// Parse `raw` as a pipeline document of `dialect`.
pub fn parse_artifact(dialect: Dialect, raw: &str) -> PipelineArtifact {
    let doc: Value = match serde_yaml::from_str(raw) {
        Ok(v) => v,
        Err(e) => return PipelineArtifact::malformed(dialect, raw, format!("invalid YAML: {e}")),
    };

    let root = match doc {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        other => {
            return PipelineArtifact::malformed(
                dialect,
                raw,
                format!("document root must be a mapping, found {}", value_kind(&other)),
            )
        }
    };

    let structure = match dialect {
        Dialect::GitlabCi => parse_gitlab(&root),
        Dialect::GithubActions => parse_github(&root),
    };
    match structure {
        Ok(s) => PipelineArtifact::parsed(dialect, raw, s),
        Err(reason) => PipelineArtifact::malformed(dialect, raw, reason),
    }
}

// ---------------------------------------------------------------------------
// GitLab CI
// ---------------------------------------------------------------------------

fn parse_gitlab(root: &Mapping) -> Result<PipelineStructure, String> {
    let top_level_keys = mapping_keys(root);

    let declared_groups = match root.get("stages").or_else(|| root.get("types")) {
        Some(Value::Sequence(seq)) => Some(seq.iter().filter_map(scalar_string).collect()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(format!(
                "'stages' must be a list, found {}",
                value_kind(other)
            ))
        }
    };

    let default_runner = root
        .get("default")
        .and_then(|d| d.get("image"))
        .and_then(image_name)
        .or_else(|| root.get("image").and_then(image_name));

    let mut stages = Vec::new();
    for (key, value) in root {
        let Some(name) = key.as_str() else { continue };
        if name.starts_with('.') || GITLAB_RESERVED_KEYS.contains(&name) {
            continue;
        }
        let job = resolve_extends(root, value);
        stages.push(gitlab_job(name, &job));
    }

    Ok(PipelineStructure {
        stages,
        top_level_keys,
        declared_groups,
        default_runner,
    })
}

fn gitlab_job(name: &str, job: &Mapping) -> StageDef {
    let mut stage = StageDef::new(name);
    stage.keys = mapping_keys(job);
    stage.group = job.get("stage").and_then(scalar_string);
    stage.runner = job.get("image").and_then(image_name);
    stage.commands = job.get("script").map(flatten_commands).unwrap_or_default();

    let mut needs: Vec<String> = Vec::new();
    if let Some(Value::Sequence(seq)) = job.get("needs") {
        for item in seq {
            let dep = match item {
                Value::Mapping(m) => m.get("job").and_then(scalar_string),
                other => scalar_string(other),
            };
            if let Some(dep) = dep {
                push_unique(&mut needs, dep);
            }
        }
    }
    if let Some(Value::Sequence(seq)) = job.get("dependencies") {
        for dep in seq.iter().filter_map(scalar_string) {
            push_unique(&mut needs, dep);
        }
    }
    stage.needs = needs;
    stage.executable = !job.contains_key("trigger");
    stage
}

/// Shallow-merge the hidden or named jobs listed in `extends` under `value`.
/// Keys set on the job itself win; unknown parents are ignored.
fn resolve_extends(root: &Mapping, value: &Value) -> Mapping {
    let Value::Mapping(job) = value else {
        return Mapping::new();
    };
    let parents: Vec<String> = match job.get("extends") {
        Some(Value::Sequence(seq)) => seq.iter().filter_map(scalar_string).collect(),
        Some(v) => scalar_string(v).into_iter().collect(),
        None => return job.clone(),
    };

    let mut merged = Mapping::new();
    for parent in parents {
        if let Some(Value::Mapping(base)) = root.get(parent.as_str()) {
            for (k, v) in base {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    for (k, v) in job {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

// ---------------------------------------------------------------------------
// GitHub Actions
// ---------------------------------------------------------------------------

fn parse_github(root: &Mapping) -> Result<PipelineStructure, String> {
    let top_level_keys = root
        .keys()
        .filter_map(|k| match k {
            // YAML 1.1 readers turn a bare `on` into `true`.
            Value::Bool(true) => Some("on".to_string()),
            other => scalar_string(other),
        })
        .collect();

    let mut stages = Vec::new();
    match root.get("jobs") {
        Some(Value::Mapping(jobs)) => {
            for (key, value) in jobs {
                let Some(name) = scalar_string(key) else { continue };
                let empty = Mapping::new();
                let job = match value {
                    Value::Mapping(m) => m,
                    _ => &empty,
                };
                stages.push(github_job(&name, job));
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            return Err(format!(
                "'jobs' must be a mapping, found {}",
                value_kind(other)
            ))
        }
    }

    Ok(PipelineStructure {
        stages,
        top_level_keys,
        declared_groups: None,
        default_runner: None,
    })
}

fn github_job(name: &str, job: &Mapping) -> StageDef {
    let mut stage = StageDef::new(name);
    stage.keys = mapping_keys(job);
    stage.runner = job.get("runs-on").and_then(|v| match v {
        Value::Sequence(seq) => {
            let labels: Vec<String> = seq.iter().filter_map(scalar_string).collect();
            (!labels.is_empty()).then(|| labels.join(","))
        }
        Value::Mapping(m) => m
            .get("group")
            .or_else(|| m.get("labels"))
            .and_then(|g| match g {
                Value::Sequence(seq) => {
                    let labels: Vec<String> = seq.iter().filter_map(scalar_string).collect();
                    (!labels.is_empty()).then(|| labels.join(","))
                }
                other => scalar_string(other),
            }),
        other => scalar_string(other),
    });

    if let Some(Value::Sequence(steps)) = job.get("steps") {
        for step in steps {
            if let Some(run) = step.get("run").and_then(scalar_string) {
                stage.commands.push(run);
            } else if let Some(uses) = step.get("uses").and_then(scalar_string) {
                stage.commands.push(format!("uses {uses}"));
            }
        }
    }

    stage.needs = match job.get("needs") {
        Some(Value::Sequence(seq)) => seq.iter().filter_map(scalar_string).collect(),
        Some(v) => scalar_string(v).into_iter().collect(),
        None => Vec::new(),
    };
    stage.executable = !job.contains_key("uses");
    stage
}

// ---------------------------------------------------------------------------
// YAML helpers
// ---------------------------------------------------------------------------

fn mapping_keys(m: &Mapping) -> Vec<String> {
    m.keys().filter_map(scalar_string).collect()
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `image: node:20` or `image: { name: node:20 }`.
fn image_name(v: &Value) -> Option<String> {
    match v {
        Value::Mapping(m) => m.get("name").and_then(scalar_string),
        other => scalar_string(other).filter(|s| !s.trim().is_empty()),
    }
}

/// GitLab scripts may be a string, a list, or lists nested via YAML anchors.
fn flatten_commands(v: &Value) -> Vec<String> {
    match v {
        Value::Sequence(seq) => seq.iter().flat_map(flatten_commands).collect(),
        other => scalar_string(other)
            .filter(|s| !s.trim().is_empty())
            .into_iter()
            .collect(),
    }
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
