//! Template store: per-language, per-stage pipeline fragments.
//!
//! Templates are pure data. The store filters them by project context,
//! ranks them by feedback score, and renders the winning fragments into a
//! dialect skeleton that the synthesizer hands to the generative backend.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use pipewright_types::{
    BuildTool, Dialect, Language, PipewrightError, ProjectContext, Result, StageKind,
};

// ---------------------------------------------------------------------------
// Template data
// ---------------------------------------------------------------------------

/// How one stage is carried out by a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFragment {
    pub stage: StageKind,
    pub image: String,
    pub commands: Vec<String>,
}

/// A reusable set of job fragments for one language (or any language).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub id: String,
    /// `None` marks a language-agnostic template.
    #[serde(default)]
    pub language: Option<Language>,
    /// Restricts the template to one build tool when set.
    #[serde(default)]
    pub build_tool: Option<BuildTool>,
    pub jobs: Vec<JobFragment>,
    pub updated_at: DateTime<Utc>,
}

impl StageTemplate {
    pub fn covers(&self, stage: StageKind) -> bool {
        self.jobs.iter().any(|j| j.stage == stage)
    }

    pub fn fragment(&self, stage: StageKind) -> Option<&JobFragment> {
        self.jobs.iter().find(|j| j.stage == stage)
    }

    /// Number of the context's requested stages this template covers.
    pub fn requested_coverage(&self, ctx: &ProjectContext) -> usize {
        ctx.stages().iter().filter(|s| self.covers(**s)).count()
    }

    fn applies_to(&self, ctx: &ProjectContext) -> bool {
        let language_ok = self
            .language
            .map_or(true, |lang| ctx.languages().contains(&lang));
        let tool_ok = self.build_tool.map_or(true, |tool| tool == ctx.build_tool());
        language_ok && tool_ok && self.requested_coverage(ctx) > 0
    }
}

/// A candidate template with the score it was ranked by.
#[derive(Debug, Clone)]
pub struct RankedTemplate<'a> {
    pub template: &'a StageTemplate,
    pub score: f64,
    pub coverage: usize,
}

/// Rendered dialect skeleton and the templates it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skeleton {
    pub text: String,
    pub template_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// TemplateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: Vec<StageTemplate>,
}

impl TemplateStore {
    pub fn new(templates: Vec<StageTemplate>) -> Self {
        Self { templates }
    }

    /// Store preloaded with the built-in fragments for every supported language.
    pub fn builtin() -> Self {
        Self::new(builtin_templates())
    }

    /// Add or replace a template by id.
    pub fn insert(&mut self, template: StageTemplate) {
        match self.templates.iter_mut().find(|t| t.id == template.id) {
            Some(existing) => *existing = template,
            None => self.templates.push(template),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StageTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Templates applicable to `ctx`, in store order.
    pub fn candidates(&self, ctx: &ProjectContext) -> Vec<&StageTemplate> {
        self.templates.iter().filter(|t| t.applies_to(ctx)).collect()
    }

    /// Rank candidates: score descending, then requested-stage coverage
    /// descending, then most recently updated. Templates missing from
    /// `scores` rank with the neutral 0.5.
    pub fn rank(
        &self,
        ctx: &ProjectContext,
        scores: &HashMap<String, f64>,
    ) -> Vec<RankedTemplate<'_>> {
        let mut ranked: Vec<RankedTemplate<'_>> = self
            .candidates(ctx)
            .into_iter()
            .map(|t| RankedTemplate {
                template: t,
                score: scores.get(&t.id).copied().unwrap_or(0.5),
                coverage: t.requested_coverage(ctx),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.coverage.cmp(&a.coverage))
                .then_with(|| b.template.updated_at.cmp(&a.template.updated_at))
        });
        ranked
    }

    /// Render the skeleton for `ctx` from `ranked` templates.
    ///
    /// Each requested stage takes its fragment from the highest-ranked
    /// template that covers it; `template_ids` lists the contributing
    /// templates in rank order. Fails when some requested stage has no
    /// fragment at all.
    pub fn render_skeleton(
        &self,
        ctx: &ProjectContext,
        ranked: &[RankedTemplate<'_>],
    ) -> Result<Skeleton> {
        let mut jobs: Vec<&JobFragment> = Vec::new();
        let mut used: Vec<&str> = Vec::new();

        for stage in ctx.stages() {
            let Some((template, fragment)) = ranked
                .iter()
                .find_map(|r| r.template.fragment(*stage).map(|f| (r.template, f)))
            else {
                return Err(PipewrightError::InvalidContext(format!(
                    "no template covers stage '{stage}' for {}",
                    ctx.primary_language()
                )));
            };
            jobs.push(fragment);
            used.push(template.id.as_str());
        }
        let template_ids: Vec<String> = ranked
            .iter()
            .filter(|r| used.contains(&r.template.id.as_str()))
            .map(|r| r.template.id.clone())
            .collect();

        let doc = match ctx.dialect() {
            Dialect::GitlabCi => gitlab_document(&jobs),
            Dialect::GithubActions => github_document(ctx, &jobs),
        };
        let text = serde_yaml::to_string(&Value::Mapping(doc))?;
        Ok(Skeleton { text, template_ids })
    }
}

// ---------------------------------------------------------------------------
// Dialect rendering
// ---------------------------------------------------------------------------

fn key(s: &str) -> Value {
    Value::String(s.to_string())
}

fn string_list<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::Sequence(items.into_iter().map(|s| Value::String(s.into())).collect())
}

fn gitlab_document(jobs: &[&JobFragment]) -> Mapping {
    let mut doc = Mapping::new();
    doc.insert(key("stages"), string_list(jobs.iter().map(|j| j.stage.as_str())));

    let mut previous: Option<&str> = None;
    for job in jobs {
        let mut body = Mapping::new();
        body.insert(key("stage"), key(job.stage.as_str()));
        body.insert(key("image"), key(&job.image));
        if let Some(prev) = previous {
            body.insert(key("needs"), string_list([prev]));
        }
        body.insert(key("script"), string_list(job.commands.iter().cloned()));
        doc.insert(key(job.stage.as_str()), Value::Mapping(body));
        previous = Some(job.stage.as_str());
    }
    doc
}

fn github_document(ctx: &ProjectContext, jobs: &[&JobFragment]) -> Mapping {
    let mut doc = Mapping::new();
    doc.insert(key("name"), key(ctx.project_name().unwrap_or("CI")));

    let mut push = Mapping::new();
    push.insert(key("branches"), string_list(["main"]));
    let mut on = Mapping::new();
    on.insert(key("push"), Value::Mapping(push));
    on.insert(key("pull_request"), Value::Mapping(Mapping::new()));
    doc.insert(key("on"), Value::Mapping(on));

    let mut job_map = Mapping::new();
    let mut previous: Option<&str> = None;
    for job in jobs {
        let mut body = Mapping::new();
        body.insert(key("runs-on"), key("ubuntu-latest"));
        body.insert(key("container"), key(&job.image));
        if let Some(prev) = previous {
            body.insert(key("needs"), string_list([prev]));
        }
        let mut steps = vec![{
            let mut checkout = Mapping::new();
            checkout.insert(key("uses"), key("actions/checkout@v4"));
            Value::Mapping(checkout)
        }];
        for command in &job.commands {
            let mut step = Mapping::new();
            step.insert(key("run"), key(command));
            steps.push(Value::Mapping(step));
        }
        body.insert(key("steps"), Value::Sequence(steps));
        job_map.insert(key(job.stage.as_str()), Value::Mapping(body));
        previous = Some(job.stage.as_str());
    }
    doc.insert(key("jobs"), Value::Mapping(job_map));
    doc
}

// ---------------------------------------------------------------------------
// Container build file
// ---------------------------------------------------------------------------

/// Companion Dockerfile for the context's primary language and build tool.
pub fn render_container_file(ctx: &ProjectContext) -> String {
    let name = ctx.project_name().unwrap_or("app");
    match ctx.build_tool() {
        BuildTool::Cargo => format!(
            "FROM rust:1.80 AS build\nWORKDIR /src\nCOPY . .\nRUN cargo build --release --locked\n\n\
             FROM debian:bookworm-slim\nCOPY --from=build /src/target/release/{name} /usr/local/bin/{name}\n\
             ENTRYPOINT [\"/usr/local/bin/{name}\"]\n"
        ),
        BuildTool::Pip => "FROM python:3.12-slim\nWORKDIR /app\nCOPY requirements.txt .\n\
             RUN pip install --no-cache-dir -r requirements.txt\nCOPY . .\nCMD [\"python\", \"-m\", \"app\"]\n"
            .to_string(),
        BuildTool::Poetry => "FROM python:3.12-slim\nWORKDIR /app\nRUN pip install --no-cache-dir poetry\n\
             COPY pyproject.toml poetry.lock* ./\nRUN poetry install --no-root --only main\nCOPY . .\n\
             CMD [\"poetry\", \"run\", \"python\", \"-m\", \"app\"]\n"
            .to_string(),
        BuildTool::Maven => "FROM maven:3.9-eclipse-temurin-21 AS build\nWORKDIR /src\nCOPY . .\n\
             RUN mvn -B package -DskipTests\n\nFROM eclipse-temurin:21-jre\n\
             COPY --from=build /src/target/*.jar /app/app.jar\nENTRYPOINT [\"java\", \"-jar\", \"/app/app.jar\"]\n"
            .to_string(),
        BuildTool::Gradle => "FROM gradle:8-jdk21 AS build\nWORKDIR /src\nCOPY . .\n\
             RUN gradle build -x test --no-daemon\n\nFROM eclipse-temurin:21-jre\n\
             COPY --from=build /src/build/libs/*.jar /app/app.jar\nENTRYPOINT [\"java\", \"-jar\", \"/app/app.jar\"]\n"
            .to_string(),
        BuildTool::Npm => "FROM node:20-alpine\nWORKDIR /app\nCOPY package*.json ./\nRUN npm ci --omit=dev\n\
             COPY . .\nCMD [\"npm\", \"start\"]\n"
            .to_string(),
        BuildTool::Yarn => "FROM node:20-alpine\nWORKDIR /app\nCOPY package.json yarn.lock ./\n\
             RUN yarn install --frozen-lockfile --production\nCOPY . .\nCMD [\"yarn\", \"start\"]\n"
            .to_string(),
        BuildTool::GoModules => format!(
            "FROM golang:1.22 AS build\nWORKDIR /src\nCOPY . .\nRUN CGO_ENABLED=0 go build -o /out/{name} ./...\n\n\
             FROM gcr.io/distroless/static\nCOPY --from=build /out/{name} /{name}\nENTRYPOINT [\"/{name}\"]\n"
        ),
    }
}

// ---------------------------------------------------------------------------
// Built-in templates
// ---------------------------------------------------------------------------

fn job(stage: StageKind, image: &str, commands: &[&str]) -> JobFragment {
    JobFragment {
        stage,
        image: image.to_string(),
        commands: commands.iter().map(|c| c.to_string()).collect(),
    }
}

/// Fixed timestamps keep built-in ranking deterministic.
fn revised(days_since_epoch: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(days_since_epoch)
}

fn template(
    id: &str,
    language: Option<Language>,
    build_tool: Option<BuildTool>,
    updated_at: DateTime<Utc>,
    jobs: Vec<JobFragment>,
) -> StageTemplate {
    StageTemplate {
        id: id.to_string(),
        language,
        build_tool,
        jobs,
        updated_at,
    }
}

pub fn builtin_templates() -> Vec<StageTemplate> {
    use StageKind::*;

    const RUST: &str = "rust:1.80";
    const PYTHON: &str = "python:3.12";
    const MAVEN: &str = "maven:3.9-eclipse-temurin-21";
    const GRADLE: &str = "gradle:8-jdk21";
    const NODE: &str = "node:20";
    const GO: &str = "golang:1.22";

    vec![
        template(
            "rust-cargo",
            Some(Language::Rust),
            Some(BuildTool::Cargo),
            revised(19_900),
            vec![
                job(Compile, RUST, &["cargo build --locked"]),
                job(Test, RUST, &["cargo test --locked"]),
                job(Package, RUST, &["cargo build --release --locked"]),
            ],
        ),
        template(
            "rust-audit",
            Some(Language::Rust),
            None,
            revised(19_850),
            vec![job(
                Scan,
                RUST,
                &["cargo install cargo-audit --locked", "cargo audit"],
            )],
        ),
        template(
            "python-pip",
            Some(Language::Python),
            Some(BuildTool::Pip),
            revised(19_880),
            vec![
                job(Compile, PYTHON, &["pip install -r requirements.txt", "python -m compileall -q ."]),
                job(Test, PYTHON, &["pip install -r requirements.txt", "pytest"]),
                job(Package, PYTHON, &["pip install build", "python -m build"]),
            ],
        ),
        template(
            "python-poetry",
            Some(Language::Python),
            Some(BuildTool::Poetry),
            revised(19_890),
            vec![
                job(Compile, PYTHON, &["pip install poetry", "poetry install"]),
                job(Test, PYTHON, &["pip install poetry", "poetry install", "poetry run pytest"]),
                job(Package, PYTHON, &["pip install poetry", "poetry build"]),
            ],
        ),
        template(
            "java-maven",
            Some(Language::Java),
            Some(BuildTool::Maven),
            revised(19_870),
            vec![
                job(Compile, MAVEN, &["mvn -B compile"]),
                job(Test, MAVEN, &["mvn -B test"]),
                job(Package, MAVEN, &["mvn -B package -DskipTests"]),
                job(Scan, MAVEN, &["mvn -B org.owasp:dependency-check-maven:check"]),
            ],
        ),
        template(
            "java-gradle",
            Some(Language::Java),
            Some(BuildTool::Gradle),
            revised(19_860),
            vec![
                job(Compile, GRADLE, &["gradle assemble --no-daemon"]),
                job(Test, GRADLE, &["gradle test --no-daemon"]),
                job(Package, GRADLE, &["gradle build -x test --no-daemon"]),
            ],
        ),
        template(
            "javascript-npm",
            Some(Language::JavaScript),
            Some(BuildTool::Npm),
            revised(19_895),
            vec![
                job(Compile, NODE, &["npm ci", "npm run build --if-present"]),
                job(Test, NODE, &["npm ci", "npm test"]),
                job(Package, NODE, &["npm ci", "npm pack"]),
                job(Scan, NODE, &["npm audit --audit-level=high"]),
            ],
        ),
        template(
            "javascript-yarn",
            Some(Language::JavaScript),
            Some(BuildTool::Yarn),
            revised(19_840),
            vec![
                job(Compile, NODE, &["yarn install --frozen-lockfile", "yarn build"]),
                job(Test, NODE, &["yarn install --frozen-lockfile", "yarn test"]),
                job(Package, NODE, &["yarn install --frozen-lockfile", "yarn pack"]),
            ],
        ),
        template(
            "go-modules",
            Some(Language::Go),
            Some(BuildTool::GoModules),
            revised(19_885),
            vec![
                job(Compile, GO, &["go build ./..."]),
                job(Test, GO, &["go test ./..."]),
                job(Package, GO, &["CGO_ENABLED=0 go build -o bin/ ./..."]),
                job(Scan, GO, &["go vet ./..."]),
            ],
        ),
        template(
            "generic-scan",
            None,
            None,
            revised(19_800),
            vec![job(
                Scan,
                "aquasec/trivy:latest",
                &["trivy fs --exit-code 1 --severity HIGH,CRITICAL ."],
            )],
        ),
        template(
            "generic-deploy",
            None,
            None,
            revised(19_800),
            vec![job(Deploy, "alpine:3.20", &["./deploy.sh"])],
        ),
    ]
}
