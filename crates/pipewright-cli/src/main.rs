//! CLI binary for generating, validating, and scoring CI pipelines.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pipewright_llm::{BackendConfig, GenerativeBackend, LoggingMiddleware, UsageTrackingMiddleware};
use pipewright_pipeline::{
    detect_context, matching_rules, parse_artifact, validate, CommitOutcome, FeedbackService,
    GenerateRequest, GenerationReport, GitLabCommitGateway, JsonlFeedbackStore, Orchestrator,
    RepositoryLocator, TemplateStore,
};
use pipewright_types::{
    BuildTool, Dialect, Language, ProjectContext, Severity, StageKind, TerminalStatus,
};

use crate::config::PipewrightConfig;

#[derive(Parser)]
#[command(name = "pipewright", version, about = "Self-healing CI pipeline synthesis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ./pipewright.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// How the project context is obtained: explicit languages, or detection.
#[derive(clap::Args)]
struct ContextArgs {
    /// Project checkout to inspect
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Languages, skipping detection (repeat or comma-separate)
    #[arg(short, long = "language", value_delimiter = ',')]
    languages: Vec<Language>,

    /// Build tool override
    #[arg(short, long)]
    build_tool: Option<BuildTool>,

    /// Stages to generate, in pipeline order
    #[arg(
        short,
        long = "stage",
        value_delimiter = ',',
        default_values_t = [StageKind::Compile, StageKind::Test]
    )]
    stages: Vec<StageKind>,

    /// Target dialect: gitlab-ci or github-actions
    #[arg(short, long, default_value_t = Dialect::GitlabCi)]
    dialect: Dialect,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a pipeline, repairing it until it validates
    Generate {
        #[command(flatten)]
        context: ContextArgs,

        /// Use the offline backend (ranked template skeleton, no network)
        #[arg(long)]
        offline: bool,

        /// Write the pipeline here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the companion container build file here
        #[arg(long)]
        dockerfile: Option<PathBuf>,

        /// Commit the accepted pipeline to this GitLab project (id or path)
        #[arg(long, requires = "branch")]
        project: Option<String>,

        /// Branch to commit to
        #[arg(long, requires = "project")]
        branch: Option<String>,

        /// Maximum repair attempts after the first synthesis
        #[arg(long)]
        max_repairs: Option<usize>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate an existing pipeline file
    Validate {
        /// Path to the pipeline file
        file: PathBuf,

        /// Dialect (inferred from the file path when omitted)
        #[arg(short, long)]
        dialect: Option<Dialect>,
    },

    /// Show the project context detected for a checkout
    Detect {
        #[command(flatten)]
        context: ContextArgs,
    },

    /// Show template scores for a project context
    Scores {
        #[command(flatten)]
        context: ContextArgs,

        /// Print outcome rollups for the whole feedback history instead
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so generated YAML can be piped from stdout
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let config = PipewrightConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate {
            context,
            offline,
            output,
            dockerfile,
            project,
            branch,
            max_repairs,
            json,
        } => {
            let locator = match (project, branch) {
                (Some(p), Some(b)) => Some(RepositoryLocator::new(p, b)),
                _ => None,
            };
            let opts = GenerateOptions {
                offline,
                output,
                dockerfile,
                locator,
                max_repairs,
                json,
            };
            let status = cmd_generate(&config, &context, opts).await?;
            if status != TerminalStatus::Accepted {
                std::process::exit(1);
            }
        }
        Commands::Validate { file, dialect } => {
            cmd_validate(&file, dialect)?;
        }
        Commands::Detect { context } => {
            cmd_detect(&context)?;
        }
        Commands::Scores { context, all } => {
            cmd_scores(&config, &context, all).await?;
        }
    }

    Ok(())
}

fn resolve_context(args: &ContextArgs) -> anyhow::Result<ProjectContext> {
    let mut ctx = if args.languages.is_empty() {
        detect_context(&args.dir, args.stages.clone(), args.dialect)?
    } else {
        let mut ctx = ProjectContext::new(args.languages.clone(), args.stages.clone(), args.dialect)?;
        let name = std::fs::canonicalize(&args.dir)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if let Some(name) = name {
            ctx = ctx.with_project_name(name);
        }
        ctx
    };
    if let Some(tool) = args.build_tool {
        ctx = ctx.with_build_tool(tool);
    }
    Ok(ctx)
}

fn feedback_service(config: &PipewrightConfig) -> FeedbackService {
    FeedbackService::new(
        Arc::new(JsonlFeedbackStore::new(&config.feedback.path)),
        config.feedback.scoring.clone(),
    )
}

struct GenerateOptions {
    offline: bool,
    output: Option<PathBuf>,
    dockerfile: Option<PathBuf>,
    locator: Option<RepositoryLocator>,
    max_repairs: Option<usize>,
    json: bool,
}

async fn cmd_generate(
    config: &PipewrightConfig,
    args: &ContextArgs,
    opts: GenerateOptions,
) -> anyhow::Result<TerminalStatus> {
    let ctx = resolve_context(args)?;

    let backend_config = if opts.offline {
        BackendConfig::Offline
    } else {
        config.backend.clone()
    };
    let usage = UsageTrackingMiddleware::new();
    let backend = GenerativeBackend::from_config(&backend_config)?
        .with_middleware(LoggingMiddleware)
        .with_middleware(usage.clone());

    let mut policy = config.policy.clone();
    if let Some(max) = opts.max_repairs {
        policy.max_repair_attempts = max;
    }

    let feedback = feedback_service(config);
    let mut orchestrator = Orchestrator::new(
        Arc::new(backend),
        Arc::new(TemplateStore::builtin()),
        feedback.clone(),
        policy,
    );
    if opts.locator.is_some() {
        let gateway =
            GitLabCommitGateway::from_env(config.commit.base_url.clone(), &config.commit.token_env)?;
        orchestrator = orchestrator.with_commit_gateway(Arc::new(gateway));
    }
    if let Some(dir) = config.archive_dir.as_ref() {
        orchestrator = orchestrator.with_archive_dir(dir);
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling request");
            trigger.cancel();
        }
    });

    let mut request = GenerateRequest::new(ctx);
    if let Some(locator) = opts.locator {
        request = request.with_locator(locator);
    }
    let report = orchestrator.run(request, &cancel).await?;
    feedback.flush().await;

    if usage.calls() > 0 {
        tracing::info!(
            calls = usage.calls(),
            input_tokens = usage.total_input_tokens(),
            output_tokens = usage.total_output_tokens(),
            "Backend usage"
        );
    }

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, opts.output.as_deref())?;
    }
    if let (Some(path), Some(content)) = (opts.dockerfile.as_deref(), report.container_file.as_deref()) {
        write_file(path, content)?;
        eprintln!("Container file written to {}", path.display());
    }

    Ok(report.status)
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn print_report(report: &GenerationReport, output: Option<&Path>) -> anyhow::Result<()> {
    eprintln!(
        "Status: {:?} after {} attempt(s) (request {})",
        report.status, report.attempt_count, report.request_id
    );
    if !report.template_ids.is_empty() {
        eprintln!("Templates: {}", report.template_ids.join(", "));
    }
    for finding in &report.findings {
        eprintln!("  {}", finding.compact());
    }
    if let Some(error) = &report.error {
        eprintln!("Error: {error}");
    }

    if let Some(text) = report.artifact_text() {
        let text = format!("{}\n", text.trim_end());
        match output {
            Some(path) => {
                write_file(path, &text)?;
                eprintln!("Pipeline written to {}", path.display());
            }
            None => print!("{text}"),
        }
    }

    match &report.commit {
        Some(CommitOutcome::Committed(result)) => eprintln!(
            "Committed {} to {} ({})",
            result.files.join(", "),
            result.branch,
            result.web_url.as_deref().unwrap_or(&result.commit_id)
        ),
        Some(CommitOutcome::Failed { error }) => eprintln!("Commit failed: {error}"),
        Some(CommitOutcome::Skipped { reason }) => eprintln!("Commit skipped: {reason}"),
        None => {}
    }
    Ok(())
}

/// GitHub workflows live under `.github/workflows/`; everything else is
/// treated as GitLab CI.
fn infer_dialect(path: &Path) -> Dialect {
    let in_workflows = path
        .parent()
        .map(|p| p.ends_with(".github/workflows"))
        .unwrap_or(false);
    if in_workflows {
        Dialect::GithubActions
    } else {
        Dialect::GitlabCi
    }
}

fn cmd_validate(path: &Path, dialect: Option<Dialect>) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let dialect = dialect.unwrap_or_else(|| infer_dialect(path));
    let artifact = parse_artifact(dialect, &source);
    let findings = validate(&artifact, dialect);

    if findings.is_empty() {
        println!("Pipeline is valid ({dialect})");
        return Ok(());
    }

    let mut has_fatal = false;
    for finding in &findings {
        let severity = match finding.severity {
            Severity::Fatal => {
                has_fatal = true;
                "FATAL"
            }
            Severity::Warning => "WARN",
        };
        let location = finding.stage.as_deref().unwrap_or("-");
        println!("[{}] {} {}: {}", severity, finding.code, location, finding.message);
    }

    if has_fatal {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_detect(args: &ContextArgs) -> anyhow::Result<()> {
    let ctx = resolve_context(args)?;

    if let Some(name) = ctx.project_name() {
        println!("Project: {name}");
    }
    let languages: Vec<&str> = ctx.languages().iter().map(|l| l.as_str()).collect();
    println!("Languages: {}", languages.join(", "));
    println!("Build tool: {}", ctx.build_tool());
    println!("Stages: {}", ctx.requested_stage_names().join(", "));
    println!("Dialect: {}", ctx.dialect());
    println!("Signature: {}", ctx.signature());

    let markers = matching_rules(&args.dir);
    if !markers.is_empty() {
        println!("\nMarkers:");
        for rule in markers {
            println!("  {} -> {} ({})", rule.marker, rule.language, rule.build_tool);
        }
    }
    Ok(())
}

async fn cmd_scores(config: &PipewrightConfig, args: &ContextArgs, all: bool) -> anyhow::Result<()> {
    let feedback = feedback_service(config);

    if all {
        let rollups = feedback.rollup(None).await?;
        if rollups.is_empty() {
            println!("No feedback recorded in {}", config.feedback.path.display());
            return Ok(());
        }
        println!(
            "{:<34} {:<18} {:>6} {:>6} {:>6} {:>8}",
            "SIGNATURE", "TEMPLATE", "FIRST", "AFTER", "FAILED", "ATTEMPTS"
        );
        for r in rollups {
            println!(
                "{:<34} {:<18} {:>6} {:>6} {:>6} {:>8.2}",
                r.signature.as_str(),
                r.template_id,
                r.succeeded_first_try,
                r.succeeded_after_repair,
                r.failed,
                r.mean_attempts
            );
        }
        return Ok(());
    }

    let ctx = resolve_context(args)?;
    let signature = ctx.signature();
    let table = feedback.score_table(&signature).await?;
    let templates = TemplateStore::builtin();
    let candidate_ids: Vec<&str> = templates
        .candidates(&ctx)
        .into_iter()
        .map(|t| t.id.as_str())
        .collect();
    let scores = feedback.scores_for(&signature, &candidate_ids).await;

    println!("Signature: {signature}");
    println!("{:<18} {:>6} {:>8}", "TEMPLATE", "SCORE", "SAMPLES");
    for ranked in templates.rank(&ctx, &scores) {
        let samples = table
            .iter()
            .find(|s| s.template_id == ranked.template.id)
            .map(|s| s.samples)
            .unwrap_or(0);
        println!("{:<18} {:>6.3} {:>8}", ranked.template.id, ranked.score, samples);
    }
    Ok(())
}
