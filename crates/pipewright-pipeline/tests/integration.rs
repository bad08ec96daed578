//! End-to-end tests for the self-healing loop.
//!
//! Each test drives the orchestrator with a scripted provider: synthesize ->
//! validate -> repair ... -> terminal status, then checks the report, the
//! feedback store, and the emitted events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use pipewright_llm::{
    extract_fenced_block, Completion, GenerativeBackend, ProviderAdapter, Request, Usage,
};
use pipewright_pipeline::{
    validate, BackoffPolicy, CommitGateway, CommitOutcome, CommitResult, EventEmitter,
    FeedbackService, FeedbackStore, GenerateRequest, HealingEvent, HealingPolicy,
    InMemoryFeedbackStore, JsonlFeedbackStore, Orchestrator, RepositoryLocator, ScoringPolicy,
    TemplateStore, NEUTRAL_SCORE,
};
use pipewright_types::{
    has_fatal, AttemptAction, AttemptOrigin, Dialect, FeedbackOutcome, FindingCode, Language,
    PipelineArtifact, PipewrightError, ProjectContext, StageKind, TerminalStatus,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

enum Step {
    Reply(String),
    ReplyAfter(Duration, String),
    Fail(PipewrightError),
}

/// Provider that plays back a fixed script, then echoes the prompt's fenced
/// block once the script runs out.
#[derive(Clone, Default)]
struct ScriptedProvider {
    steps: Arc<Mutex<VecDeque<Step>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            prompts: Arc::default(),
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

fn completion(text: String) -> Completion {
    Completion {
        id: "scripted".into(),
        model: "scripted-model".into(),
        text,
        usage: Usage::default(),
        truncated: false,
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    async fn complete(&self, request: &Request) -> Result<Completion, PipewrightError> {
        let prompt = request.prompt.clone();
        self.prompts.lock().unwrap().push(prompt.clone());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(text)) => Ok(completion(text)),
            Some(Step::ReplyAfter(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(completion(text))
            }
            Some(Step::Fail(e)) => Err(e),
            None => Ok(completion(
                extract_fenced_block(&prompt).unwrap_or(&prompt).to_string(),
            )),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }
}

fn rust_ctx(stages: Vec<StageKind>) -> ProjectContext {
    ProjectContext::new(vec![Language::Rust], stages, Dialect::GitlabCi)
        .unwrap()
        .with_project_name("svc")
}

fn fast_policy() -> HealingPolicy {
    HealingPolicy {
        backoff: BackoffPolicy::None,
        ..HealingPolicy::default()
    }
}

fn orchestrator(provider: &ScriptedProvider, feedback: FeedbackService) -> Orchestrator {
    orchestrator_with(provider, feedback, fast_policy())
}

fn orchestrator_with(
    provider: &ScriptedProvider,
    feedback: FeedbackService,
    policy: HealingPolicy,
) -> Orchestrator {
    Orchestrator::new(
        Arc::new(GenerativeBackend::new(provider.clone())),
        Arc::new(TemplateStore::builtin()),
        feedback,
        policy,
    )
}

async fn recorded(feedback: &FeedbackService) -> Vec<pipewright_types::FeedbackRecord> {
    feedback.flush().await;
    feedback.store().all_records().await.unwrap()
}

const CLEAN: &str = "\
stages: [compile, test]
compile:
  stage: compile
  image: rust:1.80
  script: [cargo build]
test:
  stage: test
  image: rust:1.80
  script: [cargo test]
";

const TEST_WITHOUT_RUNNER: &str = "\
stages: [compile, test]
compile:
  stage: compile
  image: rust:1.80
  script: [cargo build]
test:
  stage: test
  script: [cargo test]
";

const TEST_DROPPED: &str = "\
stages: [compile, test]
compile:
  stage: compile
  image: rust:1.80
  script: [cargo build]
";

const UNCLOSED: &str = "compile: [unclosed";

const PYTHON_TEST_WITHOUT_RUNNER: &str = "\
stages: [compile, test]
compile:
  stage: compile
  image: python:3.12
  script: [python -m compileall -q .]
test:
  stage: test
  script: [pytest]
";

const PYTHON_CLEAN: &str = "\
stages: [compile, test]
compile:
  stage: compile
  image: python:3.12
  script: [python -m compileall -q .]
test:
  stage: test
  image: python:3.12
  script: [pytest]
";

fn unavailable() -> PipewrightError {
    PipewrightError::ProviderError {
        provider: "scripted".into(),
        status: 503,
        message: "overloaded".into(),
        retryable: true,
    }
}

fn deploy_needs_release(revision: usize) -> String {
    format!(
        "# revision {revision}
stages: [compile, test, deploy]
compile:
  stage: compile
  image: rust:1.80
  script: [cargo build]
test:
  stage: test
  image: rust:1.80
  script: [cargo test]
deploy:
  stage: deploy
  image: alpine:3.20
  needs: [release]
  script: [./deploy.sh]
"
    )
}

// ---------------------------------------------------------------------------
// Terminal statuses
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clean_first_synthesis_is_accepted_in_one_attempt() {
    let provider = ScriptedProvider::new(vec![Step::Reply(format!("```yaml\n{CLEAN}```"))]);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Accepted);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(provider.calls(), 1);
    let artifact = report.artifact.as_ref().unwrap();
    assert!(!has_fatal(&validate(artifact, Dialect::GitlabCi)));
    assert_eq!(report.artifact_text(), Some(CLEAN.trim_end()));

    let records = recorded(&feedback).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, FeedbackOutcome::SucceededFirstTry);
    assert_eq!(records[0].template_ids, vec!["rust-cargo"]);
    assert_eq!(records[0].request_id, report.request_id);
}

#[tokio::test]
async fn missing_runner_is_repaired_in_two_attempts() {
    let provider = ScriptedProvider::new(vec![
        Step::Reply(TEST_WITHOUT_RUNNER.into()),
        Step::Reply(CLEAN.into()),
    ]);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Accepted);
    assert_eq!(report.attempt_count, 2);

    let first = &report.attempts[0];
    assert_eq!(first.origin, AttemptOrigin::Synthesis);
    assert_eq!(first.action, AttemptAction::Repair);
    let runner = first
        .findings
        .iter()
        .find(|f| f.code == FindingCode::MissingRunner)
        .unwrap();
    assert_eq!(runner.stage.as_deref(), Some("test"));
    assert_eq!(report.attempts[1].origin, AttemptOrigin::Repair);
    assert_eq!(report.attempts[1].action, AttemptAction::Accept);

    let repair_prompt = &provider.prompts()[1];
    assert!(repair_prompt.contains("MISSING_RUNNER stage=test field=image"));
    assert!(repair_prompt.contains(TEST_WITHOUT_RUNNER.trim_end()));

    let records = recorded(&feedback).await;
    assert_eq!(records[0].outcome, FeedbackOutcome::SucceededAfterRepair);
    assert_eq!(records[0].attempt_count, 2);
}

#[tokio::test]
async fn missing_runner_on_python_test_stage_is_repaired_in_two_attempts() {
    let provider = ScriptedProvider::new(vec![
        Step::Reply(PYTHON_TEST_WITHOUT_RUNNER.into()),
        Step::Reply(PYTHON_CLEAN.into()),
    ]);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone());
    let ctx = ProjectContext::new(
        vec![Language::Python],
        vec![StageKind::Compile, StageKind::Test],
        Dialect::GitlabCi,
    )
    .unwrap();

    let report = orch
        .run(GenerateRequest::new(ctx), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Accepted);
    assert_eq!(report.attempt_count, 2);
    assert!(report.attempts[0]
        .findings
        .iter()
        .any(|f| f.code == FindingCode::MissingRunner && f.stage.as_deref() == Some("test")));
    assert_eq!(report.template_ids, vec!["python-pip"]);
    assert_eq!(report.artifact_text(), Some(PYTHON_CLEAN.trim_end()));

    let records = recorded(&feedback).await;
    assert_eq!(records[0].outcome, FeedbackOutcome::SucceededAfterRepair);
}

#[tokio::test]
async fn persistent_unknown_dependency_is_abandoned_after_budget() {
    let policy = fast_policy();
    let max = policy.max_repair_attempts;
    let steps = (0..=max)
        .map(|n| Step::Reply(deploy_needs_release(n)))
        .collect();
    let provider = ScriptedProvider::new(steps);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator_with(&provider, feedback.clone(), policy);

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![
                StageKind::Compile,
                StageKind::Test,
                StageKind::Deploy,
            ])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Abandoned);
    assert_eq!(report.attempt_count, max + 1);
    assert!(report.attempts.iter().all(|a| a
        .findings
        .iter()
        .any(|f| f.code == FindingCode::UnknownDependency)));
    let retained = report
        .findings
        .iter()
        .find(|f| f.code == FindingCode::UnknownDependency)
        .unwrap();
    assert_eq!(retained.stage.as_deref(), Some("deploy"));
    assert!(report.artifact_text().unwrap().contains("# revision 3"));
    assert!(report.container_file.is_none());

    let records = recorded(&feedback).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, FeedbackOutcome::Failed);
    assert_eq!(records[0].attempt_count, max + 1);
}

#[tokio::test]
async fn repeated_artifact_and_findings_abandon_immediately() {
    // The unscripted fallback echoes the repair input back unchanged.
    let provider = ScriptedProvider::new(vec![Step::Reply(TEST_WITHOUT_RUNNER.into())]);
    let events = EventEmitter::new(64);
    let mut rx = events.subscribe();
    let orch = orchestrator(&provider, FeedbackService::in_memory()).with_events(events);

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Abandoned);
    assert_eq!(report.attempt_count, 2);
    assert_eq!(report.attempts[1].action, AttemptAction::Abandon);

    let mut stalled = false;
    while let Ok(event) = rx.try_recv() {
        if let HealingEvent::ConvergenceStalled { sequence, .. } = event {
            assert_eq!(sequence, 2);
            stalled = true;
        }
    }
    assert!(stalled);
}

#[tokio::test]
async fn dropped_stage_is_a_regression_until_restored() {
    let provider = ScriptedProvider::new(vec![
        Step::Reply(TEST_WITHOUT_RUNNER.into()),
        Step::Reply(TEST_DROPPED.into()),
        Step::Reply(CLEAN.into()),
    ]);
    let orch = orchestrator(&provider, FeedbackService::in_memory());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Accepted);
    assert_eq!(report.attempt_count, 3);

    let regressed = &report.attempts[1];
    assert!(!has_fatal(&regressed.findings));
    assert_eq!(regressed.regressions.len(), 1);
    assert_eq!(regressed.regressions[0].code, FindingCode::RepairRegression);
    assert_eq!(regressed.regressions[0].stage.as_deref(), Some("test"));
    assert_eq!(regressed.action, AttemptAction::Repair);

    let third_prompt = &provider.prompts()[2];
    assert!(third_prompt.contains("REPAIR_REGRESSION stage=test"));
    assert!(third_prompt.contains("Keep these stages, with the same names: compile, test"));
}

#[tokio::test]
async fn malformed_repair_does_not_clear_stages_owed() {
    let provider = ScriptedProvider::new(vec![
        Step::Reply(TEST_WITHOUT_RUNNER.into()),
        Step::Reply(UNCLOSED.into()),
        Step::Reply(TEST_DROPPED.into()),
        Step::Reply(CLEAN.into()),
    ]);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.attempts[1].artifact.is_malformed());
    assert!(report.attempts[1].regressions.is_empty());

    let dropped = &report.attempts[2];
    assert_eq!(dropped.regressions.len(), 1);
    assert_eq!(dropped.regressions[0].stage.as_deref(), Some("test"));
    assert_eq!(dropped.action, AttemptAction::Repair);

    let prompts = provider.prompts();
    assert!(prompts[2].contains("Keep these stages, with the same names: compile, test"));
    assert!(prompts[3].contains("REPAIR_REGRESSION stage=test"));

    assert_eq!(report.status, TerminalStatus::Accepted);
    assert_eq!(report.attempt_count, 4);
    assert_eq!(
        report.artifact.as_ref().unwrap().stage_names(),
        vec!["compile", "test"]
    );
}

// ---------------------------------------------------------------------------
// Backend failures, deadline, cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repair_outage_after_retries_is_fatal_and_unrecorded() {
    let policy = fast_policy();
    let mut steps = vec![Step::Reply(TEST_WITHOUT_RUNNER.into())];
    steps.extend((0..=policy.transient_retries).map(|_| Step::Fail(unavailable())));
    let provider = ScriptedProvider::new(steps);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator_with(&provider, feedback.clone(), policy.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Fatal);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(provider.calls(), 2 + policy.transient_retries);
    assert!(report.error.as_deref().unwrap().contains("overloaded"));
    assert_eq!(report.artifact_text(), Some(TEST_WITHOUT_RUNNER.trim_end()));
    assert!(report.container_file.is_none());
    assert!(recorded(&feedback).await.is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let provider = ScriptedProvider::new(vec![
        Step::Fail(unavailable()),
        Step::Fail(PipewrightError::RateLimited {
            provider: "scripted".into(),
            retry_after_ms: 1,
        }),
        Step::Reply(CLEAN.into()),
    ]);
    let orch = orchestrator(&provider, FeedbackService::in_memory());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Accepted);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn non_retryable_failure_is_fatal_and_unrecorded() {
    let provider = ScriptedProvider::new(vec![Step::Fail(PipewrightError::AuthError {
        provider: "scripted".into(),
    })]);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Fatal);
    assert_eq!(report.attempt_count, 0);
    assert_eq!(provider.calls(), 1);
    assert!(report.error.as_deref().unwrap().contains("Authentication failed"));
    assert!(recorded(&feedback).await.is_empty());
}

#[tokio::test]
async fn deadline_after_an_attempt_abandons_with_best_effort() {
    let provider = ScriptedProvider::new(vec![
        Step::Reply(TEST_WITHOUT_RUNNER.into()),
        Step::ReplyAfter(Duration::from_secs(5), CLEAN.into()),
    ]);
    let policy = HealingPolicy {
        request_deadline: Duration::from_millis(200),
        ..fast_policy()
    };
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator_with(&provider, feedback.clone(), policy);

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Abandoned);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(report.artifact_text(), Some(TEST_WITHOUT_RUNNER.trim_end()));
    assert!(report
        .findings
        .iter()
        .any(|f| f.code == FindingCode::MissingRunner));

    let records = recorded(&feedback).await;
    assert_eq!(records[0].outcome, FeedbackOutcome::Failed);
}

#[tokio::test]
async fn deadline_before_any_artifact_is_fatal() {
    let provider = ScriptedProvider::new(vec![Step::ReplyAfter(
        Duration::from_secs(5),
        CLEAN.into(),
    )]);
    let policy = HealingPolicy {
        request_deadline: Duration::from_millis(100),
        ..fast_policy()
    };
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator_with(&provider, feedback.clone(), policy);

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Fatal);
    assert!(report.artifact.is_none());
    assert!(report.error.as_deref().unwrap().contains("deadline"));
    assert!(recorded(&feedback).await.is_empty());
}

#[tokio::test]
async fn cancellation_writes_no_feedback() {
    let provider = ScriptedProvider::new(vec![
        Step::Reply(TEST_WITHOUT_RUNNER.into()),
        Step::ReplyAfter(Duration::from_secs(5), CLEAN.into()),
    ]);
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipewrightError::Cancelled));
    assert_eq!(provider.calls(), 2);
    assert!(recorded(&feedback).await.is_empty());
}

// ---------------------------------------------------------------------------
// Commit gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingGateway {
    fail: bool,
    commits: Mutex<Vec<(String, Option<String>, RepositoryLocator)>>,
}

#[async_trait]
impl CommitGateway for RecordingGateway {
    fn name(&self) -> &str {
        "recording"
    }

    async fn commit(
        &self,
        artifact: &PipelineArtifact,
        container_file: Option<&str>,
        locator: &RepositoryLocator,
    ) -> pipewright_types::Result<CommitResult> {
        self.commits.lock().unwrap().push((
            artifact.raw.clone(),
            container_file.map(String::from),
            locator.clone(),
        ));
        if self.fail {
            return Err(PipewrightError::CommitFailed {
                gateway: "recording".into(),
                status: 409,
                message: "branch is protected".into(),
            });
        }
        Ok(CommitResult {
            commit_id: "abc123".into(),
            branch: locator.branch.clone(),
            files: vec![locator.pipeline_path_for(artifact), locator.container_path.clone()],
            web_url: None,
        })
    }
}

#[tokio::test]
async fn accepted_artifact_is_committed_with_container_file() {
    let provider = ScriptedProvider::new(vec![Step::Reply(CLEAN.into())]);
    let gateway = Arc::new(RecordingGateway::default());
    let orch = orchestrator(&provider, FeedbackService::in_memory())
        .with_commit_gateway(gateway.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test]))
                .with_locator(RepositoryLocator::new("group/svc", "ci/pipewright")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match report.commit {
        Some(CommitOutcome::Committed(ref result)) => {
            assert_eq!(result.commit_id, "abc123");
            assert_eq!(result.files, vec![".gitlab-ci.yml", "Dockerfile"]);
        }
        ref other => panic!("expected a commit, got {other:?}"),
    }

    let commits = gateway.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, CLEAN.trim_end());
    assert_eq!(commits[0].1.as_deref(), report.container_file.as_deref());
    assert_eq!(commits[0].2.branch, "ci/pipewright");
}

#[tokio::test]
async fn commit_failure_is_surfaced_without_undoing_feedback() {
    let provider = ScriptedProvider::new(vec![Step::Reply(CLEAN.into())]);
    let gateway = Arc::new(RecordingGateway {
        fail: true,
        ..RecordingGateway::default()
    });
    let feedback = FeedbackService::in_memory();
    let orch = orchestrator(&provider, feedback.clone()).with_commit_gateway(gateway);

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test]))
                .with_locator(RepositoryLocator::new("group/svc", "main")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Accepted);
    match report.commit {
        Some(CommitOutcome::Failed { ref error }) => assert!(error.contains("branch is protected")),
        ref other => panic!("expected a commit failure, got {other:?}"),
    }
    let records = recorded(&feedback).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].outcome.is_success());
}

#[tokio::test]
async fn abandoned_request_is_never_committed() {
    let provider = ScriptedProvider::new(vec![Step::Reply(TEST_WITHOUT_RUNNER.into())]);
    let gateway = Arc::new(RecordingGateway::default());
    let orch = orchestrator(&provider, FeedbackService::in_memory())
        .with_commit_gateway(gateway.clone());

    let report = orch
        .run(
            GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test]))
                .with_locator(RepositoryLocator::new("group/svc", "main")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Abandoned);
    assert!(report.commit.is_none());
    assert!(gateway.commits.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Feedback loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn score_without_history_is_neutral() {
    let feedback = FeedbackService::in_memory();
    let sig = rust_ctx(vec![StageKind::Compile]).signature();
    assert_eq!(feedback.score(&sig, "rust-cargo").await, NEUTRAL_SCORE);
    assert_eq!(feedback.score(&sig, "rust-cargo").await, 0.5);
}

#[tokio::test]
async fn abandoned_runs_lower_the_template_score() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonlFeedbackStore::new(tmp.path().join("feedback.jsonl")));
    let feedback = FeedbackService::new(store.clone(), ScoringPolicy::default());

    let ctx = rust_ctx(vec![StageKind::Compile, StageKind::Test]);
    for _ in 0..2 {
        let provider = ScriptedProvider::new(vec![Step::Reply(TEST_WITHOUT_RUNNER.into())]);
        let orch = orchestrator(&provider, feedback.clone());
        let report = orch
            .run(GenerateRequest::new(ctx.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, TerminalStatus::Abandoned);
    }
    feedback.flush().await;

    assert_eq!(store.records_for(&ctx.signature()).await.unwrap().len(), 2);
    assert_eq!(feedback.score(&ctx.signature(), "rust-cargo").await, 0.0);

    let table = feedback.score_table(&ctx.signature()).await.unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].template_id, "rust-cargo");
    assert_eq!(table[0].samples, 2);

    let other = rust_ctx(vec![StageKind::Test]).signature();
    assert_eq!(feedback.score(&other, "rust-cargo").await, NEUTRAL_SCORE);
}

#[tokio::test]
async fn concurrent_requests_share_one_store() {
    let store = Arc::new(InMemoryFeedbackStore::new());
    let feedback = FeedbackService::new(store.clone(), ScoringPolicy::default());

    let mut handles = Vec::new();
    for _ in 0..4 {
        let feedback = feedback.clone();
        handles.push(tokio::spawn(async move {
            let provider = ScriptedProvider::new(vec![Step::Reply(CLEAN.into())]);
            let orch = orchestrator(&provider, feedback);
            orch.run(
                GenerateRequest::new(rust_ctx(vec![StageKind::Compile, StageKind::Test])),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .status
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), TerminalStatus::Accepted);
    }
    feedback.flush().await;
    assert_eq!(store.len().await, 4);
}
