//! Self-healing orchestrator: the synthesize, validate, repair loop.
//!
//! One [`Orchestrator::run`] call drives one request through
//! `Synthesizing -> Validating -> (Accepted | Repairing -> Validating ... | Abandoned | Fatal)`.
//! Every artifact the loop produces is validated and appended to the
//! request's [`AttemptLog`]. The terminal status decides which feedback
//! record is written, and an accepted artifact is handed to the commit
//! gateway when the request names a repository.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use pipewright_llm::GenerativeBackend;
use pipewright_types::{
    duration_serde, Attempt, AttemptAction, AttemptLog, AttemptOrigin, ContextSignature,
    FeedbackOutcome, FeedbackRecord, PipelineArtifact, PipewrightError, ProjectContext, Result,
    TerminalStatus, ValidationFinding,
};

use crate::archive::{save_archive, AttemptArchive};
use crate::commit::{CommitGateway, CommitResult, RepositoryLocator};
use crate::events::{EventEmitter, HealingEvent};
use crate::feedback::FeedbackService;
use crate::repair::{preserved_stages, regressions, RepairEngine};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::synthesizer::Synthesizer;
use crate::templates::{render_container_file, TemplateStore};
use crate::validation::validate;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Budgets and timeouts of the healing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingPolicy {
    /// Repairs allowed after the initial synthesis.
    pub max_repair_attempts: usize,
    /// Extra tries for a backend call that failed transiently.
    pub transient_retries: usize,
    pub backoff: BackoffPolicy,
    #[serde(with = "duration_serde")]
    pub generation_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub commit_timeout: Duration,
    /// Caps the whole request, retries and backoff included.
    #[serde(with = "duration_serde")]
    pub request_deadline: Duration,
}

impl Default for HealingPolicy {
    fn default() -> Self {
        Self {
            max_repair_attempts: 3,
            transient_retries: 2,
            backoff: BackoffPolicy::default(),
            generation_timeout: Duration::from_secs(60),
            commit_timeout: Duration::from_secs(30),
            request_deadline: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub context: ProjectContext,
    pub locator: Option<RepositoryLocator>,
}

impl GenerateRequest {
    pub fn new(context: ProjectContext) -> Self {
        Self {
            context,
            locator: None,
        }
    }

    pub fn with_locator(mut self, locator: RepositoryLocator) -> Self {
        self.locator = Some(locator);
        self
    }
}

/// What happened to the commit of an accepted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed(CommitResult),
    Failed { error: String },
    Skipped { reason: String },
}

/// Response to a generate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub request_id: String,
    pub signature: ContextSignature,
    pub status: TerminalStatus,
    /// Accepted artifact, or the best effort for other outcomes.
    pub artifact: Option<PipelineArtifact>,
    pub attempt_count: usize,
    /// Warnings of an accepted artifact, else the remaining blocking findings.
    pub findings: Vec<ValidationFinding>,
    pub template_ids: Vec<String>,
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitOutcome>,
    /// The error that made the request fatal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl GenerationReport {
    pub fn artifact_text(&self) -> Option<&str> {
        self.artifact.as_ref().map(|a| a.raw.as_str())
    }

    pub fn is_accepted(&self) -> bool {
        self.status == TerminalStatus::Accepted
    }
}

/// How the loop stopped, before feedback and commit are applied.
enum LoopEnd {
    Accepted,
    Abandoned,
    Fatal(PipewrightError),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    synthesizer: Synthesizer,
    repairer: RepairEngine,
    feedback: FeedbackService,
    commit_gateway: Option<Arc<dyn CommitGateway>>,
    policy: HealingPolicy,
    events: EventEmitter,
    archive_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<GenerativeBackend>,
        templates: Arc<TemplateStore>,
        feedback: FeedbackService,
        policy: HealingPolicy,
    ) -> Self {
        let synthesizer = Synthesizer::new(backend.clone(), templates, feedback.clone())
            .with_timeout(policy.generation_timeout);
        let repairer = RepairEngine::new(backend).with_timeout(policy.generation_timeout);
        Self {
            synthesizer,
            repairer,
            feedback,
            commit_gateway: None,
            policy,
            events: EventEmitter::default(),
            archive_dir: None,
        }
    }

    pub fn with_commit_gateway(mut self, gateway: Arc<dyn CommitGateway>) -> Self {
        self.commit_gateway = Some(gateway);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Persist each request's attempt history under `dir`.
    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn feedback(&self) -> &FeedbackService {
        &self.feedback
    }

    pub fn policy(&self) -> &HealingPolicy {
        &self.policy
    }

    /// Drive one request to a terminal status.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires first; nothing is recorded
    /// in that case. Every other ending, `Fatal` included, is an `Ok` report.
    pub async fn run(
        &self,
        request: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationReport> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let ctx = &request.context;
        let signature = ctx.signature();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.policy.request_deadline;

        tracing::info!(
            request_id = %request_id,
            signature = %signature,
            dialect = %ctx.dialect(),
            stages = ?ctx.requested_stage_names(),
            "Request started"
        );
        self.events.emit(HealingEvent::RequestStarted {
            request_id: request_id.clone(),
            signature: signature.to_string(),
            dialect: ctx.dialect().to_string(),
        });

        let mut log = AttemptLog::new();
        let mut template_ids: Vec<String> = Vec::new();
        let end = self
            .heal(&request_id, ctx, deadline, cancel, &mut log, &mut template_ids)
            .await;

        let (status, error) = match end {
            LoopEnd::Cancelled => {
                tracing::info!(request_id = %request_id, attempts = log.len(), "Request cancelled");
                return Err(PipewrightError::Cancelled);
            }
            LoopEnd::Accepted => (TerminalStatus::Accepted, None),
            LoopEnd::Abandoned => (TerminalStatus::Abandoned, None),
            LoopEnd::Fatal(e) => (TerminalStatus::Fatal, Some(e)),
        };
        let attempt_count = log.len();

        if let Some(outcome) = FeedbackOutcome::from_terminal(status, attempt_count) {
            self.feedback.record(FeedbackRecord::new(
                request_id.clone(),
                signature.clone(),
                template_ids.clone(),
                outcome,
                attempt_count,
            ));
            self.events.emit(HealingEvent::FeedbackRecorded {
                request_id: request_id.clone(),
                outcome,
            });
        }

        let last = log.last();
        let artifact = last.map(|a| a.artifact.clone());
        let findings = match (status, last) {
            (TerminalStatus::Accepted, Some(a)) => a.findings.clone(),
            (_, Some(a)) => a.blocking_findings(),
            (_, None) => Vec::new(),
        };

        let mut container_file = None;
        let mut commit = None;
        if let (TerminalStatus::Accepted, Some(accepted)) = (status, artifact.as_ref()) {
            let dockerfile = render_container_file(ctx);
            if let Some(locator) = request.locator.as_ref() {
                commit = Some(
                    self.commit(&request_id, accepted, &dockerfile, locator, cancel)
                        .await,
                );
            }
            container_file = Some(dockerfile);
        }

        if let Some(dir) = self.archive_dir.as_ref() {
            let archive = AttemptArchive::new(
                request_id.clone(),
                signature.clone(),
                ctx.dialect(),
                status,
                template_ids.clone(),
                log.as_slice().to_vec(),
            );
            if let Err(e) = save_archive(&archive, dir).await {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to archive attempts");
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match &error {
            Some(e) => tracing::error!(
                request_id = %request_id,
                attempts = attempt_count,
                error = %e,
                "Request failed"
            ),
            None => tracing::info!(
                request_id = %request_id,
                status = ?status,
                attempts = attempt_count,
                duration_ms,
                "Request completed"
            ),
        }
        self.events.emit(HealingEvent::RequestCompleted {
            request_id: request_id.clone(),
            status,
            attempts: attempt_count,
            duration_ms,
        });

        Ok(GenerationReport {
            request_id,
            signature,
            status,
            artifact,
            attempt_count,
            findings,
            template_ids,
            attempts: log.into_vec(),
            container_file,
            commit,
            error: error.map(|e| e.to_string()),
            duration_ms,
        })
    }

    async fn heal(
        &self,
        request_id: &str,
        ctx: &ProjectContext,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
        log: &mut AttemptLog,
        template_ids: &mut Vec<String>,
    ) -> LoopEnd {
        let synthesis = self
            .bounded(
                deadline,
                cancel,
                execute_with_retry(
                    || self.synthesizer.synthesize(ctx, None, cancel),
                    self.policy.transient_retries,
                    &self.policy.backoff,
                    "synthesize",
                    cancel,
                ),
            )
            .await;
        let synthesis = match synthesis {
            Ok(s) => s,
            Err(e) => return interrupted(e, log),
        };
        template_ids.clone_from(&synthesis.template_ids);
        self.events.emit(HealingEvent::TemplatesRanked {
            request_id: request_id.to_string(),
            template_ids: synthesis.template_ids,
        });

        let mut seen: HashSet<(String, Vec<ValidationFinding>)> = HashSet::new();
        let mut candidate = synthesis.artifact;
        let mut origin = AttemptOrigin::Synthesis;
        let mut regressed: Vec<ValidationFinding> = Vec::new();
        let mut repairs = 0usize;

        loop {
            if cancel.is_cancelled() {
                return LoopEnd::Cancelled;
            }

            let findings = validate(&candidate, ctx.dialect());
            let blocking: Vec<ValidationFinding> = findings
                .iter()
                .filter(|f| f.is_fatal())
                .chain(regressed.iter())
                .cloned()
                .collect();
            let warnings = findings.len() - findings.iter().filter(|f| f.is_fatal()).count();

            let mut stalled = false;
            let action = if blocking.is_empty() {
                AttemptAction::Accept
            } else if !seen.insert((candidate.raw.clone(), blocking.clone())) {
                stalled = true;
                AttemptAction::Abandon
            } else if repairs < self.policy.max_repair_attempts {
                AttemptAction::Repair
            } else {
                AttemptAction::Abandon
            };

            let attempt = log.append(
                origin,
                candidate,
                findings,
                std::mem::take(&mut regressed),
                action,
            );
            tracing::info!(
                request_id = %request_id,
                attempt = attempt.sequence,
                origin = ?origin,
                fatal = blocking.len(),
                warnings,
                action = ?action,
                "Attempt validated"
            );
            self.events.emit(HealingEvent::AttemptValidated {
                request_id: request_id.to_string(),
                sequence: attempt.sequence,
                origin,
                fatal: blocking.len(),
                warnings,
                action,
            });

            match action {
                AttemptAction::Accept => return LoopEnd::Accepted,
                AttemptAction::Abandon => {
                    if stalled {
                        tracing::warn!(
                            request_id = %request_id,
                            attempt = attempt.sequence,
                            "Repair produced a previously seen artifact and findings; abandoning"
                        );
                        self.events.emit(HealingEvent::ConvergenceStalled {
                            request_id: request_id.to_string(),
                            sequence: attempt.sequence,
                        });
                    }
                    return LoopEnd::Abandoned;
                }
                AttemptAction::Repair => {}
            }

            let input = attempt.artifact.clone();
            let sequence = attempt.sequence;
            let preserve = preserved_stages(log.as_slice());
            repairs += 1;

            let repaired = self
                .bounded(
                    deadline,
                    cancel,
                    execute_with_retry(
                        || self.repairer.repair(&input, &blocking, &preserve, cancel),
                        self.policy.transient_retries,
                        &self.policy.backoff,
                        "repair",
                        cancel,
                    ),
                )
                .await;
            candidate = match repaired {
                Ok(artifact) => artifact,
                Err(e) => return interrupted(e, log),
            };

            regressed = regressions(&preserve, &candidate);
            if !regressed.is_empty() {
                let missing_stages: Vec<String> =
                    regressed.iter().filter_map(|f| f.stage.clone()).collect();
                tracing::warn!(
                    request_id = %request_id,
                    attempt = sequence + 1,
                    missing = ?missing_stages,
                    "Repair dropped stages"
                );
                self.events.emit(HealingEvent::RepairRegressed {
                    request_id: request_id.to_string(),
                    sequence: sequence + 1,
                    missing_stages,
                });
            }
            origin = AttemptOrigin::Repair;
        }
    }

    /// Race `fut` against cancellation and the request deadline.
    async fn bounded<T>(
        &self,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipewrightError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(PipewrightError::DeadlineExceeded {
                deadline_ms: self.policy.request_deadline.as_millis() as u64,
            }),
            result = fut => result,
        }
    }

    async fn commit(
        &self,
        request_id: &str,
        artifact: &PipelineArtifact,
        container_file: &str,
        locator: &RepositoryLocator,
        cancel: &CancellationToken,
    ) -> CommitOutcome {
        let Some(gateway) = self.commit_gateway.as_ref() else {
            tracing::warn!(request_id = %request_id, "No commit gateway configured; skipping commit");
            return CommitOutcome::Skipped {
                reason: "no commit gateway configured".into(),
            };
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipewrightError::Cancelled),
            r = tokio::time::timeout(
                self.policy.commit_timeout,
                gateway.commit(artifact, Some(container_file), locator),
            ) => r.unwrap_or_else(|_| Err(PipewrightError::CommitFailed {
                gateway: gateway.name().to_string(),
                status: 0,
                message: format!(
                    "timed out after {}ms",
                    self.policy.commit_timeout.as_millis()
                ),
            })),
        };

        match result {
            Ok(done) => {
                self.events.emit(HealingEvent::CommitCompleted {
                    request_id: request_id.to_string(),
                    commit_id: done.commit_id.clone(),
                });
                CommitOutcome::Committed(done)
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    gateway = gateway.name(),
                    error = %e,
                    "Commit failed"
                );
                self.events.emit(HealingEvent::CommitFailed {
                    request_id: request_id.to_string(),
                    error: e.to_string(),
                });
                CommitOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Map a backend or budget error to the loop's ending.
///
/// Only the request deadline ends the request as `Abandoned`, and only once
/// an artifact exists. Backend failures, including transient ones that
/// outlived their retries, are fatal; the report still carries the last
/// attempt's artifact.
fn interrupted(error: PipewrightError, log: &AttemptLog) -> LoopEnd {
    if error.is_cancelled() {
        return LoopEnd::Cancelled;
    }
    let deadline = matches!(error, PipewrightError::DeadlineExceeded { .. });
    if deadline && !log.is_empty() {
        tracing::warn!(attempts = log.len(), error = %error, "Deadline reached; abandoning with best-effort artifact");
        LoopEnd::Abandoned
    } else {
        LoopEnd::Fatal(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_llm::BackendConfig;
    use pipewright_types::{Dialect, Language, StageKind};

    fn offline_orchestrator(templates: TemplateStore, feedback: FeedbackService) -> Orchestrator {
        Orchestrator::new(
            Arc::new(BackendConfig::Offline.build().unwrap()),
            Arc::new(templates),
            feedback,
            HealingPolicy::default(),
        )
    }

    fn rust_ctx() -> ProjectContext {
        ProjectContext::new(
            vec![Language::Rust],
            vec![StageKind::Compile, StageKind::Test],
            Dialect::GitlabCi,
        )
        .unwrap()
        .with_project_name("svc")
    }

    #[test]
    fn policy_reads_human_durations() {
        let policy: HealingPolicy = serde_json::from_str(
            r#"{"max_repair_attempts": 5, "generation_timeout": "45s", "request_deadline": "2m"}"#,
        )
        .unwrap();
        assert_eq!(policy.max_repair_attempts, 5);
        assert_eq!(policy.transient_retries, 2);
        assert_eq!(policy.generation_timeout, Duration::from_secs(45));
        assert_eq!(policy.request_deadline, Duration::from_secs(120));
        assert_eq!(policy.commit_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn offline_run_accepts_clean_skeleton() {
        let feedback = FeedbackService::in_memory();
        let orch = offline_orchestrator(TemplateStore::builtin(), feedback.clone());
        let report = orch
            .run(GenerateRequest::new(rust_ctx()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, TerminalStatus::Accepted);
        assert_eq!(report.attempt_count, 1);
        assert_eq!(report.template_ids, vec!["rust-cargo"]);
        assert!(report.container_file.as_deref().unwrap().contains("cargo build"));
        assert!(report.commit.is_none());

        feedback.flush().await;
        let records = feedback.store().all_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, FeedbackOutcome::SucceededFirstTry);
    }

    #[tokio::test]
    async fn uncovered_stage_is_fatal_without_feedback() {
        let feedback = FeedbackService::in_memory();
        let orch = offline_orchestrator(TemplateStore::new(vec![]), feedback.clone());
        let report = orch
            .run(GenerateRequest::new(rust_ctx()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, TerminalStatus::Fatal);
        assert_eq!(report.attempt_count, 0);
        assert!(report.artifact.is_none());
        assert!(report.error.as_deref().unwrap().contains("no template covers"));

        feedback.flush().await;
        assert!(feedback.store().all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn locator_without_gateway_skips_commit() {
        let orch = offline_orchestrator(TemplateStore::builtin(), FeedbackService::in_memory());
        let request =
            GenerateRequest::new(rust_ctx()).with_locator(RepositoryLocator::new("g/svc", "main"));
        let report = orch.run(request, &CancellationToken::new()).await.unwrap();
        assert!(matches!(report.commit, Some(CommitOutcome::Skipped { .. })));
    }

    #[tokio::test]
    async fn pre_cancelled_request_returns_cancelled() {
        let feedback = FeedbackService::in_memory();
        let orch = offline_orchestrator(TemplateStore::builtin(), feedback.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orch
            .run(GenerateRequest::new(rust_ctx()), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        feedback.flush().await;
        assert!(feedback.store().all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_is_written_per_request() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = offline_orchestrator(TemplateStore::builtin(), FeedbackService::in_memory())
            .with_archive_dir(tmp.path());
        let report = orch
            .run(GenerateRequest::new(rust_ctx()), &CancellationToken::new())
            .await
            .unwrap();
        let archived = crate::archive::load_archive(tmp.path(), &report.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.attempts.len(), 1);
        assert_eq!(archived.status, TerminalStatus::Accepted);
    }

    #[test]
    fn only_the_deadline_abandons_after_an_attempt() {
        let timeout = || PipewrightError::RequestTimeout {
            provider: "x".into(),
            timeout_ms: 1,
        };
        let deadline = || PipewrightError::DeadlineExceeded { deadline_ms: 1 };
        let empty = AttemptLog::new();
        assert!(matches!(interrupted(timeout(), &empty), LoopEnd::Fatal(_)));
        assert!(matches!(interrupted(deadline(), &empty), LoopEnd::Fatal(_)));

        let mut log = AttemptLog::new();
        log.append(
            AttemptOrigin::Synthesis,
            PipelineArtifact::malformed(Dialect::GitlabCi, "x", "bad"),
            vec![],
            vec![],
            AttemptAction::Repair,
        );
        assert!(matches!(interrupted(deadline(), &log), LoopEnd::Abandoned));
        assert!(matches!(interrupted(timeout(), &log), LoopEnd::Fatal(_)));
        assert!(matches!(
            interrupted(PipewrightError::AuthError { provider: "x".into() }, &log),
            LoopEnd::Fatal(_)
        ));
        assert!(matches!(
            interrupted(PipewrightError::Cancelled, &log),
            LoopEnd::Cancelled
        ));
    }
}
