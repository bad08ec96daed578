//! Pipeline synthesis, dry-run validation, repair, and the self-healing loop.
//!
//! This crate implements the Pipewright engine proper: dialect parsing for
//! GitLab CI and GitHub Actions, the template store and skeleton rendering,
//! the validator's lint rules, the synthesizer and repair engine, the
//! orchestrator that drives them, and the feedback store whose scores feed
//! back into template ranking.

pub mod archive;
pub mod commit;
pub mod detect;
pub mod dialect;
pub mod events;
pub mod feedback;
pub mod orchestrator;
pub mod repair;
pub mod retry;
pub mod synthesizer;
pub mod templates;
pub mod validation;

pub use archive::{load_archive, save_archive, AttemptArchive};
pub use commit::{CommitGateway, CommitResult, GitLabCommitGateway, RepositoryLocator};
pub use detect::{detect_context, matching_rules, ContextRule, CONTEXT_RULES};
pub use dialect::{parse_artifact, strip_code_fence};
pub use events::{EventEmitter, HealingEvent};
pub use feedback::{
    rollup_records, score_records, FeedbackRollup, FeedbackService, FeedbackStore,
    InMemoryFeedbackStore, JsonlFeedbackStore, ScoringPolicy, TemplateScore, NEUTRAL_SCORE,
};
pub use orchestrator::{
    CommitOutcome, GenerateRequest, GenerationReport, HealingPolicy, Orchestrator,
};
pub use repair::{preserved_stages, regressions, RepairEngine};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use synthesizer::{Synthesis, Synthesizer};
pub use templates::{
    builtin_templates, render_container_file, JobFragment, RankedTemplate, Skeleton,
    StageTemplate, TemplateStore,
};
pub use validation::{default_rules, validate, LintRule};
