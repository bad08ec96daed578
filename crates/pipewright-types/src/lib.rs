//! Shared types, errors, project context, and artifacts for the Pipewright engine.
//!
//! This crate provides the foundational types used across all other Pipewright crates:
//! - `PipewrightError`: unified error taxonomy
//! - `ProjectContext`: validated, immutable request inputs and their signature
//! - `PipelineArtifact`: raw pipeline text plus its parsed structural view
//! - `ValidationFinding`: one problem reported by the dry-run validator
//! - `Attempt` / `AttemptLog`: the per-request audit trail of the healing loop
//! - `FeedbackRecord`: the persisted reinforcement signal

pub mod artifact;
pub mod attempt;
pub mod context;
pub mod duration_serde;
pub mod feedback;
pub mod finding;

pub use artifact::{PipelineArtifact, PipelineStructure, StageDef};
pub use attempt::{Attempt, AttemptAction, AttemptLog, AttemptOrigin, TerminalStatus};
pub use context::{BuildTool, ContextSignature, Dialect, Language, ProjectContext, StageKind};
pub use feedback::{FeedbackOutcome, FeedbackRecord};
pub use finding::{has_fatal, FindingCode, Severity, ValidationFinding};

/// Unified error type for all Pipewright subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PipewrightError {
    // === Generative backend errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    #[error("Context length exceeded for {provider}: {message}")]
    ContextLengthExceeded { provider: String, message: String },

    // === Request lifecycle ===
    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Invalid project context: {0}")]
    InvalidContext(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === External collaborators ===
    #[error("Commit to {gateway} failed (HTTP {status}): {message}")]
    CommitFailed {
        gateway: String,
        status: u16,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl PipewrightError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipewrightError::RateLimited { .. }
                | PipewrightError::RequestTimeout { .. }
                | PipewrightError::ProviderError { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipewrightError::AuthError { .. }
                | PipewrightError::ContextLengthExceeded { .. }
                | PipewrightError::InvalidContext(_)
                | PipewrightError::InvalidRequest(_)
                | PipewrightError::Config(_)
                | PipewrightError::ProviderError {
                    retryable: false,
                    ..
                }
        )
    }

    /// Returns `true` when the error came from the caller cancelling the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipewrightError::Cancelled)
    }

    /// Maps the error to an HTTP status code for server mode.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PipewrightError::RateLimited { .. } => Some(429),
            PipewrightError::AuthError { .. } => Some(401),
            PipewrightError::ProviderError { status, .. } => Some(*status),
            PipewrightError::RequestTimeout { .. } | PipewrightError::DeadlineExceeded { .. } => {
                Some(504)
            }
            PipewrightError::InvalidContext(_) | PipewrightError::InvalidRequest(_) => Some(400),
            PipewrightError::ContextLengthExceeded { .. } => Some(413),
            PipewrightError::CommitFailed { .. } => Some(502),
            PipewrightError::Cancelled => Some(499),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, PipewrightError>`.
pub type Result<T> = std::result::Result<T, PipewrightError>;
