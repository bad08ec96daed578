use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ContextSignature, TerminalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    SucceededFirstTry,
    SucceededAfterRepair,
    Failed,
}

impl FeedbackOutcome {
    /// Outcome for a request that ended in `status` after `attempts` attempts.
    /// `Fatal` requests carry no signal about template quality and map to `None`.
    pub fn from_terminal(status: TerminalStatus, attempts: usize) -> Option<Self> {
        match status {
            TerminalStatus::Accepted if attempts <= 1 => Some(FeedbackOutcome::SucceededFirstTry),
            TerminalStatus::Accepted => Some(FeedbackOutcome::SucceededAfterRepair),
            TerminalStatus::Abandoned => Some(FeedbackOutcome::Failed),
            TerminalStatus::Fatal => None,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, FeedbackOutcome::Failed)
    }
}

/// Persisted outcome of one concluded request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub request_id: String,
    pub signature: ContextSignature,
    pub template_ids: Vec<String>,
    pub outcome: FeedbackOutcome,
    pub attempt_count: usize,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackRecord {
    pub fn new(
        request_id: impl Into<String>,
        signature: ContextSignature,
        template_ids: Vec<String>,
        outcome: FeedbackOutcome,
        attempt_count: usize,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            signature,
            template_ids,
            outcome,
            attempt_count,
            recorded_at: Utc::now(),
        }
    }

    pub fn uses_template(&self, template_id: &str) -> bool {
        self.template_ids.iter().any(|t| t == template_id)
    }
}
