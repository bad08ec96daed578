//! Healing-loop event system for observability.
//!
//! Emits [`HealingEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, progress reporters, dashboards) can follow
//! requests without coupling to the orchestrator internals.

use serde::{Deserialize, Serialize};

use pipewright_types::{AttemptAction, AttemptOrigin, FeedbackOutcome, TerminalStatus};

/// Events emitted while a request moves through the healing loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealingEvent {
    RequestStarted {
        request_id: String,
        signature: String,
        dialect: String,
    },
    TemplatesRanked {
        request_id: String,
        template_ids: Vec<String>,
    },
    AttemptValidated {
        request_id: String,
        sequence: usize,
        origin: AttemptOrigin,
        fatal: usize,
        warnings: usize,
        action: AttemptAction,
    },
    RepairRegressed {
        request_id: String,
        sequence: usize,
        missing_stages: Vec<String>,
    },
    ConvergenceStalled {
        request_id: String,
        sequence: usize,
    },
    FeedbackRecorded {
        request_id: String,
        outcome: FeedbackOutcome,
    },
    CommitCompleted {
        request_id: String,
        commit_id: String,
    },
    CommitFailed {
        request_id: String,
        error: String,
    },
    RequestCompleted {
        request_id: String,
        status: TerminalStatus,
        attempts: usize,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<HealingEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: HealingEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<HealingEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
