use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Completion, Request};

/// Hooks run around every provider call made by a `GenerativeBackend`.
///
/// `before` hooks run in installation order, `after` hooks in reverse.
pub trait Middleware: Send + Sync {
    fn before(&self, _request: &Request) {}
    fn after(&self, _request: &Request, _completion: &Completion) {}
}

/// Logs each generation at info level and flags completions cut at the token limit.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &Request) {
        tracing::info!(
            model = %request.model,
            prompt_chars = request.prompt_chars(),
            max_tokens = request.max_tokens,
            "Generation request"
        );
    }

    fn after(&self, _request: &Request, completion: &Completion) {
        tracing::info!(
            model = %completion.model,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "Generation response"
        );
        if completion.truncated {
            tracing::warn!(
                model = %completion.model,
                output_chars = completion.text.len(),
                "Completion hit the token limit; the document is probably cut short"
            );
        }
    }
}

/// Accumulates token usage and call counts across every generation.
///
/// Cloning yields another handle onto the same counters, so a clone can be
/// installed on a backend while the original is kept for reporting.
#[derive(Clone, Default)]
pub struct UsageTrackingMiddleware {
    calls: Arc<AtomicU64>,
    input_tokens: Arc<AtomicU64>,
    output_tokens: Arc<AtomicU64>,
}

impl UsageTrackingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens.load(Ordering::Relaxed)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.output_tokens.load(Ordering::Relaxed)
    }
}

impl Middleware for UsageTrackingMiddleware {
    fn after(&self, _request: &Request, completion: &Completion) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(completion.usage.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(completion.usage.output_tokens, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Usage;

    fn request() -> Request {
        Request {
            model: "m".into(),
            system: None,
            prompt: "hello".into(),
            max_tokens: 64,
            temperature: None,
        }
    }

    fn completion(input: u64, output: u64) -> Completion {
        Completion {
            id: "c".into(),
            model: "m".into(),
            text: "ok".into(),
            usage: Usage {
                input_tokens: input,
                output_tokens: output,
            },
            truncated: false,
        }
    }

    #[test]
    fn usage_tracking_accumulates_across_clones() {
        let tracker = UsageTrackingMiddleware::new();
        let installed = tracker.clone();

        let req = request();
        installed.after(&req, &completion(10, 20));
        installed.after(&req, &completion(5, 7));

        assert_eq!(tracker.calls(), 2);
        assert_eq!(tracker.total_input_tokens(), 15);
        assert_eq!(tracker.total_output_tokens(), 27);
    }
}
