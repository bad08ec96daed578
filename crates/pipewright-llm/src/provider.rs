use async_trait::async_trait;

use crate::{Completion, Request};
use pipewright_types::PipewrightError;

/// A hosted (or local) model that turns one prompt into one completion.
///
/// Adapters translate [`Request`] into the vendor wire format and map vendor
/// failures onto [`PipewrightError`] so that `is_retryable()` means the same
/// thing for every provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Completion, PipewrightError>;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
}

/// Connection resets, DNS failures and body read errors are worth retrying.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> PipewrightError {
    PipewrightError::ProviderError {
        provider: provider.to_string(),
        status: 0,
        message: err.to_string(),
        retryable: true,
    }
}

/// `error.message` from a vendor error body, or the raw body.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

/// `error.retry_after` (seconds) from a 429 body, in milliseconds; one second when absent.
pub(crate) fn retry_after_ms(body: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["retry_after"].as_f64())
        .map(|s| (s * 1000.0) as u64)
        .unwrap_or(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_prefers_structured_field() {
        assert_eq!(
            error_message(r#"{"error":{"message":"model not found"}}"#),
            "model not found"
        );
        assert_eq!(error_message("<html>bad gateway</html>"), "<html>bad gateway</html>");
    }

    #[test]
    fn retry_after_defaults_to_one_second() {
        assert_eq!(retry_after_ms(r#"{"error":{"retry_after":0.25}}"#), 250);
        assert_eq!(retry_after_ms("slow down"), 1000);
    }
}
