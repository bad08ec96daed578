use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::{Completion, ProviderAdapter, Request, Usage};
use pipewright_types::PipewrightError;

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

/// Returns the body of the first fenced code block in `text`, if any.
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    fence_regex()?
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Deterministic provider for offline runs and tests.
///
/// Answers with the first fenced block of the prompt. Synthesis prompts embed
/// the ranked template skeleton in a fence, so offline generation yields the
/// skeleton verbatim; repair prompts embed the broken artifact, so an offline
/// repair returns its input unchanged.
#[derive(Debug, Default)]
pub struct OfflineAdapter;

impl OfflineAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderAdapter for OfflineAdapter {
    async fn complete(&self, request: &Request) -> Result<Completion, PipewrightError> {
        let text = extract_fenced_block(&request.prompt)
            .unwrap_or(&request.prompt)
            .to_string();
        // Rough four-characters-per-token estimate so usage tracking stays meaningful.
        let usage = Usage {
            input_tokens: (request.prompt_chars() / 4) as u64,
            output_tokens: (text.len() / 4) as u64,
        };
        Ok(Completion {
            id: "offline".into(),
            model: request.model.clone(),
            text,
            usage,
            truncated: false,
        })
    }

    fn name(&self) -> &str {
        "offline"
    }

    fn default_model(&self) -> &str {
        "offline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_block_with_language_tag() {
        let text = "intro\n```yaml\nstages:\n  - test\n```\nthen\n```\nother\n```";
        assert_eq!(extract_fenced_block(text), Some("stages:\n  - test\n"));
    }

    #[test]
    fn no_fence_yields_none() {
        assert_eq!(extract_fenced_block("just words"), None);
    }

    #[tokio::test]
    async fn offline_echoes_fenced_block_of_prompt() {
        let req = Request {
            model: "offline".into(),
            system: Some("sys ```yaml\nignored: true\n```".into()),
            prompt: "fix this\n```yaml\njobs: {}\n```".into(),
            max_tokens: 64,
            temperature: None,
        };
        let completion = OfflineAdapter::new().complete(&req).await.unwrap();
        assert_eq!(completion.text, "jobs: {}\n");
        assert_eq!(completion.model, "offline");
    }
}
