use serde::{Deserialize, Serialize};

/// One generation call as handed to a provider adapter.
///
/// Pipewright prompts are always a single turn: an optional system preamble
/// and one user message, so there is no conversation history to carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Request {
    pub fn prompt_chars(&self) -> usize {
        self.system.as_deref().map_or(0, str::len) + self.prompt.len()
    }
}

/// What a provider returned for a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub model: String,
    pub text: String,
    pub usage: Usage,
    /// The provider stopped at the token limit; the text is likely cut mid-document.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}
