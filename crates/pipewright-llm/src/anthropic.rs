use async_trait::async_trait;
use serde_json::json;

use crate::provider::{error_message, retry_after_ms, transport_error};
use crate::{Completion, ProviderAdapter, Request, Usage};
use pipewright_types::PipewrightError;

const PROVIDER: &str = "anthropic";

/// Messages API adapter.
#[derive(Debug)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.anthropic.com".to_string(),
            default_model: "claude-sonnet-4-5-20250929".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = model;
        self
    }

    pub fn from_env() -> Result<Self, PipewrightError> {
        let key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| PipewrightError::AuthError {
            provider: PROVIDER.into(),
        })?;
        Ok(Self::new(key))
    }
}

fn build_request_body(request: &Request) -> serde_json::Value {
    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "messages": [{
            "role": "user",
            "content": [{ "type": "text", "text": request.prompt }],
        }],
    });

    // The system preamble is identical across every synthesis and repair
    // call, so it is marked cacheable.
    if let Some(system) = &request.system {
        body["system"] = json!([{
            "type": "text",
            "text": system,
            "cache_control": { "type": "ephemeral" }
        }]);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }

    body
}

fn parse_response(body: &serde_json::Value) -> Completion {
    let text = body["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default();

    Completion {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        text,
        usage: Usage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
        truncated: body["stop_reason"] == "max_tokens",
    }
}

fn map_error(status: reqwest::StatusCode, body: &str) -> PipewrightError {
    let code = status.as_u16();
    let provider_error = |retryable: bool| PipewrightError::ProviderError {
        provider: PROVIDER.into(),
        status: code,
        message: error_message(body),
        retryable,
    };
    match code {
        429 => PipewrightError::RateLimited {
            provider: PROVIDER.into(),
            retry_after_ms: retry_after_ms(body),
        },
        401 | 403 => PipewrightError::AuthError {
            provider: PROVIDER.into(),
        },
        400 if error_message(body).contains("prompt is too long") => {
            PipewrightError::ContextLengthExceeded {
                provider: PROVIDER.into(),
                message: error_message(body),
            }
        }
        // 529 is "overloaded".
        500 | 502 | 503 | 504 | 529 => provider_error(true),
        _ => provider_error(false),
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn complete(&self, request: &Request) -> Result<Completion, PipewrightError> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&build_request_body(request))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(PROVIDER, e))?;
        if !status.is_success() {
            return Err(map_error(status, &body));
        }

        let json: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| PipewrightError::ProviderError {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                message: format!("Failed to parse response JSON: {e}"),
                retryable: false,
            })?;
        Ok(parse_response(&json))
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
