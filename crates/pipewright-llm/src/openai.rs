use async_trait::async_trait;
use serde_json::json;

use crate::provider::{error_message, retry_after_ms, transport_error};
use crate::{Completion, ProviderAdapter, Request, Usage};
use pipewright_types::PipewrightError;

const PROVIDER: &str = "openai";

/// Responses API adapter.
#[derive(Debug)]
pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, PipewrightError> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| PipewrightError::AuthError {
            provider: PROVIDER.into(),
        })?;
        Ok(Self::new(key))
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = model;
        self
    }
}

fn build_request_body(request: &Request) -> serde_json::Value {
    let mut body = json!({
        "model": request.model,
        "input": request.prompt,
        "max_output_tokens": request.max_tokens,
    });
    if let Some(system) = &request.system {
        body["instructions"] = json!(system);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    body
}

fn parse_response(body: &serde_json::Value) -> Completion {
    let text: String = body["output"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|item| item["type"] == "message")
        .flat_map(|item| item["content"].as_array().into_iter().flatten())
        .filter(|block| block["type"] == "output_text")
        .filter_map(|block| block["text"].as_str())
        .collect();

    Completion {
        id: body["id"].as_str().unwrap_or_default().to_string(),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        text,
        usage: Usage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
        truncated: body["status"] == "incomplete",
    }
}

fn map_error(status: reqwest::StatusCode, body: &str) -> PipewrightError {
    let code = status.as_u16();
    let error_code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["code"].as_str().map(String::from));
    match code {
        429 => PipewrightError::RateLimited {
            provider: PROVIDER.into(),
            retry_after_ms: retry_after_ms(body),
        },
        401 | 403 => PipewrightError::AuthError {
            provider: PROVIDER.into(),
        },
        400 if error_code.as_deref() == Some("context_length_exceeded") => {
            PipewrightError::ContextLengthExceeded {
                provider: PROVIDER.into(),
                message: error_message(body),
            }
        }
        _ => PipewrightError::ProviderError {
            provider: PROVIDER.into(),
            status: code,
            message: error_message(body),
            retryable: matches!(code, 500 | 502 | 503 | 504),
        },
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn complete(&self, request: &Request) -> Result<Completion, PipewrightError> {
        let resp = self
            .client
            .post(format!("{}/v1/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&build_request_body(request))
            .send()
            .await
            .map_err(|e| transport_error(PROVIDER, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_error(status, &body));
        }

        let json: serde_json::Value =
            resp.json().await.map_err(|e| PipewrightError::ProviderError {
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
