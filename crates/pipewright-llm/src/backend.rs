use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{AnthropicAdapter, Middleware, OfflineAdapter, OpenAiAdapter, ProviderAdapter, Request};
use pipewright_types::{PipewrightError, Result};

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// A fully rendered prompt: a system preamble plus one user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Offline,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which generative backend to use. Chosen once, at construction.
///
/// API keys are never part of the config; they are read from
/// `ANTHROPIC_API_KEY` / `OPENAI_API_KEY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum BackendConfig {
    Anthropic {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
    },
    #[serde(rename = "openai")]
    OpenAi {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
    },
    Offline,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Anthropic {
            model: None,
            base_url: None,
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            BackendConfig::Anthropic { .. } => ProviderKind::Anthropic,
            BackendConfig::OpenAi { .. } => ProviderKind::OpenAi,
            BackendConfig::Offline => ProviderKind::Offline,
        }
    }

    /// Instantiate the configured provider.
    pub fn build(&self) -> Result<GenerativeBackend> {
        GenerativeBackend::from_config(self)
    }
}

// ---------------------------------------------------------------------------
// GenerativeBackend
// ---------------------------------------------------------------------------

/// Opaque text-generation capability: one prompt in, one completion out.
pub struct GenerativeBackend {
    provider: Box<dyn ProviderAdapter>,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl GenerativeBackend {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        let model = provider.default_model().to_string();
        Self {
            provider: Box::new(provider),
            model,
            max_tokens: 4096,
            temperature: Some(0.2),
            middleware: Vec::new(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let backend = match config {
            BackendConfig::Anthropic { model, base_url } => {
                let mut adapter = AnthropicAdapter::from_env()?;
                if let Some(url) = base_url {
                    adapter = adapter.with_base_url(url.clone());
                }
                if let Some(model) = model {
                    adapter = adapter.with_default_model(model.clone());
                }
                Self::new(adapter)
            }
            BackendConfig::OpenAi { model, base_url } => {
                let mut adapter = OpenAiAdapter::from_env()?;
                if let Some(url) = base_url {
                    adapter = adapter.with_base_url(url.clone());
                }
                if let Some(model) = model {
                    adapter = adapter.with_default_model(model.clone());
                }
                Self::new(adapter)
            }
            BackendConfig::Offline => Self::new(OfflineAdapter::new()),
        };
        tracing::debug!(
            provider = backend.provider_name(),
            model = %backend.model,
            "Generative backend configured"
        );
        Ok(backend)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one generation. Fails with `RequestTimeout` when `timeout` elapses
    /// and with `Cancelled` as soon as `cancel` fires.
    pub async fn generate(
        &self,
        prompt: &Prompt,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(PipewrightError::Cancelled);
        }

        let request = Request {
            model: self.model.clone(),
            system: (!prompt.system.is_empty()).then(|| prompt.system.clone()),
            prompt: prompt.user.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        for mw in &self.middleware {
            mw.before(&request);
        }

        let call = tokio::time::timeout(timeout, self.provider.complete(&request));
        let completion = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipewrightError::Cancelled),
            outcome = call => match outcome {
                Ok(result) => result?,
                Err(_) => {
                    return Err(PipewrightError::RequestTimeout {
                        provider: self.provider.name().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            },
        };

        for mw in self.middleware.iter().rev() {
            mw.after(&request, &completion);
        }

        if completion.text.trim().is_empty() {
            return Err(PipewrightError::ProviderError {
                provider: self.provider.name().to_string(),
                status: 0,
                message: "empty completion".into(),
                retryable: true,
            });
        }

        Ok(completion.text)
    }
}

impl std::fmt::Debug for GenerativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerativeBackend")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Completion, Usage, UsageTrackingMiddleware};
    use async_trait::async_trait;

    struct FixedProvider {
        text: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl ProviderAdapter for FixedProvider {
        async fn complete(
            &self,
            request: &Request,
        ) -> std::result::Result<Completion, PipewrightError> {
            tokio::time::sleep(self.delay).await;
            Ok(Completion {
                id: "fixed".into(),
                model: request.model.clone(),
                text: self.text.into(),
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 2,
                },
                truncated: false,
            })
        }

        fn name(&self) -> &str {
            "fixed"
        }

        fn default_model(&self) -> &str {
            "fixed-model"
        }
    }

    fn fixed(text: &'static str, delay_ms: u64) -> FixedProvider {
        FixedProvider {
            text,
            delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test]
    async fn generate_returns_completion_and_runs_middleware() {
        let usage = UsageTrackingMiddleware::new();
        let backend = GenerativeBackend::new(fixed("stages: [test]", 0)).with_middleware(usage.clone());
        let text = backend
            .generate(
                &Prompt::new("sys", "user"),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "stages: [test]");
        assert_eq!(usage.calls(), 1);
        assert_eq!(usage.total_input_tokens(), 3);
        assert_eq!(backend.model(), "fixed-model");
    }

    #[tokio::test]
    async fn generate_times_out() {
        let backend = GenerativeBackend::new(fixed("late", 5_000));
        let err = backend
            .generate(
                &Prompt::new("", "user"),
                Duration::from_millis(20),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipewrightError::RequestTimeout { timeout_ms: 20, .. }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn generate_observes_cancellation() {
        let backend = GenerativeBackend::new(fixed("late", 5_000));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = backend
            .generate(&Prompt::new("", "user"), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn empty_completion_is_retryable_error() {
        let backend = GenerativeBackend::new(fixed("  \n", 0));
        let err = backend
            .generate(
                &Prompt::new("", "user"),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn offline_config_builds_without_credentials() {
        let backend = BackendConfig::Offline.build().unwrap();
        assert_eq!(backend.provider_name(), "offline");
        let text = backend
            .generate(
                &Prompt::new("sys", "here\n```yaml\na: 1\n```"),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "a: 1\n");
    }

    #[test]
    fn backend_config_deserializes_tagged() {
        let cfg: BackendConfig =
            toml::from_str("provider = \"openai\"\nmodel = \"gpt-4o-mini\"").unwrap();
        assert_eq!(
            cfg,
            BackendConfig::OpenAi {
                model: Some("gpt-4o-mini".into()),
                base_url: None
            }
        );
        assert_eq!(cfg.kind(), ProviderKind::OpenAi);

        let offline: BackendConfig = toml::from_str("provider = \"offline\"").unwrap();
        assert_eq!(offline.kind(), ProviderKind::Offline);
    }
}
