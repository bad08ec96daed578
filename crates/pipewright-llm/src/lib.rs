//! Generative backend capability for Pipewright.
//!
//! Provides the `ProviderAdapter` trait, the Anthropic, OpenAI and offline
//! adapters, a middleware chain, and `GenerativeBackend`:
//! the single `generate(prompt, timeout)` entry point the synthesizer and the
//! repair engine depend on. Which provider backs it is decided once, from a
//! [`BackendConfig`] value, at construction.

mod anthropic;
mod backend;
mod middleware;
mod offline;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicAdapter;
pub use backend::{BackendConfig, GenerativeBackend, Prompt, ProviderKind};
pub use middleware::{LoggingMiddleware, Middleware, UsageTrackingMiddleware};
pub use offline::{extract_fenced_block, OfflineAdapter};
pub use openai::OpenAiAdapter;
pub use provider::ProviderAdapter;
pub use types::*;
