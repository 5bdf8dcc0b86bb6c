//! judgekit-providers: judge provider integrations.
//!
//! Implements `CompletionProvider` for Anthropic, Gemini and
//! OpenAI-compatible endpoints (DeepSeek), and `BatchBackend` for the
//! Anthropic and Gemini batch APIs. Configuration loading and the client
//! registry that turns configured raters into engine raters live here too.

pub mod anthropic;
pub mod config;
pub mod error;
mod http;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod registry;

pub use config::{
    load_config, load_config_from, JudgekitConfig, ProviderConfig, RaterConfig, RaterMode,
};
pub use error::ConfigError;
pub use registry::ClientRegistry;
