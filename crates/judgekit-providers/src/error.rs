//! Configuration and client construction errors.
//!
//! Transport failures use `judgekit_core::error::ProviderError`; this enum
//! covers what can go wrong before any request is sent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider entry has no usable API key.
    #[error("missing credential for provider '{0}' (set api_key or the matching JUDGEKIT_*_KEY variable)")]
    MissingCredential(String),

    /// A rater points at a provider entry that does not exist.
    #[error("rater '{rater}' references unknown provider '{provider}'")]
    UnknownProvider { rater: String, provider: String },

    /// A rater id was requested that is not configured.
    #[error("unknown rater '{0}'")]
    UnknownRater(String),

    /// Anything else that makes the configuration unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}
