//! Error types shared across judgekit.
//!
//! `ProviderError` lives in `judgekit-core` so the judging engine and the
//! batch orchestrator can classify failures for retry decisions without
//! string matching.

use thiserror::Error;

/// Errors that can occur when interacting with a judge provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The API returned a 429 rate limit response.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication failed (invalid API key).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The requested model was not found.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The provider answered with a body we could not decode.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Returns `true` if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProviderError::AuthenticationFailed(_) | ProviderError::ModelNotFound(_)
        )
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Whether the provider rejected the shape of a request (as opposed to
    /// being unavailable). Used to move on to the next known call shape.
    pub fn is_shape_rejection(&self) -> bool {
        matches!(
            self,
            ProviderError::ApiError {
                status: 400 | 404 | 405 | 415 | 422,
                ..
            }
        )
    }
}

/// Failure to extract a verdict object from free text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,

    #[error("no verdict found in response")]
    Unrecognized,

    #[error("verdict label '{0}' is not valid here")]
    UnknownLabel(String),
}

/// Job-level failures of an asynchronous batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The overall deadline elapsed before the job reached a terminal state.
    #[error("batch {job_id} timed out after {waited_secs}s")]
    Timeout { job_id: String, waited_secs: u64 },

    /// The provider reported a terminal failure state.
    #[error("batch {job_id} failed with state {state}")]
    JobFailed { job_id: String, state: String },

    /// Every known submission shape was rejected.
    #[error("batch submission failed: {0}")]
    Submit(ProviderError),

    /// The create call succeeded but returned no job identifier.
    #[error("batch create response carried no job id")]
    MissingJobId,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl BatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BatchError::Timeout { .. })
    }
}

/// Errors from the paired comparator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompareError {
    #[error("consensus needs at least two raters, got {0}")]
    TooFewRaters(usize),

    #[error("baseline and candidate configuration must differ (both '{0}')")]
    SameConfiguration(String),

    #[error("no scored items for configuration '{0}'")]
    MissingConfiguration(String),
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("checkpoint I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint row: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0} is not a run directory (no run.json)")]
    NotARun(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors() {
        assert!(ProviderError::AuthenticationFailed("bad key".into()).is_permanent());
        assert!(ProviderError::ModelNotFound("x".into()).is_permanent());
        assert!(!ProviderError::Timeout(30).is_permanent());
        assert!(!ProviderError::NetworkError("reset".into()).is_permanent());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let e = ProviderError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(e.retry_after_ms(), Some(5000));
        assert_eq!(e.to_string(), "rate limited, retry after 5000ms");
        assert_eq!(ProviderError::Timeout(1).retry_after_ms(), None);
    }

    #[test]
    fn shape_rejection_is_client_side_status() {
        let rejected = ProviderError::ApiError {
            status: 400,
            message: "unknown field requests".into(),
        };
        assert!(rejected.is_shape_rejection());
        let outage = ProviderError::ApiError {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(!outage.is_shape_rejection());
    }
}
