//! Core trait definitions for judge providers.
//!
//! These async traits are implemented by the `judgekit-providers` crate:
//! `CompletionProvider` for synchronous per-item calls and `BatchBackend`
//! for asynchronous batch jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

// ---------------------------------------------------------------------------
// Synchronous completion
// ---------------------------------------------------------------------------

/// A backend that turns one prompt into one free-text response.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Run one completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

/// Request for a single deterministic completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier (e.g. "claude-sonnet-4-20250514").
    pub model: String,
    pub system_prompt: String,
    pub prompt: String,
    pub max_tokens: u32,
    /// Always 0 for judging.
    pub temperature: f64,
    /// Always 0 for judging.
    pub top_p: f64,
}

impl CompletionRequest {
    /// A zero-temperature, zero-top-p request.
    pub fn deterministic(
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            max_tokens: 512,
            temperature: 0.0,
            top_p: 0.0,
        }
    }
}

/// Response from a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Concatenated text content.
    pub content: String,
    /// Model that actually answered.
    pub model: String,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Asynchronous batch
// ---------------------------------------------------------------------------

/// Parameter shapes a batch-create call may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitShape {
    /// Requests embedded in the create call.
    InlineRequests,
    /// Requests uploaded as a JSONL file and referenced by name.
    FileReference,
}

/// One prompt of a batch, tagged with its submission position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Position in the submitted chunk.
    pub index: usize,
    /// Provider-visible id, `req-{index}`.
    pub custom_id: String,
    pub system_prompt: String,
    pub prompt: String,
}

impl BatchRequest {
    pub fn new(index: usize, system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            index,
            custom_id: format!("req-{index}"),
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
        }
    }
}

/// Raw batch API surface. The orchestrator owns polling, retrieval and
/// realignment; a backend only moves JSON.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Shapes to try for job creation, in preference order.
    fn submit_shapes(&self) -> &[SubmitShape];

    /// Create a batch job and return its raw create response.
    async fn submit(
        &self,
        shape: SubmitShape,
        requests: &[BatchRequest],
        model: &str,
    ) -> Result<serde_json::Value, ProviderError>;

    /// Raw status document of a job.
    async fn status(&self, job_id: &str) -> Result<serde_json::Value, ProviderError>;

    /// Download a result artifact by the reference found in a status
    /// document (file name or URL).
    async fn download(&self, reference: &str) -> Result<String, ProviderError>;
}
