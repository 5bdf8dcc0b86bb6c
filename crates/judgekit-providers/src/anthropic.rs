//! Anthropic Messages API and Message Batches API.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use judgekit_core::error::ProviderError;
use judgekit_core::traits::{
    BatchBackend, BatchRequest, CompletionProvider, CompletionRequest, CompletionResponse,
    SubmitShape,
};

use crate::error::ConfigError;
use crate::http::{build_client, check_status, json_body, send_error, DEFAULT_TIMEOUT_SECS};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
/// Output budget for one batched verdict.
const BATCH_MAX_TOKENS: u32 = 1024;

/// Anthropic API provider.
pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, base_url: Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client: build_client(DEFAULT_TIMEOUT_SECS)?,
        })
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }
}

/// Sampling is pinned by `temperature` alone. Current Claude models reject
/// a request that sets both `temperature` and `top_p`, so `top_p` is never
/// sent.
#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct BatchItem<'a> {
    custom_id: &'a str,
    params: MessagesRequest<'a>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: String,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

fn user_message(content: &str) -> [Message<'_>; 1] {
    [Message {
        role: "user",
        content,
    }]
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let start = Instant::now();

        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: Some(request.system_prompt.as_str()).filter(|s| !s.is_empty()),
            messages: user_message(&request.prompt),
        };

        let response = self
            .authed(self.client.post(format!("{}/v1/messages", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(e, DEFAULT_TIMEOUT_SECS))?;
        let response = check_status(response, &request.model).await?;
        let api_response: MessagesResponse = json_body(response).await?;

        let content: String = api_response
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect();

        Ok(CompletionResponse {
            content,
            model: api_response.model,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl BatchBackend for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn submit_shapes(&self) -> &[SubmitShape] {
        &[SubmitShape::InlineRequests]
    }

    #[instrument(skip(self, requests), fields(model = %model, n = requests.len()))]
    async fn submit(
        &self,
        shape: SubmitShape,
        requests: &[BatchRequest],
        model: &str,
    ) -> Result<Value, ProviderError> {
        if shape != SubmitShape::InlineRequests {
            return Err(ProviderError::ApiError {
                status: 400,
                message: format!("submission shape {shape:?} is not supported"),
            });
        }
        // The instruction travels inside the user turn, as the batch
        // endpoint is used with a single content string per request.
        let prompts: Vec<String> = requests
            .iter()
            .map(|r| format!("{}\n{}", r.system_prompt, r.prompt))
            .collect();
        let items: Vec<BatchItem<'_>> = requests
            .iter()
            .zip(&prompts)
            .map(|(r, content)| BatchItem {
                custom_id: &r.custom_id,
                params: MessagesRequest {
                    model,
                    max_tokens: BATCH_MAX_TOKENS,
                    temperature: 0.0,
                    system: None,
                    messages: user_message(content),
                },
            })
            .collect();

        let response = self
            .authed(self.client.post(format!("{}/v1/messages/batches", self.base_url)))
            .json(&serde_json::json!({ "requests": items }))
            .send()
            .await
            .map_err(|e| send_error(e, DEFAULT_TIMEOUT_SECS))?;
        json_body(check_status(response, model).await?).await
    }

    async fn status(&self, job_id: &str) -> Result<Value, ProviderError> {
        let response = self
            .authed(
                self.client
                    .get(format!("{}/v1/messages/batches/{job_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(|e| send_error(e, DEFAULT_TIMEOUT_SECS))?;
        json_body(check_status(response, "").await?).await
    }

    /// `reference` is the absolute `results_url` of an ended batch.
    async fn download(&self, reference: &str) -> Result<String, ProviderError> {
        let response = self
            .authed(self.client.get(reference))
            .send()
            .await
            .map_err(|e| send_error(e, DEFAULT_TIMEOUT_SECS))?;
        check_status(response, "")
            .await?
            .text()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))
    }
}
