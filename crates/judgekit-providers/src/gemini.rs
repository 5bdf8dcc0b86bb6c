//! Google Gemini: `generateContent` for single items and
//! `batchGenerateContent` for batch jobs.
//!
//! Batch jobs can be created two ways. The preferred shape embeds the
//! requests in the create call; the fallback uploads them as a JSONL file
//! and references it by name. Either way each request carries its
//! `req-{index}` key in `metadata.key` so results can be realigned.

use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use judgekit_core::error::ProviderError;
use judgekit_core::traits::{
    BatchBackend, BatchRequest, CompletionProvider, CompletionRequest, CompletionResponse,
    SubmitShape,
};

use crate::error::ConfigError;
use crate::http::{build_client, check_status, json_body, send_error, DEFAULT_TIMEOUT_SECS};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Gemini API provider.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

/// Model ids are accepted with or without the `models/` prefix.
fn model_path(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// JSON-mode generation settings with deterministic sampling.
fn generation_config(temperature: f64, top_p: f64, max_tokens: Option<u32>) -> Value {
    let mut config = json!({
        "temperature": temperature,
        "topP": top_p,
        "responseMimeType": "application/json",
    });
    if let Some(max) = max_tokens {
        config["maxOutputTokens"] = json!(max);
    }
    config
}

fn user_contents(text: &str) -> Value {
    json!([{ "role": "user", "parts": [{ "text": text }] }])
}

fn batch_request_body(request: &BatchRequest) -> Value {
    json!({
        "systemInstruction": { "parts": [{ "text": request.system_prompt }] },
        "contents": user_contents(&request.prompt),
        "generationConfig": generation_config(0.0, 0.0, None),
    })
}

/// One inline batch request keyed by its submission id.
fn batch_entry(request: &BatchRequest) -> Value {
    json!({
        "request": batch_request_body(request),
        "metadata": { "key": request.custom_id },
    })
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "modelVersion")]
    model_version: Option<String>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GeminiProvider {
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

    async fn send(&self, builder: reqwest::RequestBuilder, model: &str) -> Result<reqwest::Response, ProviderError> {
        let response = builder
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| send_error(e, DEFAULT_TIMEOUT_SECS))?;
        check_status(response, model).await
    }

    /// Upload the requests as a JSONL file; returns the file resource name.
    async fn upload_requests(&self, requests: &[BatchRequest]) -> Result<String, ProviderError> {
        let mut body = String::new();
        for r in requests {
            let line = json!({ "key": r.custom_id, "request": batch_request_body(r) });
            body.push_str(&line.to_string());
            body.push('\n');
        }

        let builder = self
            .client
            .post(format!("{}/upload/v1beta/files?uploadType=media", self.base_url))
            .header("content-type", "application/jsonl")
            .body(body);
        let doc: Value = json_body(self.send(builder, "").await?).await?;

        doc.get("file")
            .and_then(|f| f.get("name"))
            .or_else(|| doc.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProviderError::MalformedResponse("upload response has no file name".into()))
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let start = Instant::now();

        let mut body = json!({
            "contents": user_contents(&request.prompt),
            "generationConfig": generation_config(
                request.temperature,
                request.top_p,
                Some(request.max_tokens),
            ),
        });
        if !request.system_prompt.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.system_prompt }] });
        }

        let builder = self
            .client
            .post(format!(
                "{}/v1beta/{}:generateContent",
                self.base_url,
                model_path(&request.model)
            ))
            .json(&body);
        let api_response: GenerateResponse =
            json_body(self.send(builder, &request.model).await?).await?;

        let content: String = api_response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            model: api_response
                .model_version
                .unwrap_or_else(|| request.model.clone()),
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl BatchBackend for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn submit_shapes(&self) -> &[SubmitShape] {
        &[SubmitShape::InlineRequests, SubmitShape::FileReference]
    }

    #[instrument(skip(self, requests), fields(model = %model, n = requests.len()))]
    async fn submit(
        &self,
        shape: SubmitShape,
        requests: &[BatchRequest],
        model: &str,
    ) -> Result<Value, ProviderError> {
        let input_config = match shape {
            SubmitShape::InlineRequests => {
                let entries: Vec<Value> = requests.iter().map(batch_entry).collect();
                json!({ "requests": { "requests": entries } })
            }
            SubmitShape::FileReference => {
                let file_name = self.upload_requests(requests).await?;
                tracing::debug!(file = %file_name, "batch input uploaded");
                json!({ "file_name": file_name })
            }
        };
        let body = json!({
            "batch": {
                "display_name": format!("judgekit-{}", requests.len()),
                "input_config": input_config,
            }
        });

        let builder = self
            .client
            .post(format!(
                "{}/v1beta/{}:batchGenerateContent",
                self.base_url,
                model_path(model)
            ))
            .json(&body);
        json_body(self.send(builder, model).await?).await
    }

    /// `job_id` is the operation or batch resource name (`batches/...`).
    async fn status(&self, job_id: &str) -> Result<Value, ProviderError> {
        let builder = self
            .client
            .get(format!("{}/v1beta/{}", self.base_url, job_id.trim_start_matches('/')));
        json_body(self.send(builder, "").await?).await
    }

    /// `reference` is a file resource name (`files/...`).
    async fn download(&self, reference: &str) -> Result<String, ProviderError> {
        let builder = self
            .client
            .get(format!(
                "{}/download/v1beta/{reference}:download?alt=media",
                self.base_url
            ));
        self.send(builder, "")
            .await?
            .text()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))
    }
}
