//! OpenAI-compatible chat completions (OpenAI, DeepSeek).

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use judgekit_core::error::ProviderError;
use judgekit_core::traits::{CompletionProvider, CompletionRequest, CompletionResponse};

use crate::error::ConfigError;
use crate::http::{build_client, check_status, json_body, send_error, DEFAULT_TIMEOUT_SECS};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

/// OpenAI-compatible API provider.
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    org_id: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        api_key: &str,
        base_url: Option<String>,
        org_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            org_id,
            client: build_client(DEFAULT_TIMEOUT_SECS)?,
        })
    }

    fn name_for_base(&self) -> &'static str {
        if self.base_url.contains("deepseek") {
            "deepseek"
        } else {
            "openai"
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    model: String,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name_for_base()
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let start = Instant::now();

        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            messages,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        if let Some(org) = &self.org_id {
            req = req.header("openai-organization", org);
        }

        let response = req
            .send()
            .await
            .map_err(|e| send_error(e, DEFAULT_TIMEOUT_SECS))?;
        let api_response: ChatResponse = json_body(check_status(response, &request.model).await?).await?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            model: api_response.model,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest::deterministic("deepseek-chat", "judge strictly", "{\"stem\":\"x\"}")
    }

    #[tokio::test]
    async fn successful_completion() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer ds-key"))
            .and(body_partial_json(serde_json::json!({
                "temperature": 0.0,
                "top_p": 0.0,
                "messages": [{"role": "system"}, {"role": "user"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"verdict\":\"incorrect\"}"}}],
                "model": "deepseek-chat",
                "usage": {"prompt_tokens": 40, "completion_tokens": 8}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("ds-key", Some(server.uri()), None).unwrap();
        let response = provider.complete(&request()).await.unwrap();
        assert_eq!(response.content, "{\"verdict\":\"incorrect\"}");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": {"message": "overloaded"}
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new("k", Some(server.uri()), None).unwrap();
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn deepseek_base_names_provider() {
        let p = OpenAiProvider::new("k", Some(DEEPSEEK_BASE_URL.into()), None).unwrap();
        assert_eq!(p.name(), "deepseek");
        let p = OpenAiProvider::new("k", None, None).unwrap();
        assert_eq!(p.name(), "openai");
    }
}
