//! Mock providers for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use judgekit_core::error::ProviderError;
use judgekit_core::traits::{
    BatchBackend, BatchRequest, CompletionProvider, CompletionRequest, CompletionResponse,
    SubmitShape,
};

/// Prompt substring → response text, with a fallback.
#[derive(Debug, Clone)]
struct Responses {
    by_substring: HashMap<String, String>,
    default: String,
}

impl Responses {
    fn pick(&self, prompt: &str) -> String {
        self.by_substring
            .iter()
            .find(|(key, _)| prompt.contains(key.as_str()))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.default.clone())
    }
}

/// A mock completion provider for testing the engine without real API calls.
///
/// Returns configurable responses based on prompt content matching.
pub struct MockProvider {
    responses: Responses,
    call_count: AtomicU32,
    last_request: Mutex<Option<CompletionRequest>>,
}

impl MockProvider {
    /// Create a new mock provider with the given prompt→response mappings.
    pub fn new(responses: HashMap<String, String>) -> Self {
        Self {
            responses: Responses {
                by_substring: responses,
                default: r#"{"verdict":"acceptable","why":"mock"}"#.to_string(),
            },
            call_count: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Create a mock that always returns the same response.
    pub fn with_fixed_response(response: &str) -> Self {
        let mut mock = Self::new(HashMap::new());
        mock.responses.default = response.to_string();
        mock
    }

    /// Get the number of calls made to this provider.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Get the last request made to this provider.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().ok().and_then(|r| r.clone())
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request.clone());
        }

        Ok(CompletionResponse {
            content: self.responses.pick(&request.prompt),
            model: request.model.clone(),
            latency_ms: 1,
        })
    }
}

/// A batch backend that finishes every job on its first status query.
///
/// Results are listed in reverse submission order, keyed by `custom_id`,
/// so callers exercise realignment.
pub struct MockBatchBackend {
    responses: Responses,
    jobs: Mutex<HashMap<String, Vec<BatchRequest>>>,
    submit_count: AtomicU32,
    status_count: AtomicU32,
}

impl MockBatchBackend {
    pub fn new(responses: HashMap<String, String>) -> Self {
        Self {
            responses: Responses {
                by_substring: responses,
                default: r#"{"verdict":"acceptable","why":"mock"}"#.to_string(),
            },
            jobs: Mutex::new(HashMap::new()),
            submit_count: AtomicU32::new(0),
            status_count: AtomicU32::new(0),
        }
    }

    pub fn with_fixed_response(response: &str) -> Self {
        let mut mock = Self::new(HashMap::new());
        mock.responses.default = response.to_string();
        mock
    }

    /// Jobs submitted so far.
    pub fn submit_count(&self) -> u32 {
        self.submit_count.load(Ordering::Relaxed)
    }

    pub fn status_count(&self) -> u32 {
        self.status_count.load(Ordering::Relaxed)
    }

    fn poisoned() -> ProviderError {
        ProviderError::NetworkError("mock state poisoned".into())
    }
}

#[async_trait]
impl BatchBackend for MockBatchBackend {
    fn name(&self) -> &str {
        "mock-batch"
    }

    fn submit_shapes(&self) -> &[SubmitShape] {
        &[SubmitShape::InlineRequests]
    }

    async fn submit(
        &self,
        _shape: SubmitShape,
        requests: &[BatchRequest],
        _model: &str,
    ) -> Result<Value, ProviderError> {
        let n = self.submit_count.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("mock-batch-{n}");
        self.jobs
            .lock()
            .map_err(|_| Self::poisoned())?
            .insert(job_id.clone(), requests.to_vec());
        Ok(json!({ "name": job_id, "state": "PENDING" }))
    }

    async fn status(&self, job_id: &str) -> Result<Value, ProviderError> {
        self.status_count.fetch_add(1, Ordering::Relaxed);
        let jobs = self.jobs.lock().map_err(|_| Self::poisoned())?;
        let requests = jobs
            .get(job_id)
            .ok_or_else(|| ProviderError::ApiError {
                status: 404,
                message: format!("no such job {job_id}"),
            })?;
        let results: Vec<Value> = requests
            .iter()
            .rev()
            .map(|r| {
                json!({
                    "custom_id": r.custom_id,
                    "text": self.responses.pick(&r.prompt),
                })
            })
            .collect();
        Ok(json!({ "name": job_id, "state": "SUCCEEDED", "results": results }))
    }

    async fn download(&self, reference: &str) -> Result<String, ProviderError> {
        Err(ProviderError::ApiError {
            status: 404,
            message: format!("mock backend has no artifact {reference}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use judgekit_core::batch::{BatchConfig, BatchOrchestrator};

    #[tokio::test]
    async fn fixed_response() {
        let provider = MockProvider::with_fixed_response(r#"{"verdict":"correct"}"#);
        let request = CompletionRequest::deterministic("mock", "sys", "anything");

        let response = provider.complete(&request).await.unwrap();
        assert_eq!(response.content, r#"{"verdict":"correct"}"#);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.last_request().unwrap().prompt, "anything");
    }

    #[tokio::test]
    async fn prompt_matching() {
        let mut responses = HashMap::new();
        responses.insert("has gone".to_string(), r#"{"verdict":"acceptable"}"#.to_string());
        responses.insert("have went".to_string(), r#"{"verdict":"unacceptable"}"#.to_string());
        let provider = MockProvider::new(responses);

        let resp = provider
            .complete(&CompletionRequest::deterministic("m", "s", "answer: have went"))
            .await
            .unwrap();
        assert!(resp.content.contains("unacceptable"));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn batch_mock_runs_through_orchestrator() {
        let mut responses = HashMap::new();
        responses.insert("first".to_string(), "A".to_string());
        responses.insert("second".to_string(), "B".to_string());
        let backend = Arc::new(MockBatchBackend::new(responses));
        let orchestrator = BatchOrchestrator::new(
            backend.clone(),
            BatchConfig {
                poll_interval: Duration::from_millis(1),
                ..BatchConfig::default()
            },
        );

        let prompts = vec![
            ("s".to_string(), "first".to_string()),
            ("s".to_string(), "second".to_string()),
        ];
        let chunks = orchestrator.run(&prompts, "mock-model").await;
        assert_eq!(chunks.len(), 1);
        let texts = chunks.into_iter().next().unwrap().outcome.unwrap();
        assert_eq!(texts, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(backend.submit_count(), 1);
        assert_eq!(backend.status_count(), 1);
    }
}
