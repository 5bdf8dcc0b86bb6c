//! Asynchronous batch orchestration: submit, poll, retrieve, realign.
//!
//! Provider batch APIs disagree on nearly every field name. Each concern
//! (job id, state, where results live, index and text of one entry) is a
//! small pure function over `serde_json::Value` that walks a fixed,
//! priority-ordered list of known locations. The orchestrator only strings
//! them together.
//!
//! Results always leave this module in submission order with exactly one
//! slot per prompt. Slots that could not be resolved hold `""`.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::{BatchError, ProviderError};
use crate::traits::{BatchBackend, BatchRequest};

/// Tuning for batch submission and polling.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum prompts per sub-batch.
    pub chunk_size: usize,
    /// Sub-batches in flight at once.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Overall limit from submission to terminal state.
    pub deadline: Duration,
    /// Extra attempts for a failed status query.
    pub status_retries: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            concurrency: 2,
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(6 * 60 * 60),
            status_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

/// One provider round-trip.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub provider: String,
    pub external_job_id: String,
    pub state: JobState,
    pub ordered_prompts: Vec<BatchRequest>,
    /// Same length as `ordered_prompts`.
    pub results_by_index: Vec<String>,
    /// Most recent status document.
    pub last_status: Value,
    /// Start of the deadline clock.
    pub submitted_at: Instant,
}

// ---------------------------------------------------------------------------
// Pure extraction over status and result documents
// ---------------------------------------------------------------------------

/// Follow `path` through nested objects.
fn at<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |v, key| v.get(key))
}

fn non_empty_str<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a str> {
    at(doc, path).and_then(Value::as_str).filter(|s| !s.is_empty())
}

const JOB_ID_PATHS: &[&[&str]] = &[&["name"], &["id"], &["batch", "name"], &["metadata", "name"]];

const STATE_PATHS: &[&[&str]] = &[
    &["state"],
    &["status"],
    &["processing_status"],
    &["metadata", "state"],
    &["metadata", "status"],
    &["batch", "state"],
    &["status", "state"],
];

pub fn extract_job_id(doc: &Value) -> Option<String> {
    JOB_ID_PATHS
        .iter()
        .find_map(|p| non_empty_str(doc, p))
        .map(str::to_string)
}

/// The job state string, from the first location that holds one.
pub fn extract_state(doc: &Value) -> Option<String> {
    STATE_PATHS
        .iter()
        .find_map(|p| non_empty_str(doc, p))
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Success,
    Failure,
    Pending,
}

const SUCCESS_STATES: &[&str] = &["SUCCEEDED", "COMPLETED", "ENDED"];
const FAILURE_STATES: &[&str] = &["FAILED", "CANCELLED", "CANCELED", "EXPIRED"];

/// Match a state string against the success and failure families. Both
/// bare words and enum-style suffixes (`JOB_STATE_SUCCEEDED`) count.
pub fn classify_state(state: &str) -> StateClass {
    let s = state.trim().to_uppercase();
    let hit = |family: &[&str]| {
        family
            .iter()
            .any(|w| s == *w || s.ends_with(&format!("_{w}")))
    };
    if hit(SUCCESS_STATES) {
        StateClass::Success
    } else if hit(FAILURE_STATES) {
        StateClass::Failure
    } else {
        StateClass::Pending
    }
}

/// Where a finished job's results live.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSource<'a> {
    /// Result entries embedded in the status document.
    Inline(&'a [Value]),
    /// A line-delimited artifact to download.
    File(&'a str),
    /// The alternate inlined-responses field.
    Inlined(&'a [Value]),
}

const INLINE_PATHS: &[&[&str]] = &[
    &["inline_output", "inline_responses"],
    &["inlineOutput", "inlineResponses"],
    &["results"],
];

const FILE_PATHS: &[&[&str]] = &[
    &["dest", "file_name"],
    &["dest", "fileName"],
    &["metadata", "output", "responsesFile"],
    &["response", "responsesFile"],
    &["output", "responsesFile"],
    &["results_url"],
];

const INLINED_PATHS: &[&[&str]] = &[
    &["dest", "inlined_responses"],
    &["dest", "inlinedResponses"],
    &["metadata", "output", "inlinedResponses", "inlinedResponses"],
    &["response", "inlinedResponses", "inlinedResponses"],
    &["output", "inlinedResponses"],
];

fn array_at<'a>(doc: &'a Value, paths: &[&[&str]]) -> Option<&'a [Value]> {
    paths
        .iter()
        .find_map(|p| at(doc, p).and_then(Value::as_array))
        .map(Vec::as_slice)
}

/// Locate results in a terminal status document: inline array first, then
/// a downloadable artifact, then the alternate inlined field.
pub fn locate_results(doc: &Value) -> Option<ResultSource<'_>> {
    if let Some(entries) = array_at(doc, INLINE_PATHS) {
        return Some(ResultSource::Inline(entries));
    }
    if let Some(reference) = FILE_PATHS.iter().find_map(|p| non_empty_str(doc, p)) {
        return Some(ResultSource::File(reference));
    }
    array_at(doc, INLINED_PATHS).map(ResultSource::Inlined)
}

const INDEX_KEYS: &[&str] = &["index", "requestIndex", "input_index", "request_index"];
const ID_PATHS: &[&[&str]] = &[&["custom_id"], &["key"], &["metadata", "key"]];

fn as_index(v: &Value) -> Option<usize> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Trailing integer of an id such as `req-7` or `run42_7`.
fn index_from_id(id: &str) -> Option<usize> {
    let tail = id.rsplit(['-', '_']).next()?;
    tail.parse().ok()
}

/// Explicit submission index of a result entry, if it carries one.
pub fn entry_index(entry: &Value) -> Option<usize> {
    INDEX_KEYS
        .iter()
        .find_map(|k| entry.get(k).and_then(as_index))
        .or_else(|| {
            ID_PATHS
                .iter()
                .find_map(|p| non_empty_str(entry, p))
                .and_then(index_from_id)
        })
}

fn joined_text(parts: &Value) -> Option<String> {
    let texts: Vec<&str> = parts
        .as_array()?
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.concat())
    }
}

/// Response text of one result entry. Errored entries yield `""`.
pub fn entry_text(entry: &Value) -> String {
    if entry.get("error").is_some_and(|e| !e.is_null()) {
        return String::new();
    }
    if let Some(kind) = non_empty_str(entry, &["result", "type"]) {
        if kind != "succeeded" {
            return String::new();
        }
    }

    let candidates = [
        at(entry, &["response", "candidates"])
            .and_then(|c| c.get(0))
            .and_then(|c| at(c, &["content", "parts"]))
            .and_then(joined_text),
        non_empty_str(entry, &["response", "text"]).map(str::to_string),
        at(entry, &["result", "message", "content"]).and_then(joined_text),
        non_empty_str(entry, &["text"]).map(str::to_string),
        non_empty_str(entry, &["output"]).map(str::to_string),
    ];
    candidates.into_iter().flatten().next().unwrap_or_default()
}

/// Place entries into `n` slots by explicit index, or by position when no
/// entry carries one. Out-of-range indices are dropped.
pub fn realign(entries: &[Value], n: usize) -> Vec<String> {
    let mut out = vec![String::new(); n];
    let indexed = entries.iter().any(|e| entry_index(e).is_some());

    for (pos, entry) in entries.iter().enumerate() {
        let slot = if indexed { entry_index(entry) } else { Some(pos) };
        match slot {
            Some(i) if i < n => out[i] = entry_text(entry),
            Some(i) => tracing::warn!(index = i, n, "batch result index out of range"),
            None => tracing::warn!(position = pos, "batch result without index dropped"),
        }
    }
    out
}

/// Parse a line-delimited artifact. Unreadable lines become `Null`
/// entries so positional alignment is kept.
pub fn parse_jsonl(text: &str) -> Vec<Value> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap_or(Value::Null))
        .collect()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Outcome of one sub-batch, covering `range` of the submitted prompts.
#[derive(Debug)]
pub struct ChunkResult {
    pub range: Range<usize>,
    pub outcome: Result<Vec<String>, BatchError>,
}

pub struct BatchOrchestrator {
    backend: Arc<dyn BatchBackend>,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(backend: Arc<dyn BatchBackend>, config: BatchConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Create a job, trying each known submission shape in order.
    #[tracing::instrument(skip(self, requests), fields(provider = self.backend.name(), n = requests.len()))]
    pub async fn submit_batch(
        &self,
        requests: Vec<BatchRequest>,
        model: &str,
    ) -> Result<BatchJob, BatchError> {
        let mut last_err = None;
        for &shape in self.backend.submit_shapes() {
            match self.backend.submit(shape, &requests, model).await {
                Ok(doc) => {
                    let job_id = extract_job_id(&doc).ok_or(BatchError::MissingJobId)?;
                    tracing::info!(job = %job_id, ?shape, "batch submitted");
                    let n = requests.len();
                    return Ok(BatchJob {
                        provider: self.backend.name().to_string(),
                        external_job_id: job_id,
                        state: JobState::Submitted,
                        ordered_prompts: requests,
                        results_by_index: vec![String::new(); n],
                        last_status: doc,
                        submitted_at: Instant::now(),
                    });
                }
                Err(e) if e.is_shape_rejection() => {
                    tracing::warn!(?shape, "submission shape rejected: {e}");
                    last_err = Some(e);
                }
                Err(e) => return Err(BatchError::Submit(e)),
            }
        }
        Err(BatchError::Submit(last_err.unwrap_or_else(|| {
            ProviderError::MalformedResponse("backend offers no submission shape".into())
        })))
    }

    /// Status query with bounded retries and linear backoff. Backoff never
    /// sleeps past the job deadline.
    async fn refresh(&self, job_id: &str, submitted_at: Instant) -> Result<Value, BatchError> {
        let deadline = submitted_at + self.config.deadline;
        let mut attempt = 0u32;
        loop {
            match self.backend.status(job_id).await {
                Ok(doc) => return Ok(doc),
                Err(e) if e.is_permanent() || attempt >= self.config.status_retries => {
                    return Err(BatchError::Provider(e));
                }
                Err(e) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(BatchError::Timeout {
                            job_id: job_id.to_string(),
                            waited_secs: submitted_at.elapsed().as_secs(),
                        });
                    }
                    attempt += 1;
                    let backoff = (self.config.poll_interval * (attempt + 1))
                        .min(Duration::from_secs(10))
                        .min(remaining);
                    tracing::warn!(job = job_id, attempt, "status query failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Poll until the job reaches a terminal state or the deadline, counted
    /// from submission, passes.
    pub async fn poll(&self, job: &mut BatchJob) -> Result<JobState, BatchError> {
        let started = job.submitted_at;
        job.state = JobState::Polling;
        loop {
            let state = extract_state(&job.last_status);
            match state.as_deref().map(classify_state) {
                Some(StateClass::Success) => {
                    job.state = JobState::Succeeded;
                    return Ok(job.state);
                }
                Some(StateClass::Failure) => {
                    job.state = JobState::Failed;
                    return Err(BatchError::JobFailed {
                        job_id: job.external_job_id.clone(),
                        state: state.unwrap_or_default(),
                    });
                }
                _ => {}
            }

            let waited = started.elapsed();
            if waited >= self.config.deadline {
                job.state = JobState::TimedOut;
                return Err(BatchError::Timeout {
                    job_id: job.external_job_id.clone(),
                    waited_secs: waited.as_secs(),
                });
            }
            tracing::debug!(
                job = %job.external_job_id,
                state = state.as_deref().unwrap_or("UNKNOWN"),
                waited_secs = waited.as_secs(),
                "polling"
            );
            tokio::time::sleep(self.config.poll_interval.min(self.config.deadline - waited)).await;
            match self.refresh(&job.external_job_id, started).await {
                Ok(doc) => job.last_status = doc,
                Err(e) => {
                    job.state = if e.is_timeout() { JobState::TimedOut } else { JobState::Failed };
                    return Err(e);
                }
            }
        }
    }

    /// Fill `results_by_index` from a succeeded job.
    pub async fn retrieve(&self, job: &mut BatchJob) -> Result<(), BatchError> {
        let n = job.ordered_prompts.len();
        let results = match locate_results(&job.last_status) {
            Some(ResultSource::Inline(entries)) | Some(ResultSource::Inlined(entries)) => {
                realign(entries, n)
            }
            Some(ResultSource::File(reference)) => {
                let reference = reference.to_string();
                tracing::info!(job = %job.external_job_id, "downloading results from {reference}");
                let body = self.backend.download(&reference).await?;
                realign(&parse_jsonl(&body), n)
            }
            None => {
                tracing::warn!(
                    job = %job.external_job_id,
                    "unrecognized batch result shape, treating all {n} results as empty"
                );
                vec![String::new(); n]
            }
        };
        let resolved = results.iter().filter(|r| !r.is_empty()).count();
        tracing::info!(job = %job.external_job_id, resolved, n, "batch results retrieved");
        job.results_by_index = results;
        Ok(())
    }

    /// Submit, poll and retrieve one sub-batch.
    pub async fn run_chunk(
        &self,
        requests: Vec<BatchRequest>,
        model: &str,
    ) -> Result<Vec<String>, BatchError> {
        let mut job = self.submit_batch(requests, model).await?;
        self.poll(&mut job).await?;
        self.retrieve(&mut job).await?;
        Ok(job.results_by_index)
    }

    /// Run `prompts` (system, user) as bounded-size sub-batches with at most
    /// `concurrency` in flight. Results come back ordered by range.
    pub async fn run(&self, prompts: &[(String, String)], model: &str) -> Vec<ChunkResult> {
        let chunk_size = self.config.chunk_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut futures = FuturesUnordered::new();

        for (chunk_no, chunk) in prompts.chunks(chunk_size).enumerate() {
            let start = chunk_no * chunk_size;
            let range = start..start + chunk.len();
            let requests: Vec<BatchRequest> = chunk
                .iter()
                .enumerate()
                .map(|(i, (system, user))| BatchRequest::new(i, system.clone(), user.clone()))
                .collect();
            let semaphore = Arc::clone(&semaphore);

            futures.push(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => self.run_chunk(requests, model).await,
                    Err(_) => Err(BatchError::Provider(ProviderError::NetworkError(
                        "worker pool closed".into(),
                    ))),
                };
                if let Err(e) = &outcome {
                    tracing::error!(?range, "sub-batch failed: {e}");
                }
                ChunkResult { range, outcome }
            });
        }

        let mut results = Vec::new();
        while let Some(r) = futures.next().await {
            results.push(r);
        }
        results.sort_by_key(|r| r.range.start);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::SubmitShape;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn realigns_explicit_indices() {
        let entries = vec![
            json!({"index": 2, "text": "third"}),
            json!({"index": 0, "text": "first"}),
            json!({"index": 1, "text": "second"}),
        ];
        assert_eq!(realign(&entries, 3), vec!["first", "second", "third"]);
    }

    #[test]
    fn positional_when_no_index() {
        let entries = vec![json!({"text": "a"}), json!({"output": "b"})];
        assert_eq!(realign(&entries, 3), vec!["a", "b", ""]);
    }

    #[test]
    fn custom_ids_and_string_indices() {
        let entries = vec![
            json!({"custom_id": "req-1", "result": {"type": "succeeded", "message": {"content": [{"type": "text", "text": "B"}]}}}),
            json!({"custom_id": "req-0", "result": {"type": "errored", "error": {"type": "overloaded"}}}),
            json!({"requestIndex": "2", "response": {"text": "C"}}),
        ];
        assert_eq!(realign(&entries, 3), vec!["", "B", "C"]);
        assert_eq!(entry_index(&json!({"key": "run7_12"})), Some(12));
        assert_eq!(entry_index(&json!({"metadata": {"key": "req-4"}})), Some(4));
    }

    #[test]
    fn gemini_candidate_parts_are_joined() {
        let entry = json!({"response": {"candidates": [{"content": {"parts": [{"text": "{\"verdict\":"}, {"text": "\"correct\"}"}]}}]}});
        assert_eq!(entry_text(&entry), "{\"verdict\":\"correct\"}");
        assert_eq!(entry_text(&json!({"error": {"code": 500}, "text": "x"})), "");
    }

    #[test]
    fn out_of_range_index_is_dropped() {
        let entries = vec![json!({"index": 9, "text": "x"})];
        assert_eq!(realign(&entries, 2), vec!["", ""]);
    }

    #[test]
    fn state_families() {
        for s in ["SUCCEEDED", "completed", "ended", "JOB_STATE_SUCCEEDED", "BATCH_STATE_SUCCEEDED"] {
            assert_eq!(classify_state(s), StateClass::Success, "{s}");
        }
        for s in ["FAILED", "cancelled", "CANCELED", "expired", "JOB_STATE_FAILED", "BATCH_STATE_CANCELLED"] {
            assert_eq!(classify_state(s), StateClass::Failure, "{s}");
        }
        for s in ["RUNNING", "in_progress", "canceling", "JOB_STATE_PENDING", ""] {
            assert_eq!(classify_state(s), StateClass::Pending, "{s}");
        }
    }

    #[test]
    fn state_from_any_known_location() {
        assert_eq!(extract_state(&json!({"state": "RUNNING"})).as_deref(), Some("RUNNING"));
        assert_eq!(extract_state(&json!({"processing_status": "ended"})).as_deref(), Some("ended"));
        assert_eq!(
            extract_state(&json!({"metadata": {"state": "BATCH_STATE_RUNNING"}})).as_deref(),
            Some("BATCH_STATE_RUNNING")
        );
        assert_eq!(extract_state(&json!({"status": {"state": "DONE"}})).as_deref(), Some("DONE"));
        assert_eq!(extract_state(&json!({"other": 1})), None);
    }

    #[test]
    fn result_source_priority() {
        let doc = json!({
            "results": [{"text": "inline"}],
            "results_url": "https://x/results",
            "dest": {"inlined_responses": []}
        });
        assert!(matches!(locate_results(&doc), Some(ResultSource::Inline(_))));

        let doc = json!({"results_url": "https://x/results", "dest": {"inlined_responses": []}});
        assert_eq!(locate_results(&doc), Some(ResultSource::File("https://x/results")));

        let doc = json!({"dest": {"inlined_responses": [{"text": "a"}]}});
        assert!(matches!(locate_results(&doc), Some(ResultSource::Inlined(e)) if e.len() == 1));

        assert_eq!(locate_results(&json!({"state": "SUCCEEDED"})), None);
    }

    /// Backend driven by queued status documents.
    struct FakeBackend {
        shapes: Vec<SubmitShape>,
        reject_inline: bool,
        statuses: Mutex<VecDeque<Result<Value, ProviderError>>>,
        download_body: String,
        submits: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeBackend {
        fn new(statuses: Vec<Result<Value, ProviderError>>) -> Self {
            Self {
                shapes: vec![SubmitShape::InlineRequests, SubmitShape::FileReference],
                reject_inline: false,
                statuses: Mutex::new(statuses.into()),
                download_body: String::new(),
                submits: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn submit_shapes(&self) -> &[SubmitShape] {
            &self.shapes
        }

        async fn submit(
            &self,
            shape: SubmitShape,
            requests: &[BatchRequest],
            _model: &str,
        ) -> Result<Value, ProviderError> {
            if self.reject_inline && shape == SubmitShape::InlineRequests {
                return Err(ProviderError::ApiError {
                    status: 400,
                    message: "unknown field".into(),
                });
            }
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            // Echo prompts back as inline results in reverse order.
            let results: Vec<Value> = requests
                .iter()
                .rev()
                .map(|r| json!({"index": r.index, "text": format!("echo:{}", r.prompt)}))
                .collect();
            Ok(json!({"name": format!("batches/{n}"), "state": "PENDING", "shape": format!("{shape:?}"), "echo": results}))
        }

        async fn status(&self, job_id: &str) -> Result<Value, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self.statuses.lock().unwrap().pop_front();
            match next {
                Some(r) => r,
                None => Ok(json!({"name": job_id, "state": "SUCCEEDED", "results": []})),
            }
        }

        async fn download(&self, _reference: &str) -> Result<String, ProviderError> {
            Ok(self.download_body.clone())
        }
    }

    fn config() -> BatchConfig {
        BatchConfig {
            chunk_size: 1000,
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
            status_retries: 3,
        }
    }

    fn requests(n: usize) -> Vec<BatchRequest> {
        (0..n).map(|i| BatchRequest::new(i, "sys", format!("p{i}"))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_round_trip_realigns_results() {
        let backend = FakeBackend::new(vec![
            Ok(json!({"state": "RUNNING"})),
            Ok(json!({
                "state": "JOB_STATE_SUCCEEDED",
                "results": [
                    {"index": 2, "text": "r2"},
                    {"index": 0, "text": "r0"},
                    {"index": 1, "text": "r1"}
                ]
            })),
        ]);
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        let out = orch.run_chunk(requests(3), "m").await.unwrap();
        assert_eq!(out, vec!["r0", "r1", "r2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_submission_shape() {
        let mut backend = FakeBackend::new(vec![]);
        backend.reject_inline = true;
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        let job = orch.submit_batch(requests(2), "m").await.unwrap();
        assert_eq!(job.last_status["shape"], "FileReference");
        assert_eq!(job.state, JobState::Submitted);
        assert_eq!(job.results_by_index.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_raises_timeout() {
        let statuses = (0..1000).map(|_| Ok(json!({"state": "RUNNING"}))).collect();
        let orch = BatchOrchestrator::new(Arc::new(FakeBackend::new(statuses)), config());
        let mut job = orch.submit_batch(requests(1), "m").await.unwrap();
        let err = orch.poll(&mut job).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(job.state, JobState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_from_submission() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let orch = BatchOrchestrator::new(backend.clone(), config());
        let mut job = orch.submit_batch(requests(1), "m").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let err = orch.poll(&mut job).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(job.state, JobState::TimedOut);
        // No status query was needed to notice the deadline.
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_backoff_stops_at_deadline() {
        let flaky = || Err(ProviderError::NetworkError("reset".into()));
        let backend = FakeBackend::new((0..20).map(|_| flaky()).collect());
        let mut cfg = config();
        cfg.poll_interval = Duration::from_secs(5);
        cfg.deadline = Duration::from_secs(7);
        cfg.status_retries = 10;
        let orch = BatchOrchestrator::new(Arc::new(backend), cfg);

        let mut job = orch.submit_batch(requests(1), "m").await.unwrap();
        let err = orch.poll(&mut job).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert_eq!(job.state, JobState::TimedOut);
        assert!(job.submitted_at.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_state_fails_job() {
        let backend = FakeBackend::new(vec![Ok(json!({"metadata": {"state": "BATCH_STATE_FAILED"}}))]);
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        let err = orch.run_chunk(requests(2), "m").await.unwrap_err();
        assert!(matches!(err, BatchError::JobFailed { ref state, .. } if state == "BATCH_STATE_FAILED"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_errors_are_retried() {
        let flaky = || Err(ProviderError::NetworkError("reset".into()));
        let backend = FakeBackend::new(vec![
            flaky(),
            flaky(),
            Ok(json!({"state": "SUCCEEDED", "results": [{"text": "ok"}]})),
        ]);
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        assert_eq!(orch.run_chunk(requests(1), "m").await.unwrap(), vec!["ok"]);

        let backend = FakeBackend::new(vec![flaky(), flaky(), flaky(), flaky()]);
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        assert!(matches!(
            orch.run_chunk(requests(1), "m").await,
            Err(BatchError::Provider(ProviderError::NetworkError(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn downloaded_artifact_is_realigned() {
        let mut backend = FakeBackend::new(vec![Ok(json!({
            "processing_status": "ended",
            "results_url": "https://api.example/v1/messages/batches/b1/results"
        }))]);
        backend.download_body = [
            r#"{"custom_id":"req-1","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"one"}]}}}"#,
            "not json",
            r#"{"custom_id":"req-0","result":{"type":"succeeded","message":{"content":[{"type":"text","text":"zero"}]}}}"#,
        ]
        .join("\n");
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        let out = orch.run_chunk(requests(3), "m").await.unwrap();
        assert_eq!(out, vec!["zero", "one", ""]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_result_shape_yields_empty_slots() {
        let backend = FakeBackend::new(vec![Ok(json!({"state": "SUCCEEDED", "payload": {"x": 1}}))]);
        let orch = BatchOrchestrator::new(Arc::new(backend), config());
        assert_eq!(orch.run_chunk(requests(2), "m").await.unwrap(), vec!["", ""]);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_run_bounded_and_merge_in_order() {
        let backend = Arc::new(FakeBackend::new(vec![]));
        let mut cfg = config();
        cfg.chunk_size = 2;
        cfg.concurrency = 2;
        let orch = BatchOrchestrator::new(backend.clone(), cfg);
        let prompts: Vec<(String, String)> = (0..5).map(|i| ("s".to_string(), format!("p{i}"))).collect();
        let out = orch.run(&prompts, "m").await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].range, 0..2);
        assert_eq!(out[2].range, 4..5);
        assert!(out.iter().all(|c| c.outcome.is_ok()));
        assert_eq!(out[2].outcome.as_ref().unwrap().len(), 1);
        assert_eq!(backend.submits.load(Ordering::SeqCst), 3);
        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
