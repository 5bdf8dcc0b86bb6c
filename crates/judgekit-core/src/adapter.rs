//! Turns one provider's per-item completion into a `JudgeVerdict`.
//!
//! Failures never escape as errors. A parse failure or a transient
//! provider failure gets exactly one more attempt with the strict prompt;
//! after that the verdict is recorded as an error in place. Permanent
//! provider errors (bad key, unknown model) skip the retry.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ParseError, ProviderError};
use crate::model::{ExerciseItem, FailureKind, ItemType, JudgeVerdict};
use crate::normalize;
use crate::prompts;
use crate::traits::{CompletionProvider, CompletionRequest};

/// Longest wait honoured from a rate-limit response before the retry.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Normalize a raw response into a verdict for `item_type`.
pub fn verdict_from_text(
    rater_id: &str,
    item_type: ItemType,
    raw: &str,
) -> Result<JudgeVerdict, ParseError> {
    let obj = normalize::parse_for(raw, Some(item_type))?;
    let label = obj.label(item_type)?;
    Ok(JudgeVerdict::ok(rater_id, label, obj.why, raw))
}

/// A rater backed by a synchronous completion provider.
pub struct JudgeAdapter {
    rater_id: String,
    provider: Arc<dyn CompletionProvider>,
    model: String,
    max_tokens: u32,
}

enum Attempt {
    Done(JudgeVerdict),
    Parse { raw: String, err: ParseError },
    Provider(ProviderError),
}

impl JudgeAdapter {
    pub fn new(
        rater_id: impl Into<String>,
        provider: Arc<dyn CompletionProvider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            rater_id: rater_id.into(),
            provider,
            model: model.into(),
            max_tokens: 512,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn rater_id(&self) -> &str {
        &self.rater_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn attempt(&self, item: &ExerciseItem, topic: &str, strict: bool) -> Attempt {
        let item_type = item.item_type();
        let mut request = CompletionRequest::deterministic(
            &self.model,
            prompts::system_prompt(item_type, strict),
            prompts::user_prompt(item, topic),
        );
        request.max_tokens = self.max_tokens;

        match self.provider.complete(&request).await {
            Ok(resp) => match verdict_from_text(&self.rater_id, item_type, &resp.content) {
                Ok(v) => Attempt::Done(v),
                Err(err) => Attempt::Parse {
                    raw: resp.content,
                    err,
                },
            },
            Err(e) => Attempt::Provider(e),
        }
    }

    /// Judge one item. Always returns a verdict; failures are error-tagged.
    pub async fn judge(&self, item: &ExerciseItem, topic: &str) -> JudgeVerdict {
        match self.attempt(item, topic, false).await {
            Attempt::Done(v) => return v,
            Attempt::Parse { err, .. } => {
                tracing::debug!(rater = %self.rater_id, "unparseable answer ({err}), retrying strict");
            }
            Attempt::Provider(e) if e.is_permanent() => {
                tracing::error!(rater = %self.rater_id, "permanent provider error: {e}");
                return JudgeVerdict::error(&self.rater_id, FailureKind::Transport, e.to_string(), "");
            }
            Attempt::Provider(e) => {
                if let Some(ms) = e.retry_after_ms() {
                    tokio::time::sleep(Duration::from_millis(ms).min(MAX_RATE_LIMIT_WAIT)).await;
                }
                tracing::debug!(rater = %self.rater_id, "provider error ({e}), retrying strict");
            }
        }

        match self.attempt(item, topic, true).await {
            Attempt::Done(v) => v,
            Attempt::Parse { raw, err } => {
                tracing::warn!(rater = %self.rater_id, "no verdict after strict retry: {err}");
                JudgeVerdict::error(&self.rater_id, FailureKind::Parse, err.to_string(), raw)
            }
            Attempt::Provider(e) => {
                tracing::warn!(rater = %self.rater_id, "provider failed after retry: {e}");
                JudgeVerdict::error(&self.rater_id, FailureKind::Transport, e.to_string(), "")
            }
        }
    }
}
