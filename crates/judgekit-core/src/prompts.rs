//! Judge prompt construction.
//!
//! A prompt is a fixed system instruction per item type followed by the
//! item's fields serialized as a JSON object. Field order is fixed so the
//! same item always renders to the same bytes.

use serde_json::json;

use crate::model::{ExerciseItem, ItemType};

pub const MCQ_SYSTEM: &str = "Return JSON: { \"verdict\": \"correct|ambiguous|incorrect\", \"why\": \"<one sentence>\" }\nJudge as a strict EFL reviewer. Do not generate new content.";

pub const FILL_SYSTEM: &str = "Return JSON: { \"verdict\": \"acceptable|unacceptable\", \"why\": \"<one sentence>\" }\nJudge as a strict EFL reviewer. Do not generate new content.";

/// Appended on the single retry after an unparseable answer.
pub const STRICT_SUFFIX: &str = "ONLY JSON. DO NOT WRITE ANYTHING ELSE.";

/// System instruction for `item_type`, optionally with the strict suffix.
pub fn system_prompt(item_type: ItemType, strict: bool) -> String {
    let base = match item_type {
        ItemType::Mcq => MCQ_SYSTEM,
        ItemType::Fill => FILL_SYSTEM,
    };
    if strict {
        format!("{base}\n{STRICT_SUFFIX}")
    } else {
        base.to_string()
    }
}

/// The item serialized as the user message.
pub fn user_prompt(item: &ExerciseItem, topic: &str) -> String {
    let value = match item {
        ExerciseItem::Mcq {
            stem,
            options,
            correct_option_id,
        } => json!({
            "stem": stem,
            "options": options,
            "correctOptionId": correct_option_id,
            "topic": topic,
        }),
        ExerciseItem::Fill { prompt, answer } => json!({
            "prompt": prompt,
            "answer": answer,
            "topic": topic,
        }),
    };
    value.to_string()
}

/// System instruction and item in one string, for batch APIs that take a
/// single text part per request.
pub fn combined_prompt(item: &ExerciseItem, topic: &str, strict: bool) -> String {
    format!(
        "{}\n{}",
        system_prompt(item.item_type(), strict),
        user_prompt(item, topic)
    )
}
