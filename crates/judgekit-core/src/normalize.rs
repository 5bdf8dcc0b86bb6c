//! Loose verdict parser for noisy judge output.
//!
//! Judges are asked for a bare JSON object but routinely wrap it in code
//! fences, prepend prose, or emit several objects. Extraction tries, in
//! order: the whole text as JSON, the text with fences stripped, every
//! balanced `{...}` span, and finally a keyword table. Nothing here does
//! I/O and the result depends only on the input text.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::model::{ItemType, Verdict};

/// Field every judge response is expected to carry.
pub const DISCRIMINATOR: &str = "verdict";

/// Keys accepted as the rationale, in preference order.
const EXPLANATION_KEYS: &[&str] = &["why", "explanation", "reason", "rationale"];

/// Keys tried when a candidate object lacks the discriminator.
const FALLBACK_LABEL_KEYS: &[&str] = &["label", "judgment", "judgement", "decision"];

/// Literal substrings mapped to labels, checked in order. Negated and
/// longer forms come before the words they contain.
const KEYWORDS: &[(&str, Verdict)] = &[
    ("unacceptable", Verdict::Unacceptable),
    ("not acceptable", Verdict::Unacceptable),
    ("incorrect", Verdict::Incorrect),
    ("not correct", Verdict::Incorrect),
    ("wrong", Verdict::Incorrect),
    ("ambiguous", Verdict::Ambiguous),
    ("unclear", Verdict::Ambiguous),
    ("both could", Verdict::Ambiguous),
    ("acceptable", Verdict::Acceptable),
    ("correct", Verdict::Correct),
];

/// The structured object a judge is asked to return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictObject {
    pub verdict: String,
    #[serde(default)]
    pub why: String,
}

impl VerdictObject {
    /// Normalize the label against `item_type`'s label set.
    pub fn label(&self, item_type: ItemType) -> Result<Verdict, ParseError> {
        let verdict: Verdict = self
            .verdict
            .parse()
            .map_err(|_| ParseError::UnknownLabel(self.verdict.clone()))?;
        if item_type.accepts(verdict) {
            Ok(verdict)
        } else {
            Err(ParseError::UnknownLabel(self.verdict.clone()))
        }
    }
}

/// Extract a verdict object from free text.
pub fn parse(text: &str) -> Result<VerdictObject, ParseError> {
    parse_for(text, None)
}

/// Extract a verdict object, restricting the keyword fallback to the labels
/// of `expected` when given.
pub fn parse_for(text: &str, expected: Option<ItemType>) -> Result<VerdictObject, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    if let Some(obj) = whole_object(trimmed) {
        return Ok(obj);
    }

    let unfenced = strip_fences(trimmed);
    if unfenced != trimmed {
        if let Some(obj) = whole_object(unfenced) {
            return Ok(obj);
        }
    }

    if let Some(obj) = best_embedded_object(trimmed) {
        return Ok(obj);
    }

    keyword_verdict(trimmed, expected).ok_or(ParseError::Unrecognized)
}

fn whole_object(text: &str) -> Option<VerdictObject> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => with_discriminator(&map),
        _ => None,
    }
}

/// Remove a surrounding Markdown code fence (with optional language tag)
/// and any stray backticks.
fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop the language tag line, e.g. ```json
        s = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
    }
    if let Some(idx) = s.rfind("```") {
        s = &s[..idx];
    }
    s.trim().trim_matches('`').trim()
}

/// Every balanced `{...}` span in `text`, outermost only, honouring JSON
/// string literals so braces inside strings do not count. A `{` that never
/// closes is skipped and the scan restarts just after it.
fn balanced_spans(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut from = 0usize;
    loop {
        let (found, unclosed) = scan_spans(text, from);
        spans.extend(found);
        match unclosed {
            Some(open) => from = open + 1,
            None => return spans,
        }
    }
}

/// Closed spans from `from` onward, plus the start of a trailing span that
/// never closed.
fn scan_spans(text: &str, from: usize) -> (Vec<&str>, Option<usize>) {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = from;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(from) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    (spans, (depth > 0).then_some(start))
}

fn best_embedded_object(text: &str) -> Option<VerdictObject> {
    let candidates: Vec<Map<String, Value>> = balanced_spans(text)
        .into_iter()
        .filter_map(|span| match serde_json::from_str::<Value>(span) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .collect();

    // A candidate carrying the discriminator wins; if several do, the last
    // one is the model's final answer.
    if let Some(obj) = candidates.iter().rev().find_map(with_discriminator) {
        return Some(obj);
    }

    let last = candidates.last()?;
    let label = FALLBACK_LABEL_KEYS
        .iter()
        .find_map(|k| string_field(last, k))?;
    Some(VerdictObject {
        verdict: label,
        why: explanation(last),
    })
}

fn with_discriminator(map: &Map<String, Value>) -> Option<VerdictObject> {
    let verdict = string_field(map, DISCRIMINATOR)?;
    Some(VerdictObject {
        verdict,
        why: explanation(map),
    })
}

/// Case-insensitive lookup of a string-valued field.
fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .and_then(|(_, v)| v.as_str())
        .map(str::to_string)
}

fn explanation(map: &Map<String, Value>) -> String {
    EXPLANATION_KEYS
        .iter()
        .find_map(|k| string_field(map, k))
        .unwrap_or_default()
}

fn keyword_verdict(text: &str, expected: Option<ItemType>) -> Option<VerdictObject> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .filter(|(_, v)| expected.map_or(true, |t| t.accepts(*v)))
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, v)| VerdictObject {
            verdict: v.as_str().to_string(),
            why: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(verdict: &str, why: &str) -> VerdictObject {
        VerdictObject {
            verdict: verdict.into(),
            why: why.into(),
        }
    }

    #[test]
    fn plain_json() {
        let parsed = parse(r#"{"verdict": "correct", "why": "clear stem"}"#).unwrap();
        assert_eq!(parsed, obj("correct", "clear stem"));
    }

    #[test]
    fn roundtrip_with_and_without_fences() {
        let original = obj("ambiguous", "B and C both fit");
        let text = serde_json::to_string(&original).unwrap();
        assert_eq!(parse(&text).unwrap(), original);

        let fenced = format!("```json\n{text}\n```");
        assert_eq!(parse(&fenced).unwrap(), original);

        let bare_fence = format!("```\n{text}\n```");
        assert_eq!(parse(&bare_fence).unwrap(), original);
    }

    #[test]
    fn embedded_object_after_prose() {
        let text = r#"Let me check the options. Final answer: {"verdict": "incorrect", "why": "key is wrong"} Hope this helps."#;
        assert_eq!(parse(text).unwrap(), obj("incorrect", "key is wrong"));
    }

    #[test]
    fn unclosed_brace_does_not_hide_later_objects() {
        let text = r#"Draft {"verdict": "correct" was cut off. Final: {"verdict": "incorrect", "why": "two options fit"}"#;
        assert_eq!(parse(text).unwrap(), obj("incorrect", "two options fit"));

        let spans = balanced_spans(r#"a { b {"x": 1} c {"y": "}"} d"#);
        assert_eq!(spans, vec![r#"{"x": 1}"#, r#"{"y": "}"}"#]);
    }

    #[test]
    fn prefers_candidate_with_discriminator() {
        let text = r#"Input was {"stem": "x", "options": {"A": "a"}} and my verdict is {"verdict": "correct", "why": "ok"}; meta {"tokens": 12}"#;
        assert_eq!(parse(text).unwrap(), obj("correct", "ok"));
    }

    #[test]
    fn braces_inside_strings_do_not_split_spans() {
        let text = r#"Result: {"verdict": "acceptable", "why": "uses {were} correctly"}"#;
        assert_eq!(parse(text).unwrap(), obj("acceptable", "uses {were} correctly"));
    }

    #[test]
    fn discriminator_key_is_case_insensitive() {
        let parsed = parse(r#"{"VERDICT": "Correct", "Why": "fine"}"#).unwrap();
        assert_eq!(parsed.verdict, "Correct");
        assert_eq!(parsed.label(ItemType::Mcq).unwrap(), Verdict::Correct);
    }

    #[test]
    fn last_candidate_with_alternate_label_key() {
        let text = r#"{"note": "thinking"} then {"label": "unacceptable", "reason": "tense"}"#;
        assert_eq!(parse(text).unwrap(), obj("unacceptable", "tense"));
    }

    #[test]
    fn keyword_fallback_checks_negations_first() {
        assert_eq!(parse("This item is incorrect.").unwrap().verdict, "incorrect");
        assert_eq!(parse("The answer is unacceptable").unwrap().verdict, "unacceptable");
        assert_eq!(parse("Looks correct to me").unwrap().verdict, "correct");
        assert_eq!(parse("It is unclear which option").unwrap().verdict, "ambiguous");
    }

    #[test]
    fn keyword_fallback_respects_item_type() {
        // "correct" is not a fill label; "acceptable" is the only match.
        let parsed = parse_for("acceptable and correct", Some(ItemType::Fill)).unwrap();
        assert_eq!(parsed.verdict, "acceptable");
        assert_eq!(
            parse_for("looks correct", Some(ItemType::Fill)),
            Err(ParseError::Unrecognized)
        );
    }

    #[test]
    fn unparseable_text_is_an_error() {
        assert_eq!(parse("I cannot help with that."), Err(ParseError::Unrecognized));
        assert_eq!(parse("   "), Err(ParseError::Empty));
        assert_eq!(parse(r#"{"score": 3}"#), Err(ParseError::Unrecognized));
    }

    #[test]
    fn label_must_fit_item_type() {
        let o = obj("correct", "");
        assert_eq!(o.label(ItemType::Mcq), Ok(Verdict::Correct));
        assert_eq!(
            o.label(ItemType::Fill),
            Err(ParseError::UnknownLabel("correct".into()))
        );
        assert!(obj("perhaps", "").label(ItemType::Mcq).is_err());
    }

    #[test]
    fn deterministic() {
        let text = "noise {\"verdict\":\"correct\"} {\"verdict\":\"incorrect\"}";
        assert_eq!(parse(text), parse(text));
        assert_eq!(parse(text).unwrap().verdict, "incorrect");
    }
}
