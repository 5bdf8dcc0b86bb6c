//! Core data model types for judgekit.
//!
//! These are the fundamental types that flow through the judging pipeline:
//! exercise items and their grouping keys, rater verdicts, and the scored
//! per-item records that every statistic is derived from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of exercise item being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    /// Multiple choice, judged on a three-way ordinal scale.
    Mcq,
    /// Fill-in-the-blank, judged on a two-way scale.
    Fill,
}

impl ItemType {
    /// The verdict labels a rater may assign to this item type, best first.
    pub fn classes(&self) -> &'static [Verdict] {
        match self {
            ItemType::Mcq => &[Verdict::Correct, Verdict::Ambiguous, Verdict::Incorrect],
            ItemType::Fill => &[Verdict::Acceptable, Verdict::Unacceptable],
        }
    }

    /// Whether `verdict` belongs to this item type's label set.
    pub fn accepts(&self, verdict: Verdict) -> bool {
        self.classes().contains(&verdict)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::Mcq => write!(f, "mcq"),
            ItemType::Fill => write!(f, "fill"),
        }
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mcq" | "multiple_choice" => Ok(ItemType::Mcq),
            "fill" | "fill_in" | "cloze" => Ok(ItemType::Fill),
            other => Err(format!("unknown item type: {other}")),
        }
    }
}

/// A categorical judgment label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Ambiguous,
    Incorrect,
    Acceptable,
    Unacceptable,
    /// The rater produced no usable label (transport, parse or batch failure).
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Correct => "correct",
            Verdict::Ambiguous => "ambiguous",
            Verdict::Incorrect => "incorrect",
            Verdict::Acceptable => "acceptable",
            Verdict::Unacceptable => "unacceptable",
            Verdict::Error => "error",
        }
    }

    /// Numeric score for this label under `item_type`'s fixed mapping table.
    ///
    /// Three-way labels map to 1.0 / 0.5 / 0.0, two-way labels to 1.0 / 0.0.
    /// Errors and labels that do not belong to the item type have no score.
    pub fn score(&self, item_type: ItemType) -> Option<f64> {
        match (item_type, self) {
            (ItemType::Mcq, Verdict::Correct) => Some(1.0),
            (ItemType::Mcq, Verdict::Ambiguous) => Some(0.5),
            (ItemType::Mcq, Verdict::Incorrect) => Some(0.0),
            (ItemType::Fill, Verdict::Acceptable) => Some(1.0),
            (ItemType::Fill, Verdict::Unacceptable) => Some(0.0),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "correct" => Ok(Verdict::Correct),
            "ambiguous" => Ok(Verdict::Ambiguous),
            "incorrect" => Ok(Verdict::Incorrect),
            "acceptable" => Ok(Verdict::Acceptable),
            "unacceptable" => Ok(Verdict::Unacceptable),
            "error" => Ok(Verdict::Error),
            other => Err(format!("unknown verdict label: {other}")),
        }
    }
}

/// Whether a rater's raw response could be turned into a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Ok,
    Error,
}

/// Classification of a row-level failure, recorded in place on the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network or provider outage.
    Transport,
    /// The provider answered but nothing usable could be extracted.
    Parse,
    /// The batch slot for this item came back empty or errored.
    MissingResult,
}

/// One rater's judgment of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    /// Rater that produced this verdict.
    pub rater_id: String,
    /// Normalized label (`Verdict::Error` when unusable).
    pub verdict: Verdict,
    /// Short rationale from the rater, or the failure message.
    #[serde(default)]
    pub explanation: String,
    /// Unmodified provider output.
    #[serde(default)]
    pub raw_response: String,
    pub parse_status: ParseStatus,
    /// Set when `parse_status` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl JudgeVerdict {
    /// A successfully parsed verdict.
    pub fn ok(
        rater_id: impl Into<String>,
        verdict: Verdict,
        explanation: impl Into<String>,
        raw_response: impl Into<String>,
    ) -> Self {
        Self {
            rater_id: rater_id.into(),
            verdict,
            explanation: explanation.into(),
            raw_response: raw_response.into(),
            parse_status: ParseStatus::Ok,
            failure: None,
        }
    }

    /// An error-tagged verdict. The message becomes the explanation.
    pub fn error(
        rater_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        raw_response: impl Into<String>,
    ) -> Self {
        Self {
            rater_id: rater_id.into(),
            verdict: Verdict::Error,
            explanation: message.into(),
            raw_response: raw_response.into(),
            parse_status: ParseStatus::Error,
            failure: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.parse_status == ParseStatus::Error || self.verdict == Verdict::Error
    }
}

/// The exercise content a judge is asked to assess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExerciseItem {
    Mcq {
        stem: String,
        /// Option id → option label.
        options: BTreeMap<String, String>,
        correct_option_id: String,
    },
    Fill {
        prompt: String,
        answer: String,
    },
}

impl ExerciseItem {
    pub fn item_type(&self) -> ItemType {
        match self {
            ExerciseItem::Mcq { .. } => ItemType::Mcq,
            ExerciseItem::Fill { .. } => ItemType::Fill,
        }
    }
}

/// Full grouping key of a generated item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    /// Generation configuration (e.g. "minimal", "cot").
    pub configuration: String,
    pub topic: String,
    pub item_type: ItemType,
    pub seed: u32,
    /// SHA-256 of the source text the item was generated from.
    pub source_hash: String,
}

impl GroupKey {
    /// The bucket used for per-group summaries.
    pub fn summary_key(&self) -> SummaryKey {
        SummaryKey {
            configuration: self.configuration.clone(),
            topic: self.topic.clone(),
            item_type: self.item_type,
            seed: self.seed,
        }
    }

    /// The key used to match the same source across configurations.
    pub fn pair_key(&self) -> PairKey {
        PairKey {
            source_hash: self.source_hash.clone(),
            topic: self.topic.clone(),
            item_type: self.item_type,
            seed: self.seed,
        }
    }
}

/// (configuration, topic, item type, seed)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryKey {
    pub configuration: String,
    pub topic: String,
    pub item_type: ItemType,
    pub seed: u32,
}

/// (source hash, topic, item type, seed)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub source_hash: String,
    pub topic: String,
    pub item_type: ItemType,
    pub seed: u32,
}

/// Compute the hex SHA-256 used as `source_hash` for a source text.
pub fn source_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// A unit of judging work handed over by the generation stage.
///
/// Structural validity and the semantic score come from external
/// collaborators and are carried through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeTask {
    pub item_id: String,
    /// Global position of the task in its input list.
    pub row_index: u64,
    pub group: GroupKey,
    pub item: ExerciseItem,
    #[serde(default = "default_true")]
    pub structural_valid: bool,
    #[serde(default)]
    pub semantic_score: f64,
}

fn default_true() -> bool {
    true
}

/// The immutable per-item record produced by one judging pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub item_id: String,
    pub row_index: u64,
    pub group: GroupKey,
    pub structural_valid: bool,
    /// Continuous similarity to the reference item, in [0, 1].
    pub semantic_score: f64,
    /// Rater id → verdict.
    #[serde(default)]
    pub judge_verdicts: BTreeMap<String, JudgeVerdict>,
}

impl ScoredItem {
    pub fn from_task(task: &JudgeTask, judge_verdicts: BTreeMap<String, JudgeVerdict>) -> Self {
        Self {
            item_id: task.item_id.clone(),
            row_index: task.row_index,
            group: task.group.clone(),
            structural_valid: task.structural_valid,
            semantic_score: task.semantic_score.clamp(0.0, 1.0),
            judge_verdicts,
        }
    }

    /// Score assigned by `rater`, or `None` if the rater errored or is absent.
    pub fn judge_score(&self, rater: &str) -> Option<f64> {
        self.judge_verdicts
            .get(rater)
            .filter(|v| !v.is_error())
            .and_then(|v| v.verdict.score(self.group.item_type))
    }

    /// All per-rater scores, skipping raters without a usable verdict.
    pub fn judge_scores(&self) -> BTreeMap<&str, f64> {
        self.judge_verdicts
            .keys()
            .filter_map(|rater| self.judge_score(rater).map(|s| (rater.as_str(), s)))
            .collect()
    }
}
