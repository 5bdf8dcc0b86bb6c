//! Group-level statistics over scored items.
//!
//! Items are bucketed by (configuration, topic, item type, seed). Each
//! bucket gets one summary for the semantic score and one per rater for the
//! judge score. Inputs are sorted before summation so the output depends
//! only on the set of items, not the order they were loaded in.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{ScoredItem, SummaryKey};
use crate::statistics::{mean_interval, MeanInterval};

/// A tracked per-item metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Metric {
    /// Continuous similarity to the reference item.
    Semantic,
    /// Mean of every usable rater score for the item.
    JudgeMean,
    /// One rater's score.
    Judge(String),
}

impl Metric {
    /// Value of this metric for `item`, if defined.
    pub fn value(&self, item: &ScoredItem) -> Option<f64> {
        match self {
            Metric::Semantic => Some(item.semantic_score),
            Metric::JudgeMean => {
                let scores = item.judge_scores();
                if scores.is_empty() {
                    None
                } else {
                    Some(scores.values().sum::<f64>() / scores.len() as f64)
                }
            }
            Metric::Judge(rater) => item.judge_score(rater),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Semantic => write!(f, "semantic"),
            Metric::JudgeMean => write!(f, "judge"),
            Metric::Judge(rater) => write!(f, "judge:{rater}"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semantic" => Ok(Metric::Semantic),
            "judge" => Ok(Metric::JudgeMean),
            other => match other.strip_prefix("judge:") {
                Some(rater) if !rater.is_empty() => Ok(Metric::Judge(rater.to_string())),
                _ => Err(format!("unknown metric: {other}")),
            },
        }
    }
}

impl From<Metric> for String {
    fn from(m: Metric) -> Self {
        m.to_string()
    }
}

impl TryFrom<String> for Metric {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Statistics of one metric within one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    #[serde(flatten)]
    pub key: SummaryKey,
    pub metric: Metric,
    /// Items in the group, regardless of whether this metric was defined.
    pub n_items: usize,
    /// Fraction of items in the group that passed structural validation.
    pub structural_pass_rate: f64,
    #[serde(flatten)]
    pub stats: MeanInterval,
}

/// Compute every group summary for `items`.
///
/// Output order is stable: groups in key order, then the semantic metric,
/// then raters alphabetically.
pub fn aggregate(items: &[ScoredItem]) -> Vec<GroupSummary> {
    let mut groups: BTreeMap<SummaryKey, Vec<&ScoredItem>> = BTreeMap::new();
    for item in items {
        groups.entry(item.group.summary_key()).or_default().push(item);
    }

    let mut out = Vec::new();
    for (key, mut members) in groups {
        members.sort_by(|a, b| {
            a.item_id
                .cmp(&b.item_id)
                .then(a.row_index.cmp(&b.row_index))
        });

        let n_items = members.len();
        let passed = members.iter().filter(|i| i.structural_valid).count();
        let structural_pass_rate = passed as f64 / n_items as f64;

        let raters: BTreeSet<&str> = members
            .iter()
            .flat_map(|i| i.judge_verdicts.keys().map(String::as_str))
            .collect();

        let metrics = std::iter::once(Metric::Semantic)
            .chain(raters.into_iter().map(|r| Metric::Judge(r.to_string())));

        for metric in metrics {
            let values: Vec<f64> = members.iter().filter_map(|i| metric.value(i)).collect();
            out.push(GroupSummary {
                key: key.clone(),
                metric,
                n_items,
                structural_pass_rate,
                stats: mean_interval(&values, 0.0, 1.0),
            });
        }
    }
    out
}
