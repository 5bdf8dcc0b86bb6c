//! Inter-rater reliability: percent agreement, Cohen's kappa, Gwet's AC1.
//!
//! Kappa takes chance agreement from each rater's own marginal label
//! distribution; AC1 takes it from the pooled distribution. The two are on
//! different scales and are reported side by side, never combined.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{ItemType, ScoredItem, Verdict};
use crate::statistics::{wilson_interval, Z_95};

/// Agreement statistics for one set of rating pairs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Agreement {
    pub n: usize,
    pub percent_agreement: f64,
    /// Wilson interval around `percent_agreement`.
    pub ci_low: f64,
    pub ci_high: f64,
    pub kappa: f64,
    pub ac1: f64,
}

/// Agreement between two raters, optionally within one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityRecord {
    pub rater_a: String,
    pub rater_b: String,
    pub item_type: ItemType,
    /// Category value when grouped (e.g. a topic); `None` for overall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(flatten)]
    pub agreement: Agreement,
}

/// Agreement between two aligned rating sequences over `classes`.
///
/// Positions where either rating is missing, an error, or outside
/// `classes` are skipped.
pub fn reliability(
    ratings_a: &[Option<Verdict>],
    ratings_b: &[Option<Verdict>],
    classes: &[Verdict],
) -> Agreement {
    let pairs: Vec<(Verdict, Verdict)> = ratings_a
        .iter()
        .zip(ratings_b)
        .filter_map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) if classes.contains(a) && classes.contains(b) => Some((*a, *b)),
            _ => None,
        })
        .collect();
    agreement(&pairs, classes)
}

fn agreement(pairs: &[(Verdict, Verdict)], classes: &[Verdict]) -> Agreement {
    let n = pairs.len();
    if n == 0 {
        return Agreement {
            n: 0,
            percent_agreement: 0.0,
            ci_low: 0.0,
            ci_high: 0.0,
            kappa: 0.0,
            ac1: 0.0,
        };
    }
    let n_f = n as f64;

    let agreed = pairs.iter().filter(|(a, b)| a == b).count();
    let po = agreed as f64 / n_f;
    let (ci_low, ci_high) = wilson_interval(agreed as u64, n as u64, Z_95);

    let mut count_a: BTreeMap<Verdict, usize> = BTreeMap::new();
    let mut count_b: BTreeMap<Verdict, usize> = BTreeMap::new();
    for (a, b) in pairs {
        *count_a.entry(*a).or_default() += 1;
        *count_b.entry(*b).or_default() += 1;
    }
    let share = |m: &BTreeMap<Verdict, usize>, c: &Verdict| {
        m.get(c).copied().unwrap_or(0) as f64 / n_f
    };

    // Cohen: product of independent marginals.
    let pe_kappa: f64 = classes
        .iter()
        .map(|c| share(&count_a, c) * share(&count_b, c))
        .sum();
    let kappa = if (1.0 - pe_kappa).abs() < f64::EPSILON {
        0.0
    } else {
        (po - pe_kappa) / (1.0 - pe_kappa)
    };

    // Gwet: pooled marginals, nominal variant.
    let q = classes.len();
    let pe_ac1 = if q < 2 {
        0.0
    } else {
        classes
            .iter()
            .map(|c| {
                let pi = (share(&count_a, c) + share(&count_b, c)) / 2.0;
                pi * (1.0 - pi)
            })
            .sum::<f64>()
            / (q - 1) as f64
    };
    let ac1 = if (1.0 - pe_ac1).abs() < f64::EPSILON {
        0.0
    } else {
        (po - pe_ac1) / (1.0 - pe_ac1)
    };

    Agreement {
        n,
        percent_agreement: po,
        ci_low,
        ci_high,
        kappa,
        ac1,
    }
}

/// Usable label of `rater` on `item`.
fn label(item: &ScoredItem, rater: &str) -> Option<Verdict> {
    item.judge_verdicts
        .get(rater)
        .filter(|v| !v.is_error())
        .map(|v| v.verdict)
}

/// Agreement of `rater_a` and `rater_b` on `items` of `item_type`, overall
/// or per category of `group_by`.
pub fn pairwise<F>(
    items: &[ScoredItem],
    rater_a: &str,
    rater_b: &str,
    item_type: ItemType,
    group_by: Option<F>,
) -> Vec<ReliabilityRecord>
where
    F: Fn(&ScoredItem) -> String,
{
    let mut buckets: BTreeMap<Option<String>, (Vec<Option<Verdict>>, Vec<Option<Verdict>>)> =
        BTreeMap::new();
    for item in items.iter().filter(|i| i.group.item_type == item_type) {
        let key = group_by.as_ref().map(|f| f(item));
        let (a, b) = buckets.entry(key).or_default();
        a.push(label(item, rater_a));
        b.push(label(item, rater_b));
    }

    buckets
        .into_iter()
        .map(|(group, (a, b))| ReliabilityRecord {
            rater_a: rater_a.to_string(),
            rater_b: rater_b.to_string(),
            item_type,
            group,
            agreement: reliability(&a, &b, item_type.classes()),
        })
        .collect()
}

/// Reliability for every rater pair and item type present in `items`, once
/// overall and once per topic.
pub fn reliability_report(items: &[ScoredItem]) -> Vec<ReliabilityRecord> {
    let raters: BTreeSet<&str> = items
        .iter()
        .flat_map(|i| i.judge_verdicts.keys().map(String::as_str))
        .collect();
    let raters: Vec<&str> = raters.into_iter().collect();
    let item_types: BTreeSet<ItemType> = items.iter().map(|i| i.group.item_type).collect();

    let mut out = Vec::new();
    for (i, a) in raters.iter().enumerate() {
        for b in &raters[i + 1..] {
            for &t in &item_types {
                out.extend(pairwise(items, a, b, t, None::<fn(&ScoredItem) -> String>));
                out.extend(pairwise(items, a, b, t, Some(|it: &ScoredItem| it.group.topic.clone())));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureKind, GroupKey, JudgeVerdict};
    use Verdict::*;

    const MCQ: &[Verdict] = &[Correct, Ambiguous, Incorrect];
    const FILL: &[Verdict] = &[Acceptable, Unacceptable];

    fn some(v: &[Verdict]) -> Vec<Option<Verdict>> {
        v.iter().copied().map(Some).collect()
    }

    #[test]
    fn perfect_agreement() {
        let a = some(&[Correct, Incorrect, Ambiguous, Correct]);
        let r = reliability(&a, &a, MCQ);
        assert_eq!(r.n, 4);
        assert_eq!(r.percent_agreement, 1.0);
        assert!((r.kappa - 1.0).abs() < 1e-12);
        assert!((r.ac1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn perfect_agreement_single_class_kappa_is_zero() {
        let a = some(&[Correct, Correct, Correct]);
        let r = reliability(&a, &a, MCQ);
        assert_eq!(r.percent_agreement, 1.0);
        assert_eq!(r.kappa, 0.0);
        assert!((r.ac1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn two_class_known_values() {
        // a: A A A U U, b: A A U U U
        let a = some(&[Acceptable, Acceptable, Acceptable, Unacceptable, Unacceptable]);
        let b = some(&[Acceptable, Acceptable, Unacceptable, Unacceptable, Unacceptable]);
        let r = reliability(&a, &b, FILL);
        assert!((r.percent_agreement - 0.8).abs() < 1e-12);
        // pe = 0.6*0.4 + 0.4*0.6 = 0.48; kappa = 0.32 / 0.52
        assert!((r.kappa - 0.32 / 0.52).abs() < 1e-12);
        // pooled pi = 0.5 each; pe = 2 * 0.25 / 1 = 0.5; ac1 = 0.3 / 0.5
        assert!((r.ac1 - 0.6).abs() < 1e-12);
        assert!(r.ci_low < 0.8 && r.ci_high > 0.8);
    }

    #[test]
    fn skewed_labels_keep_ac1_high() {
        let mut a = vec![Acceptable; 19];
        a.push(Unacceptable);
        let mut b = vec![Acceptable; 19];
        b.push(Acceptable);
        let r = reliability(&some(&a), &some(&b), FILL);
        assert!((r.percent_agreement - 0.95).abs() < 1e-12);
        assert!(r.kappa.abs() < 1e-12);
        assert!(r.ac1 > 0.9);
    }

    #[test]
    fn missing_and_foreign_labels_are_skipped() {
        let a = vec![Some(Correct), None, Some(Acceptable), Some(Incorrect)];
        let b = vec![Some(Correct), Some(Correct), Some(Correct), Some(Correct)];
        let r = reliability(&a, &b, MCQ);
        assert_eq!(r.n, 2);
        assert!((r.percent_agreement - 0.5).abs() < 1e-12);
    }

    #[test]
    fn empty_input() {
        let r = reliability(&[], &[], MCQ);
        assert_eq!(r.n, 0);
        assert_eq!(r.kappa, 0.0);
        assert_eq!(r.ci_high, 0.0);
    }

    fn item(id: &str, topic: &str, ratings: &[(&str, Verdict)]) -> ScoredItem {
        ScoredItem {
            item_id: id.into(),
            row_index: 0,
            group: GroupKey {
                configuration: "cot".into(),
                topic: topic.into(),
                item_type: ItemType::Mcq,
                seed: 0,
                source_hash: id.into(),
            },
            structural_valid: true,
            semantic_score: 0.5,
            judge_verdicts: ratings
                .iter()
                .map(|(r, v)| (r.to_string(), JudgeVerdict::ok(*r, *v, "", "")))
                .collect(),
        }
    }

    #[test]
    fn grouped_by_topic_uses_same_formula() {
        let items = vec![
            item("1", "Passive", &[("claude", Correct), ("gemini", Correct)]),
            item("2", "Passive", &[("claude", Incorrect), ("gemini", Incorrect)]),
            item("3", "Tenses", &[("claude", Correct), ("gemini", Incorrect)]),
            item("4", "Tenses", &[("claude", Ambiguous), ("gemini", Ambiguous)]),
        ];
        let overall = pairwise(&items, "claude", "gemini", ItemType::Mcq, None::<fn(&ScoredItem) -> String>);
        assert_eq!(overall.len(), 1);
        assert!((overall[0].agreement.percent_agreement - 0.75).abs() < 1e-12);

        let by_topic = pairwise(
            &items,
            "claude",
            "gemini",
            ItemType::Mcq,
            Some(|i: &ScoredItem| i.group.topic.clone()),
        );
        assert_eq!(by_topic.len(), 2);
        assert_eq!(by_topic[0].group.as_deref(), Some("Passive"));
        assert_eq!(by_topic[0].agreement.percent_agreement, 1.0);
        assert!((by_topic[1].agreement.percent_agreement - 0.5).abs() < 1e-12);
    }

    #[test]
    fn report_covers_every_rater_pair() {
        let mut bad = item("2", "Passive", &[("claude", Correct), ("gemini", Correct)]);
        bad.judge_verdicts.insert(
            "deepseek".into(),
            JudgeVerdict::error("deepseek", FailureKind::Transport, "timeout", ""),
        );
        let items = vec![
            item("1", "Passive", &[("claude", Correct), ("gemini", Correct), ("deepseek", Correct)]),
            bad,
        ];
        let out = reliability_report(&items);
        // 3 pairs x (overall + 1 topic)
        assert_eq!(out.len(), 6);
        let cd = out
            .iter()
            .find(|r| r.rater_a == "claude" && r.rater_b == "deepseek" && r.group.is_none())
            .unwrap();
        assert_eq!(cd.agreement.n, 1);
    }
}
