//! Paired A/B comparison between two generation configurations.
//!
//! Items are matched on (source hash, topic, item type, seed). For every
//! matched pair the per-configuration metric mean is taken and the delta is
//! `candidate - baseline`. Deltas feed a normal-approximation CI and a
//! win/loss tally tested with the exact binomial.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aggregate::Metric;
use crate::error::CompareError;
use crate::model::{PairKey, ScoredItem};
use crate::statistics::{
    binomial_two_sided_p, classify_delta, mean, mean_interval, wilson_interval, Outcome, Z_95,
};

/// Deltas with |d| at or below this are float noise.
pub const TIE_EPSILON: f64 = 1e-12;

/// A semantic delta must exceed this to break a judge tie.
pub const SEMANTIC_TIEBREAK_EPSILON: f64 = 1e-6;

/// How a judge tie is resolved when deciding a pair's winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// A judge tie stays a tie.
    #[default]
    JudgeOnly,
    /// A judge tie is broken by the semantic delta when it is large enough.
    JudgeWithSemanticTiebreak,
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TieBreak::JudgeOnly => write!(f, "judge-only"),
            TieBreak::JudgeWithSemanticTiebreak => write!(f, "judge-with-semantic-tiebreak"),
        }
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "judge-only" | "judge_only" => Ok(TieBreak::JudgeOnly),
            "judge-with-semantic-tiebreak" | "judge_with_semantic_tiebreak" | "semantic" => {
                Ok(TieBreak::JudgeWithSemanticTiebreak)
            }
            other => Err(format!("unknown tiebreak strategy: {other}")),
        }
    }
}

/// Delta statistics of one metric over matched pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairedDelta {
    pub metric: Metric,
    pub baseline: String,
    pub candidate: String,
    pub n_pairs: usize,
    pub delta_mean: f64,
    pub delta_std: f64,
    pub delta_se: f64,
    pub ci95_low: f64,
    pub ci95_high: f64,
    pub half_width: f64,
    pub precision_target: f64,
    pub meets_precision_target: bool,
    /// The CI excludes zero.
    pub significant: bool,
}

/// Win/loss tally of the candidate against the baseline for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinLossRecord {
    pub metric: Metric,
    pub strategy: TieBreak,
    pub n_pairs: usize,
    pub wins: u64,
    pub losses: u64,
    pub ties: u64,
    /// wins + losses
    pub n_effective: u64,
    pub win_rate: f64,
    pub binomial_p: f64,
}

/// Win/loss counted only where every rater picks the same winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusWinLossRecord {
    pub raters: Vec<String>,
    pub strategy: TieBreak,
    pub n_pairs: usize,
    pub n_effective: u64,
    /// Fraction of pairs that did not count as a win or loss.
    pub drop_rate: f64,
    pub wins: u64,
    pub losses: u64,
    pub ties_or_abstained: u64,
    pub win_rate: f64,
    /// Wilson interval around `win_rate`.
    pub ci95_low: f64,
    pub ci95_high: f64,
    pub binomial_p: f64,
}

/// Everything `compare` produces for one baseline/candidate pairing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub deltas: Vec<PairedDelta>,
    pub win_loss: Vec<WinLossRecord>,
}

/// Compares a candidate configuration against a baseline.
#[derive(Debug, Clone)]
pub struct PairedComparator {
    pub baseline: String,
    pub candidate: String,
    /// Maximum CI half-width for the semantic metric.
    pub semantic_target: f64,
    /// Maximum CI half-width for judge metrics.
    pub judge_target: f64,
    pub tiebreak: TieBreak,
}

/// Per-configuration metric means of one matched pair.
struct Pair<'a> {
    baseline: Vec<&'a ScoredItem>,
    candidate: Vec<&'a ScoredItem>,
}

impl Pair<'_> {
    fn delta(&self, metric: &Metric) -> Option<f64> {
        let side = |items: &[&ScoredItem]| -> Option<f64> {
            let values: Vec<f64> = items.iter().filter_map(|i| metric.value(i)).collect();
            if values.is_empty() {
                None
            } else {
                Some(mean(&values))
            }
        };
        Some(side(&self.candidate)? - side(&self.baseline)?)
    }
}

impl PairedComparator {
    pub fn new(baseline: impl Into<String>, candidate: impl Into<String>) -> Self {
        Self {
            baseline: baseline.into(),
            candidate: candidate.into(),
            semantic_target: 0.04,
            judge_target: 0.05,
            tiebreak: TieBreak::default(),
        }
    }

    pub fn with_targets(mut self, semantic: f64, judge: f64) -> Self {
        self.semantic_target = semantic;
        self.judge_target = judge;
        self
    }

    pub fn with_tiebreak(mut self, tiebreak: TieBreak) -> Self {
        self.tiebreak = tiebreak;
        self
    }

    fn check(&self, items: &[ScoredItem]) -> Result<(), CompareError> {
        if self.baseline == self.candidate {
            return Err(CompareError::SameConfiguration(self.baseline.clone()));
        }
        for config in [&self.baseline, &self.candidate] {
            if !items.iter().any(|i| &i.group.configuration == config) {
                return Err(CompareError::MissingConfiguration(config.clone()));
            }
        }
        Ok(())
    }

    /// Matched pairs in key order. Keys present in only one configuration
    /// are dropped.
    fn pairs<'a>(&self, items: &'a [ScoredItem]) -> BTreeMap<PairKey, Pair<'a>> {
        let mut pairs: BTreeMap<PairKey, Pair<'a>> = BTreeMap::new();
        let mut sorted: Vec<&ScoredItem> = items.iter().collect();
        sorted.sort_by(|a, b| a.item_id.cmp(&b.item_id).then(a.row_index.cmp(&b.row_index)));

        for item in sorted {
            let is_base = item.group.configuration == self.baseline;
            let is_cand = item.group.configuration == self.candidate;
            if !is_base && !is_cand {
                continue;
            }
            let pair = pairs.entry(item.group.pair_key()).or_insert_with(|| Pair {
                baseline: Vec::new(),
                candidate: Vec::new(),
            });
            if is_base {
                pair.baseline.push(item);
            } else {
                pair.candidate.push(item);
            }
        }
        pairs.retain(|_, p| !p.baseline.is_empty() && !p.candidate.is_empty());
        pairs
    }

    fn target_for(&self, metric: &Metric) -> f64 {
        match metric {
            Metric::Semantic => self.semantic_target,
            _ => self.judge_target,
        }
    }

    /// Decide one pair for a judge metric under the configured tie-break.
    fn judge_outcome(&self, pair: &Pair<'_>, metric: &Metric) -> Option<Outcome> {
        let outcome = classify_delta(pair.delta(metric)?, TIE_EPSILON);
        if outcome != Outcome::Tie || self.tiebreak == TieBreak::JudgeOnly {
            return Some(outcome);
        }
        match pair.delta(&Metric::Semantic) {
            Some(d) => Some(classify_delta(d, SEMANTIC_TIEBREAK_EPSILON)),
            None => Some(Outcome::Tie),
        }
    }

    /// Paired deltas and win/loss for the semantic metric, the judge mean
    /// and every rater seen in the matched items.
    pub fn compare(&self, items: &[ScoredItem]) -> Result<Comparison, CompareError> {
        self.check(items)?;
        let pairs = self.pairs(items);

        let raters: BTreeSet<&str> = pairs
            .values()
            .flat_map(|p| p.baseline.iter().chain(p.candidate.iter()))
            .flat_map(|i| i.judge_verdicts.keys().map(String::as_str))
            .collect();
        let metrics: Vec<Metric> = [Metric::Semantic, Metric::JudgeMean]
            .into_iter()
            .chain(raters.into_iter().map(|r| Metric::Judge(r.to_string())))
            .collect();

        let mut out = Comparison::default();
        for metric in metrics {
            let deltas: Vec<f64> = pairs.values().filter_map(|p| p.delta(&metric)).collect();
            out.deltas.push(self.delta_stats(metric.clone(), &deltas));

            let outcomes: Vec<Outcome> = pairs
                .values()
                .filter_map(|p| match metric {
                    Metric::Semantic => p.delta(&metric).map(|d| classify_delta(d, TIE_EPSILON)),
                    _ => self.judge_outcome(p, &metric),
                })
                .collect();
            out.win_loss.push(self.tally(metric, &outcomes));
        }
        Ok(out)
    }

    fn delta_stats(&self, metric: Metric, deltas: &[f64]) -> PairedDelta {
        let stats = mean_interval(deltas, -1.0, 1.0);
        let precision_target = self.target_for(&metric);
        let half_width = stats.half_width();
        PairedDelta {
            metric,
            baseline: self.baseline.clone(),
            candidate: self.candidate.clone(),
            n_pairs: stats.n,
            delta_mean: stats.mean,
            delta_std: stats.std,
            delta_se: stats.se,
            ci95_low: stats.ci95_low,
            ci95_high: stats.ci95_high,
            half_width,
            precision_target,
            meets_precision_target: stats.n > 0 && half_width <= precision_target,
            significant: stats.n > 1 && stats.excludes_zero(),
        }
    }

    fn tally(&self, metric: Metric, outcomes: &[Outcome]) -> WinLossRecord {
        let count = |o: Outcome| outcomes.iter().filter(|x| **x == o).count() as u64;
        let (wins, losses, ties) = (count(Outcome::Win), count(Outcome::Loss), count(Outcome::Tie));
        let n_effective = wins + losses;
        WinLossRecord {
            strategy: match metric {
                Metric::Semantic => TieBreak::JudgeOnly,
                _ => self.tiebreak,
            },
            metric,
            n_pairs: outcomes.len(),
            wins,
            losses,
            ties,
            n_effective,
            win_rate: rate(wins, n_effective),
            binomial_p: binomial_two_sided_p(wins, losses),
        }
    }

    /// Consensus win/loss across `raters`.
    ///
    /// A pair is a win or loss only when every rater reaches that same
    /// decision. A missing or errored rater, a split decision, or a shared
    /// tie leaves the pair out of the effective count.
    pub fn consensus(
        &self,
        items: &[ScoredItem],
        raters: &[String],
    ) -> Result<ConsensusWinLossRecord, CompareError> {
        if raters.len() < 2 {
            return Err(CompareError::TooFewRaters(raters.len()));
        }
        self.check(items)?;
        let pairs = self.pairs(items);

        let (mut wins, mut losses, mut other) = (0u64, 0u64, 0u64);
        for pair in pairs.values() {
            let decisions: Option<Vec<Outcome>> = raters
                .iter()
                .map(|r| self.judge_outcome(pair, &Metric::Judge(r.clone())))
                .collect();
            match decisions.as_deref() {
                Some([first, rest @ ..]) if rest.iter().all(|d| d == first) => match first {
                    Outcome::Win => wins += 1,
                    Outcome::Loss => losses += 1,
                    Outcome::Tie => other += 1,
                },
                _ => other += 1,
            }
        }

        let n_pairs = pairs.len();
        let n_effective = wins + losses;
        let (ci95_low, ci95_high) = wilson_interval(wins, n_effective, Z_95);
        Ok(ConsensusWinLossRecord {
            raters: raters.to_vec(),
            strategy: self.tiebreak,
            n_pairs,
            n_effective,
            drop_rate: rate(other, n_pairs as u64),
            wins,
            losses,
            ties_or_abstained: other,
            win_rate: rate(wins, n_effective),
            ci95_low,
            ci95_high,
            binomial_p: binomial_two_sided_p(wins, losses),
        })
    }
}

fn rate(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailureKind, GroupKey, ItemType, JudgeVerdict, Verdict};

    fn scored(config: &str, source: &str, semantic: f64, verdicts: &[(&str, Verdict)]) -> ScoredItem {
        ScoredItem {
            item_id: format!("{config}-{source}"),
            row_index: 0,
            group: GroupKey {
                configuration: config.into(),
                topic: "Reported Speech".into(),
                item_type: ItemType::Mcq,
                seed: 0,
                source_hash: source.into(),
            },
            structural_valid: true,
            semantic_score: semantic,
            judge_verdicts: verdicts
                .iter()
                .map(|(r, v)| (r.to_string(), JudgeVerdict::ok(*r, *v, "", "")))
                .collect(),
        }
    }

    fn comparator() -> PairedComparator {
        PairedComparator::new("minimal", "cot")
    }

    fn record<'a>(c: &'a Comparison, metric: &Metric) -> (&'a PairedDelta, &'a WinLossRecord) {
        (
            c.deltas.iter().find(|d| &d.metric == metric).unwrap(),
            c.win_loss.iter().find(|w| &w.metric == metric).unwrap(),
        )
    }

    #[test]
    fn eight_wins_two_losses() {
        let mut items = Vec::new();
        for i in 0..10 {
            let src = format!("s{i}");
            let cand = if i < 8 { 0.9 } else { 0.1 };
            items.push(scored("minimal", &src, 0.5, &[]));
            items.push(scored("cot", &src, cand, &[]));
        }
        let c = comparator().compare(&items).unwrap();
        let (delta, wl) = record(&c, &Metric::Semantic);
        assert_eq!(delta.n_pairs, 10);
        assert_eq!((wl.wins, wl.losses, wl.ties), (8, 2, 0));
        assert!((wl.win_rate - 0.8).abs() < 1e-12);
        assert!((wl.binomial_p - 0.109375).abs() < 1e-9);
    }

    #[test]
    fn unmatched_sources_are_excluded() {
        let items = vec![
            scored("minimal", "shared", 0.4, &[]),
            scored("cot", "shared", 0.6, &[]),
            scored("minimal", "only-base", 0.9, &[]),
            scored("cot", "only-cand", 0.0, &[]),
            scored("other", "shared", 0.0, &[]),
        ];
        let c = comparator().compare(&items).unwrap();
        let (delta, _) = record(&c, &Metric::Semantic);
        assert_eq!(delta.n_pairs, 1);
        assert!((delta.delta_mean - 0.2).abs() < 1e-12);
        assert_eq!(delta.delta_se, 0.0);
        assert!(!delta.significant);
    }

    #[test]
    fn significance_and_precision() {
        let mut items = Vec::new();
        for i in 0..40 {
            let src = format!("s{i}");
            let jitter = (i % 4) as f64 * 0.01;
            items.push(scored("minimal", &src, 0.5, &[]));
            items.push(scored("cot", &src, 0.6 + jitter, &[]));
        }
        let c = comparator().compare(&items).unwrap();
        let (delta, _) = record(&c, &Metric::Semantic);
        assert!(delta.significant);
        assert!(delta.meets_precision_target);
        assert!(delta.ci95_low > 0.0 && delta.ci95_high <= 1.0);
        assert!((delta.half_width - (delta.ci95_high - delta.ci95_low) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn float_noise_is_a_tie() {
        let items = vec![
            scored("minimal", "a", 0.3, &[]),
            scored("cot", "a", 0.1 + 0.2, &[]),
        ];
        let c = comparator().compare(&items).unwrap();
        let (_, wl) = record(&c, &Metric::Semantic);
        assert_eq!(wl.ties, 1);
        assert_eq!(wl.n_effective, 0);
        assert_eq!(wl.win_rate, 0.0);
        assert_eq!(wl.binomial_p, 1.0);
    }

    #[test]
    fn semantic_tiebreak_only_under_named_strategy() {
        let items = vec![
            scored("minimal", "a", 0.2, &[("claude", Verdict::Correct)]),
            scored("cot", "a", 0.8, &[("claude", Verdict::Correct)]),
        ];
        let judge = Metric::Judge("claude".into());

        let plain = comparator().compare(&items).unwrap();
        assert_eq!(record(&plain, &judge).1.ties, 1);

        let tb = comparator()
            .with_tiebreak(TieBreak::JudgeWithSemanticTiebreak)
            .compare(&items)
            .unwrap();
        let (_, wl) = record(&tb, &judge);
        assert_eq!((wl.wins, wl.ties), (1, 0));
        assert_eq!(wl.strategy, TieBreak::JudgeWithSemanticTiebreak);
    }

    #[test]
    fn consensus_abstains_on_disagreement() {
        let items = vec![
            // both raters prefer cot
            scored("minimal", "a", 0.5, &[("claude", Verdict::Incorrect), ("gemini", Verdict::Incorrect)]),
            scored("cot", "a", 0.5, &[("claude", Verdict::Correct), ("gemini", Verdict::Correct)]),
            // claude prefers cot, gemini prefers minimal
            scored("minimal", "b", 0.5, &[("claude", Verdict::Incorrect), ("gemini", Verdict::Correct)]),
            scored("cot", "b", 0.5, &[("claude", Verdict::Correct), ("gemini", Verdict::Incorrect)]),
        ];
        let raters = vec!["claude".to_string(), "gemini".to_string()];
        let rec = comparator().consensus(&items, &raters).unwrap();
        assert_eq!(rec.n_pairs, 2);
        assert_eq!((rec.wins, rec.losses, rec.ties_or_abstained), (1, 0, 1));
        assert_eq!(rec.n_effective, 1);
        assert!((rec.drop_rate - 0.5).abs() < 1e-12);
        assert_eq!(rec.win_rate, 1.0);
        assert!(rec.ci95_low > 0.0 && rec.ci95_high > 0.999);
    }

    #[test]
    fn consensus_abstains_on_missing_or_error_rater() {
        let mut cand = scored("cot", "a", 0.5, &[("claude", Verdict::Correct)]);
        cand.judge_verdicts.insert(
            "gemini".into(),
            JudgeVerdict::error("gemini", FailureKind::MissingResult, "empty slot", ""),
        );
        let items = vec![
            scored("minimal", "a", 0.5, &[("claude", Verdict::Incorrect), ("gemini", Verdict::Incorrect)]),
            cand,
        ];
        let raters = vec!["claude".to_string(), "gemini".to_string()];
        let rec = comparator().consensus(&items, &raters).unwrap();
        assert_eq!(rec.ties_or_abstained, 1);
        assert_eq!(rec.n_effective, 0);
        assert_eq!(rec.drop_rate, 1.0);
        assert_eq!((rec.ci95_low, rec.ci95_high), (0.0, 0.0));
    }

    #[test]
    fn consensus_needs_two_raters() {
        let items = vec![scored("minimal", "a", 0.5, &[]), scored("cot", "a", 0.5, &[])];
        assert_eq!(
            comparator().consensus(&items, &["claude".to_string()]),
            Err(CompareError::TooFewRaters(1))
        );
    }

    #[test]
    fn configuration_checks() {
        let items = vec![scored("minimal", "a", 0.5, &[])];
        assert_eq!(
            PairedComparator::new("cot", "cot").compare(&items),
            Err(CompareError::SameConfiguration("cot".into()))
        );
        assert_eq!(
            comparator().compare(&items),
            Err(CompareError::MissingConfiguration("cot".into()))
        );
    }

    #[test]
    fn tiebreak_parse() {
        assert_eq!("judge-only".parse::<TieBreak>().unwrap(), TieBreak::JudgeOnly);
        assert_eq!(
            "judge-with-semantic-tiebreak".parse::<TieBreak>().unwrap(),
            TieBreak::JudgeWithSemanticTiebreak
        );
        assert_eq!(TieBreak::JudgeWithSemanticTiebreak.to_string(), "judge-with-semantic-tiebreak");
        assert!("coin-flip".parse::<TieBreak>().is_err());
    }
}
