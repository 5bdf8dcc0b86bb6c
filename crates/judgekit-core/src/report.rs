//! Run report: every derived record set for one run, with JSON persistence,
//! append-only JSONL record files and a Markdown rendering.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{aggregate, GroupSummary};
use crate::checkpoint::append_jsonl;
use crate::error::CompareError;
use crate::model::ScoredItem;
use crate::paired::{ConsensusWinLossRecord, PairedComparator, PairedDelta, WinLossRecord};
use crate::reliability::{reliability_report, ReliabilityRecord};

/// Paired comparison section of a report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonSection {
    pub baseline: String,
    pub candidate: String,
    pub deltas: Vec<PairedDelta>,
    pub win_loss: Vec<WinLossRecord>,
    /// Present when at least two raters judged the items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusWinLossRecord>,
}

/// All statistics derived from one run's scored items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Scored items the statistics were computed from.
    pub n_items: usize,
    pub raters: Vec<String>,
    pub summaries: Vec<GroupSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonSection>,
    pub reliability: Vec<ReliabilityRecord>,
}

/// One derived record tagged with its run.
#[derive(Serialize)]
struct Keyed<'a, T: Serialize> {
    run_id: Uuid,
    #[serde(flatten)]
    record: &'a T,
}

impl RunReport {
    /// Recompute every statistic from `items`. Comparison is included when
    /// a comparator is given.
    pub fn build(
        run_id: Uuid,
        items: &[ScoredItem],
        comparator: Option<&PairedComparator>,
    ) -> Result<Self, CompareError> {
        let mut raters: Vec<String> = items
            .iter()
            .flat_map(|i| i.judge_verdicts.keys().cloned())
            .collect();
        raters.sort();
        raters.dedup();

        let comparison = match comparator {
            Some(c) => {
                let cmp = c.compare(items)?;
                let consensus = if raters.len() >= 2 {
                    Some(c.consensus(items, &raters)?)
                } else {
                    None
                };
                Some(ComparisonSection {
                    baseline: c.baseline.clone(),
                    candidate: c.candidate.clone(),
                    deltas: cmp.deltas,
                    win_loss: cmp.win_loss,
                    consensus,
                })
            }
            None => None,
        };

        Ok(Self {
            run_id,
            created_at: Utc::now(),
            n_items: items.len(),
            raters,
            summaries: aggregate(items),
            comparison,
            reliability: reliability_report(items),
        })
    }

    /// Save the report as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }

    /// Load a report from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report from {}", path.display()))?;
        let report: RunReport =
            serde_json::from_str(&content).context("failed to parse report JSON")?;
        Ok(report)
    }

    /// Append each record set to its own JSONL file under `dir`, every line
    /// tagged with the run id.
    pub fn append_records(&self, dir: &Path) -> Result<()> {
        fn write<T: Serialize>(dir: &Path, name: &str, run_id: Uuid, records: &[T]) -> Result<()> {
            let keyed: Vec<Keyed<'_, T>> = records.iter().map(|record| Keyed { run_id, record }).collect();
            let path = dir.join(name);
            append_jsonl(&path, &keyed).with_context(|| format!("failed to append {}", path.display()))
        }

        write(dir, "group_summaries.jsonl", self.run_id, &self.summaries)?;
        write(dir, "reliability.jsonl", self.run_id, &self.reliability)?;
        if let Some(c) = &self.comparison {
            write(dir, "paired_deltas.jsonl", self.run_id, &c.deltas)?;
            write(dir, "win_loss.jsonl", self.run_id, &c.win_loss)?;
            if let Some(consensus) = &c.consensus {
                write(dir, "consensus_win_loss.jsonl", self.run_id, std::slice::from_ref(consensus))?;
            }
        }
        Ok(())
    }

    /// Format the report as markdown.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str(&format!(
            "**Run:** {} ({} items, raters: {})\n\n",
            self.run_id,
            self.n_items,
            if self.raters.is_empty() {
                "none".to_string()
            } else {
                self.raters.join(", ")
            }
        ));

        if !self.summaries.is_empty() {
            md.push_str("### Group summaries\n\n");
            md.push_str("| Configuration | Topic | Type | Seed | Metric | n | Mean | 95% CI | Structural |\n");
            md.push_str("|---------------|-------|------|------|--------|---|------|--------|------------|\n");
            for s in &self.summaries {
                md.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} | {:.3} | [{:.3}, {:.3}] | {:.1}% |\n",
                    s.key.configuration,
                    s.key.topic,
                    s.key.item_type,
                    s.key.seed,
                    s.metric,
                    s.stats.n,
                    s.stats.mean,
                    s.stats.ci95_low,
                    s.stats.ci95_high,
                    s.structural_pass_rate * 100.0
                ));
            }
            md.push('\n');
        }

        if let Some(c) = &self.comparison {
            md.push_str(&format!("### {} vs {}\n\n", c.candidate, c.baseline));
            md.push_str("| Metric | Pairs | Delta | 95% CI | Half-width | Precise | Significant |\n");
            md.push_str("|--------|-------|-------|--------|------------|---------|-------------|\n");
            for d in &c.deltas {
                md.push_str(&format!(
                    "| {} | {} | {:+.3} | [{:+.3}, {:+.3}] | {:.3} | {} | {} |\n",
                    d.metric,
                    d.n_pairs,
                    d.delta_mean,
                    d.ci95_low,
                    d.ci95_high,
                    d.half_width,
                    yes_no(d.meets_precision_target),
                    yes_no(d.significant)
                ));
            }
            md.push('\n');

            md.push_str("| Metric | Wins | Losses | Ties | Win rate | p (exact) |\n");
            md.push_str("|--------|------|--------|------|----------|-----------|\n");
            for w in &c.win_loss {
                md.push_str(&format!(
                    "| {} | {} | {} | {} | {:.1}% | {:.4} |\n",
                    w.metric,
                    w.wins,
                    w.losses,
                    w.ties,
                    w.win_rate * 100.0,
                    w.binomial_p
                ));
            }
            md.push('\n');

            if let Some(k) = &c.consensus {
                md.push_str(&format!(
                    "**Consensus ({}, {}):** {} wins, {} losses, {} tied or abstained, win rate {:.1}% [{:.1}%, {:.1}%], drop rate {:.1}%, p = {:.4}\n\n",
                    k.raters.join(" + "),
                    k.strategy,
                    k.wins,
                    k.losses,
                    k.ties_or_abstained,
                    k.win_rate * 100.0,
                    k.ci95_low * 100.0,
                    k.ci95_high * 100.0,
                    k.drop_rate * 100.0,
                    k.binomial_p
                ));
            }
        }

        if !self.reliability.is_empty() {
            md.push_str("### Inter-rater reliability\n\n");
            md.push_str("| Raters | Type | Group | n | Agreement | 95% CI | Kappa | AC1 |\n");
            md.push_str("|--------|------|-------|---|-----------|--------|-------|-----|\n");
            for r in &self.reliability {
                let a = &r.agreement;
                md.push_str(&format!(
                    "| {} / {} | {} | {} | {} | {:.1}% | [{:.1}%, {:.1}%] | {:.3} | {:.3} |\n",
                    r.rater_a,
                    r.rater_b,
                    r.item_type,
                    r.group.as_deref().unwrap_or("all"),
                    a.n,
                    a.percent_agreement * 100.0,
                    a.ci_low * 100.0,
                    a.ci_high * 100.0,
                    a.kappa,
                    a.ac1
                ));
            }
        }

        md
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GroupKey, ItemType, JudgeVerdict, Verdict};

    fn item(config: &str, src: &str, semantic: f64, claude: Verdict, gemini: Verdict) -> ScoredItem {
        ScoredItem {
            item_id: format!("{config}-{src}"),
            row_index: 0,
            group: GroupKey {
                configuration: config.into(),
                topic: "Gerunds".into(),
                item_type: ItemType::Mcq,
                seed: 0,
                source_hash: src.into(),
            },
            structural_valid: true,
            semantic_score: semantic,
            judge_verdicts: [
                ("claude".to_string(), JudgeVerdict::ok("claude", claude, "", "")),
                ("gemini".to_string(), JudgeVerdict::ok("gemini", gemini, "", "")),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn items() -> Vec<ScoredItem> {
        vec![
            item("minimal", "a", 0.4, Verdict::Incorrect, Verdict::Ambiguous),
            item("cot", "a", 0.7, Verdict::Correct, Verdict::Correct),
            item("minimal", "b", 0.5, Verdict::Correct, Verdict::Correct),
            item("cot", "b", 0.6, Verdict::Correct, Verdict::Correct),
        ]
    }

    #[test]
    fn build_with_comparison() {
        let cmp = PairedComparator::new("minimal", "cot");
        let report = RunReport::build(Uuid::nil(), &items(), Some(&cmp)).unwrap();
        assert_eq!(report.raters, vec!["claude", "gemini"]);
        let section = report.comparison.as_ref().unwrap();
        let consensus = section.consensus.as_ref().unwrap();
        assert_eq!(consensus.wins, 1);
        assert_eq!(consensus.ties_or_abstained, 1);
        assert!(!report.reliability.is_empty());
    }

    #[test]
    fn build_without_comparison() {
        let report = RunReport::build(Uuid::nil(), &items(), None).unwrap();
        assert!(report.comparison.is_none());
        assert_eq!(report.summaries.len(), 6);
    }

    #[test]
    fn json_roundtrip() {
        let report = RunReport::build(Uuid::nil(), &items(), None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        report.save_json(&path).unwrap();
        let loaded = RunReport::load_json(&path).unwrap();

        assert_eq!(loaded.n_items, 4);
        assert_eq!(loaded.summaries, report.summaries);
    }

    #[test]
    fn records_are_appended_with_run_id() {
        let cmp = PairedComparator::new("minimal", "cot");
        let run_id = Uuid::new_v4();
        let report = RunReport::build(run_id, &items(), Some(&cmp)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        report.append_records(dir.path()).unwrap();
        report.append_records(dir.path()).unwrap();

        let text = std::fs::read_to_string(dir.path().join("consensus_win_loss.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(first["run_id"], run_id.to_string());
        assert_eq!(first["wins"], 1);
    }

    #[test]
    fn markdown_output() {
        let cmp = PairedComparator::new("minimal", "cot");
        let report = RunReport::build(Uuid::nil(), &items(), Some(&cmp)).unwrap();
        let md = report.to_markdown();
        assert!(md.contains("Group summaries"));
        assert!(md.contains("cot vs minimal"));
        assert!(md.contains("judge:claude"));
        assert!(md.contains("Inter-rater reliability"));
    }
}
