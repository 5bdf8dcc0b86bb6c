//! The `judgekit judge` command.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use judgekit_core::checkpoint::ResumeStore;
use judgekit_core::engine::{JudgeEngine, ProgressReporter};
use judgekit_core::model::{JudgeTask, ScoredItem};
use judgekit_providers::config::load_config_from;
use judgekit_providers::ClientRegistry;

pub struct JudgeArgs {
    pub tasks: PathBuf,
    pub run_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub resume: bool,
    pub start_index: usize,
    pub limit: Option<usize>,
}

/// Console progress reporter.
struct ConsoleReporter;

impl ProgressReporter for ConsoleReporter {
    fn on_run_start(&self, pending: usize, skipped: usize) {
        if skipped > 0 {
            eprintln!("Resuming: {skipped} task(s) already judged, {pending} pending");
        } else {
            eprintln!("Judging {pending} task(s)");
        }
    }

    fn on_unit_complete(&self, rows: &[ScoredItem], done: usize, pending: usize) {
        let errors: usize = rows
            .iter()
            .map(|r| r.judge_verdicts.values().filter(|v| v.is_error()).count())
            .sum();
        eprintln!("  Committed {done}/{pending} ({errors} error verdict(s) in this unit)");
    }

    fn on_unit_failed(&self, rows: &Range<u64>, error: &str) {
        eprintln!("  FAILED rows {}..{}: {error}", rows.start, rows.end);
    }
}

/// Read one `JudgeTask` per non-empty line.
pub fn read_tasks(path: &Path) -> Result<Vec<JudgeTask>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tasks: {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<JudgeTask>(line)
                .with_context(|| format!("{}:{}: invalid task", path.display(), n + 1))
        })
        .collect()
}

pub async fn execute(args: JudgeArgs) -> Result<()> {
    let config = load_config_from(args.config.as_deref())?;
    config
        .validate_preconditions()
        .context("precondition check failed, nothing was sent to any provider")?;

    let tasks = read_tasks(&args.tasks)?;
    anyhow::ensure!(!tasks.is_empty(), "no tasks in {}", args.tasks.display());

    let registry = ClientRegistry::new();
    let raters = registry.raters(&config)?;

    let mut engine_config = config.engine_config();
    engine_config.start_index = args.start_index;
    engine_config.limit = args.limit;
    let engine = JudgeEngine::new(raters, engine_config);

    let mut store = if args.resume {
        ResumeStore::open(&args.run_dir)
    } else {
        ResumeStore::fresh(&args.run_dir)
    }
    .with_context(|| format!("failed to open run directory {}", args.run_dir.display()))?;

    eprintln!(
        "judgekit v{}: run {} with raters {:?}",
        env!("CARGO_PKG_VERSION"),
        store.run_id(),
        engine.rater_ids()
    );

    let report = engine.run(&tasks, &mut store, &ConsoleReporter).await?;

    print_summary(store.rows());

    let report_path = args.run_dir.join("judge_run.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("failed to write {}", report_path.display()))?;
    eprintln!(
        "\nJudged {} task(s), {} partially, skipped {}, {} failed unit(s) ({:.1}s). Run summary: {}",
        report.judged,
        report.partial,
        report.skipped,
        report.failed_units.len(),
        report.duration_ms as f64 / 1000.0,
        report_path.display()
    );

    if !report.failed_units.is_empty() {
        eprintln!("Re-run the same command to retry the failed raters; verdicts already committed are kept.");
    }
    Ok(())
}

/// Verdict label counts per rater over every committed row.
fn print_summary(rows: &[ScoredItem]) {
    use comfy_table::{Cell, Table};

    let mut counts: BTreeMap<&str, BTreeMap<&'static str, usize>> = BTreeMap::new();
    for row in rows {
        for (rater, verdict) in &row.judge_verdicts {
            *counts
                .entry(rater.as_str())
                .or_default()
                .entry(verdict.verdict.as_str())
                .or_default() += 1;
        }
    }

    let mut table = Table::new();
    table.set_header(vec!["Rater", "Rows", "Verdicts", "Errors"]);
    for (rater, labels) in &counts {
        let total: usize = labels.values().sum();
        let errors = labels.get("error").copied().unwrap_or(0);
        let verdicts = labels
            .iter()
            .filter(|(label, _)| **label != "error")
            .map(|(label, n)| format!("{label}={n}"))
            .collect::<Vec<_>>()
            .join(" ");
        table.add_row(vec![
            Cell::new(rater),
            Cell::new(total),
            Cell::new(verdicts),
            Cell::new(format!("{errors} ({:.1}%)", errors as f64 * 100.0 / total.max(1) as f64)),
        ]);
    }

    eprintln!("\n{table}");
}
