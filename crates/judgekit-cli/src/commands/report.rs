//! The `judgekit report` command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use judgekit_core::checkpoint::load_run;
use judgekit_core::paired::TieBreak;
use judgekit_core::report::RunReport;
use judgekit_providers::config::load_config_from;

pub fn execute(
    run_dir: PathBuf,
    baseline: Option<String>,
    candidate: Option<String>,
    tiebreak: Option<TieBreak>,
    format: String,
    config_path: Option<PathBuf>,
) -> Result<()> {
    anyhow::ensure!(
        run_dir.is_dir(),
        "run directory not found: {}",
        run_dir.display()
    );
    let config = load_config_from(config_path.as_deref())?;
    let mut compare = config.compare;
    if let Some(t) = tiebreak {
        compare.tiebreak = t;
    }

    let (manifest, rows) = load_run(&run_dir)
        .with_context(|| format!("failed to read run directory {}", run_dir.display()))?;
    let run_id = manifest.run_id;
    anyhow::ensure!(!rows.is_empty(), "no scored items in {}", run_dir.display());

    let comparator = match (baseline.or(compare.baseline.clone()), candidate.or(compare.candidate.clone())) {
        (Some(b), Some(c)) => Some(compare.comparator(&b, &c)),
        (None, None) => None,
        _ => anyhow::bail!("--baseline and --candidate must be given together"),
    };

    let report = RunReport::build(run_id, &rows, comparator.as_ref())?;

    let report_path = run_dir.join("report.json");
    report.save_json(&report_path)?;
    report.append_records(&run_dir)?;
    tracing::info!(path = %report_path.display(), "report saved");

    match format.as_str() {
        "markdown" | "md" => println!("{}", report.to_markdown()),
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }
    Ok(())
}

fn print_text(report: &RunReport) {
    println!(
        "Run {}: {} items, raters: {}",
        report.run_id,
        report.n_items,
        report.raters.join(", ")
    );

    let mut summaries = Table::new();
    summaries.set_header(vec!["Configuration", "Topic", "Type", "Seed", "Metric", "n", "Mean", "95% CI"]);
    for s in &report.summaries {
        summaries.add_row(vec![
            Cell::new(&s.key.configuration),
            Cell::new(&s.key.topic),
            Cell::new(s.key.item_type),
            Cell::new(s.key.seed),
            Cell::new(&s.metric),
            Cell::new(s.stats.n),
            Cell::new(format!("{:.3}", s.stats.mean)),
            Cell::new(format!("[{:.3}, {:.3}]", s.stats.ci95_low, s.stats.ci95_high)),
        ]);
    }
    println!("\n{summaries}");

    if let Some(c) = &report.comparison {
        println!("\n{} vs {}", c.candidate, c.baseline);

        let mut deltas = Table::new();
        deltas.set_header(vec!["Metric", "Pairs", "Delta", "95% CI", "Half-width", "Target met", "Significant"]);
        for d in &c.deltas {
            deltas.add_row(vec![
                Cell::new(&d.metric),
                Cell::new(d.n_pairs),
                Cell::new(format!("{:+.3}", d.delta_mean)),
                Cell::new(format!("[{:+.3}, {:+.3}]", d.ci95_low, d.ci95_high)),
                Cell::new(format!("{:.3}", d.half_width)),
                Cell::new(d.meets_precision_target),
                Cell::new(d.significant),
            ]);
        }
        println!("{deltas}");

        let mut wl = Table::new();
        wl.set_header(vec!["Metric", "Wins", "Losses", "Ties", "Win rate", "p"]);
        for w in &c.win_loss {
            wl.add_row(vec![
                Cell::new(&w.metric),
                Cell::new(w.wins),
                Cell::new(w.losses),
                Cell::new(w.ties),
                Cell::new(format!("{:.1}%", w.win_rate * 100.0)),
                Cell::new(format!("{:.4}", w.binomial_p)),
            ]);
        }
        println!("{wl}");

        if let Some(k) = &c.consensus {
            println!(
                "Consensus ({}): {}W/{}L, {} tied or abstained, win rate {:.1}% [{:.1}%, {:.1}%], p = {:.4}",
                k.raters.join(" + "),
                k.wins,
                k.losses,
                k.ties_or_abstained,
                k.win_rate * 100.0,
                k.ci95_low * 100.0,
                k.ci95_high * 100.0,
                k.binomial_p
            );
        }
    }

    let overall: Vec<_> = report.reliability.iter().filter(|r| r.group.is_none()).collect();
    if !overall.is_empty() {
        let mut rel = Table::new();
        rel.set_header(vec!["Raters", "Type", "n", "Agreement", "Kappa", "AC1"]);
        for r in overall {
            rel.add_row(vec![
                Cell::new(format!("{} / {}", r.rater_a, r.rater_b)),
                Cell::new(r.item_type),
                Cell::new(r.agreement.n),
                Cell::new(format!("{:.1}%", r.agreement.percent_agreement * 100.0)),
                Cell::new(format!("{:.3}", r.agreement.kappa)),
                Cell::new(format!("{:.3}", r.agreement.ac1)),
            ]);
        }
        println!("\n{rel}");
    }
}
