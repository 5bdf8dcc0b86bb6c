//! judgekit CLI: the user-facing command-line interface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use judgekit_core::paired::TieBreak;

mod commands;

#[derive(Parser)]
#[command(name = "judgekit", version, about = "Multi-judge evaluation and paired statistics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge tasks with every configured rater, resuming where a previous run stopped
    Judge {
        /// JSONL file with one judge task per line
        #[arg(long)]
        tasks: PathBuf,

        /// Run directory holding the checkpoint and reports
        #[arg(long)]
        run_dir: PathBuf,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Discard committed rows and start over
        #[arg(long)]
        no_resume: bool,

        /// First task row to judge
        #[arg(long, default_value = "0")]
        start_index: usize,

        /// Maximum number of tasks to judge from the start index
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Recompute summaries, paired comparisons and reliability for a run
    Report {
        /// Run directory produced by `judge`
        #[arg(long)]
        run_dir: PathBuf,

        /// Baseline configuration name
        #[arg(long)]
        baseline: Option<String>,

        /// Candidate configuration name
        #[arg(long)]
        candidate: Option<String>,

        /// Judge tie-break strategy: judge-only, judge-with-semantic-tiebreak
        #[arg(long)]
        tiebreak: Option<TieBreak>,

        /// Output format: text, json, markdown
        #[arg(long, default_value = "text")]
        format: String,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check configuration and credentials without contacting providers
    ValidateConfig {
        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create a starter config
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("judgekit=info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Judge {
            tasks,
            run_dir,
            config,
            no_resume,
            start_index,
            limit,
        } => {
            commands::judge::execute(commands::judge::JudgeArgs {
                tasks,
                run_dir,
                config,
                resume: !no_resume,
                start_index,
                limit,
            })
            .await
        }
        Commands::Report {
            run_dir,
            baseline,
            candidate,
            tiebreak,
            format,
            config,
        } => commands::report::execute(run_dir, baseline, candidate, tiebreak, format, config),
        Commands::ValidateConfig { config } => commands::validate_config::execute(config),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
