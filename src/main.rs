//! Quant Eval CLI
//!
//! Binary quantification evaluation harness

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quant_eval::{Orchestrator, PredictionSet, RateEstimates, ResultsSummary, ResultsTable, RunConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quant-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evaluation protocol for one or more run files
    Evaluate {
        /// Run configuration files (glob pattern)
        #[arg(long, default_value = "runs/*.yaml")]
        config: String,

        /// Evaluate only the primary quantifier
        #[arg(long)]
        primary_only: bool,

        /// Add prevalences 0.0 and 1.0 to the sampled range
        #[arg(long)]
        include_bounds: bool,

        /// Note recorded with every result row
        #[arg(long)]
        note: Option<String>,
    },

    /// Print classifier rates measured on a validation prediction file
    Rates {
        /// Validation predictions (JSON Lines)
        #[arg(long)]
        predictions: String,
    },

    /// Summarize an accumulated results table
    Report {
        /// Results CSV file
        #[arg(long, default_value = "results/results.csv")]
        results: String,

        /// Restrict to one dataset
        #[arg(long)]
        dataset: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "markdown")]
        format: ReportFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Evaluate {
            config,
            primary_only,
            include_bounds,
            note,
        } => evaluate(&config, primary_only, include_bounds, note),
        Commands::Rates { predictions } => {
            tracing::info!(predictions = %predictions, "measuring rates");
            let validation = PredictionSet::load(&predictions)
                .with_context(|| format!("failed to load predictions from {predictions}"))?;
            let rates = RateEstimates::from_predictions(&validation)?;
            println!("Validation Rates");
            println!("================");
            println!("Items: {} (prevalence {:.4})", validation.len(), validation.prevalence());
            println!("tpr:  {:.6}", rates.tpr);
            println!("fpr:  {:.6}", rates.fpr);
            println!("ptpr: {:.6}", rates.ptpr);
            println!("pfpr: {:.6}", rates.pfpr);
            Ok(())
        }
        Commands::Report {
            results,
            dataset,
            format,
        } => {
            tracing::info!(results = %results, dataset = ?dataset, "summarizing results");
            let table = ResultsTable::load(&results)
                .with_context(|| format!("failed to read results from {results}"))?;
            if table.is_empty() {
                bail!("no results in {results}");
            }
            let summary = ResultsSummary::from_table(&table, dataset.as_deref());
            match format {
                ReportFormat::Markdown => print!("{}", summary.to_markdown()),
                ReportFormat::Json => println!("{}", summary.to_json()?),
            }
            Ok(())
        }
    }
}

fn evaluate(pattern: &str, primary_only: bool, include_bounds: bool, note: Option<String>) -> Result<()> {
    let configs = RunConfig::load_glob(pattern)
        .with_context(|| format!("failed to load run files matching {pattern}"))?;
    if configs.is_empty() {
        bail!("no run files match {pattern}");
    }
    tracing::info!(runs = configs.len(), pattern = %pattern, "starting evaluation");

    for mut config in configs {
        config.primary_only |= primary_only;
        config.include_bounds |= include_bounds;
        if let Some(note) = &note {
            config.note.clone_from(note);
        }
        config.validate()?;

        let dataset = config.dataset.clone();
        let evaluation = Orchestrator::new(config)
            .execute()
            .with_context(|| format!("evaluation of {dataset} failed"))?;

        println!("Dataset: {dataset} ({} samples)", evaluation.true_prevalences.len());
        for method in &evaluation.methods {
            let mae = method
                .score(quant_eval::Metric::Mae)
                .map_or_else(|| "-".to_string(), |s| format!("{s:.5}"));
            println!(
                "  {:<10} mae {mae}  failed {}  stalled {}",
                method.name, method.failed, method.stalled
            );
        }
    }
    Ok(())
}
