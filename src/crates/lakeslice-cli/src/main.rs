//! lakeslice CLI - sync a representative slice of a tabular store
//!
//! Main entry point for the lakeslice command-line tool.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lakeslice_checkpoint::{generate_run_id, RunStatus, SyncCheckpoint, TableOutcome};
use lakeslice_cli::{logging, App, Catalog, ConfigLoader};
use lakeslice_core::{
    CancellationToken, ProgressCallback, ProgressEvent, ResumeOptions, SampleSpecPatch, Strategy,
    SyncSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lakeslice")]
#[command(about = "lakeslice - sync a representative slice of a tabular store", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of ./.lakeslice/lakeslice.toml
    #[arg(short, long, global = true, env = "LAKESLICE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `lakeslice_core=trace` (overrides LAKESLICE_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the extraction waves for a catalog
    Plan {
        /// Path to a YAML fixture catalog
        catalog: PathBuf,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sync every selected table of a catalog
    Run {
        /// Path to a YAML fixture catalog
        catalog: PathBuf,

        /// Run identifier (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Re-run the tables of an earlier run that did not succeed
    Resume {
        /// Run to resume
        run_id: String,

        /// Path to a YAML fixture catalog
        catalog: PathBuf,

        /// Leave previously failed tables failed (their dependents stay skipped)
        #[arg(long)]
        skip_failed: bool,

        /// Layered over the sampling settings the run was started with
        #[command(flatten)]
        sampling: SamplingArgs,
    },

    /// Show the checkpoint of a run (latest when omitted)
    Status {
        run_id: Option<String>,

        /// Print the checkpoint as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs, most recent first
    Runs,

    /// List (or delete) the output written by a run
    Rollback {
        run_id: String,

        /// Delete the output files and the run's checkpoint
        #[arg(long)]
        delete: bool,
    },
}

/// Sampling settings applied to every table, above configuration
#[derive(Args, Default)]
struct SamplingArgs {
    /// random, recent, head, tail, stratified, query or full
    #[arg(long)]
    strategy: Option<Strategy>,

    /// Row budget per table
    #[arg(long)]
    rows: Option<u64>,

    #[arg(long)]
    date_column: Option<String>,

    #[arg(long)]
    stratify_column: Option<String>,

    /// SQL for the `query` strategy
    #[arg(long)]
    query: Option<String>,

    /// Seed for reproducible random samples
    #[arg(long)]
    seed: Option<u64>,
}

impl SamplingArgs {
    fn patch(&self) -> Option<SampleSpecPatch> {
        let patch = SampleSpecPatch {
            strategy: self.strategy,
            row_budget: self.rows,
            date_column: self.date_column.clone(),
            stratify_column: self.stratify_column.clone(),
            custom_query: self.query.clone(),
            seed: self.seed,
        };
        (patch != SampleSpecPatch::default()).then_some(patch)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_file(path);
    }
    let config = loader.load().await?;
    logging::init(cli.log_level.as_deref(), &config.logging.level)?;

    let app = App::new(config);

    match cli.command {
        Commands::Plan { catalog, json } => {
            let (graph, plan) = app.plan(Catalog::load(&catalog).await?).await?;
            if json {
                let doc = serde_json::json!({
                    "waves": plan.waves,
                    "broken_edges": plan.broken_edges,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "{} tables, {} dependencies, {} waves",
                graph.len(),
                graph.edge_count(),
                plan.waves.len()
            );
            for (i, wave) in plan.waves.iter().enumerate() {
                println!("  wave {}: {}", i, wave.join(", "));
            }
            for edge in &plan.broken_edges {
                println!("  ⚠ ignored for ordering: {} -> {}", edge.from, edge.to);
            }
            for dangling in graph.dangling_references() {
                println!(
                    "  ⚠ {}.{} references unknown table {}",
                    dangling.table, dangling.column, dangling.referenced_table
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            catalog,
            run_id,
            sampling,
        } => {
            let catalog = Catalog::load(&catalog).await?;
            let run_id = run_id.unwrap_or_else(generate_run_id);
            let cancel = CancellationToken::new();
            let _signals = cancel.cancel_on_signals();

            println!("Run {}", run_id);
            let summary = app
                .run(
                    catalog,
                    &run_id,
                    sampling.patch().as_ref(),
                    &cancel,
                    Some(progress_printer()),
                )
                .await?;
            print_summary(&summary);
            Ok(exit_code(summary.status))
        }
        Commands::Resume {
            run_id,
            catalog,
            skip_failed,
            sampling,
        } => {
            let catalog = Catalog::load(&catalog).await?;
            let cancel = CancellationToken::new();
            let _signals = cancel.cancel_on_signals();

            println!("Resuming run {}", run_id);
            let summary = app
                .resume(
                    catalog,
                    &run_id,
                    sampling.patch().as_ref(),
                    ResumeOptions { skip_failed },
                    &cancel,
                    Some(progress_printer()),
                )
                .await?;
            print_summary(&summary);
            Ok(exit_code(summary.status))
        }
        Commands::Status { run_id, json } => {
            let checkpoint = app.status(run_id.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            } else {
                print_checkpoint(&checkpoint);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Runs => {
            let runs = app.runs().await?;
            if runs.is_empty() {
                println!("No runs recorded");
            }
            for run in runs {
                println!(
                    "{:<32} {:<10} {:>4} tables  started {}",
                    run.run_id,
                    run.status.as_str(),
                    run.table_count,
                    run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rollback { run_id, delete } => {
            let locations = app.rollback(&run_id, delete).await?;
            for location in &locations {
                println!("{}", location);
            }
            if delete {
                println!("✓ Removed {} outputs and the checkpoint of {}", locations.len(), run_id);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn progress_printer() -> ProgressCallback {
    Arc::new(|event: &ProgressEvent| {
        eprintln!(
            "[{}/{}] {} {}",
            event.completed, event.total, event.table, event.outcome
        );
    })
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Aborted => ExitCode::from(130),
        RunStatus::Running | RunStatus::Failed => ExitCode::FAILURE,
    }
}

fn icon(outcome: TableOutcome) -> &'static str {
    match outcome {
        TableOutcome::Succeeded => "✓",
        TableOutcome::Failed => "✗",
        TableOutcome::Skipped => "⚠",
    }
}

fn print_summary(summary: &SyncSummary) {
    println!();
    for table in &summary.carried_over {
        println!("  ✓ {:<24} (succeeded earlier)", table);
    }
    for result in &summary.results {
        let detail = match (&result.error, result.source_row_count) {
            (Some(error), _) => error.clone(),
            (None, Some(source)) => format!("{}/{} rows", result.sampled_row_count, source),
            (None, None) => format!("{} rows", result.sampled_row_count),
        };
        println!("  {} {:<24} {}", icon(result.outcome()), result.table_name, detail);
    }
    for table in &summary.not_started {
        println!("  - {:<24} not started", table);
    }
    println!();
    println!(
        "Run {} {}: {} succeeded, {} failed, {} skipped in {:.1}s",
        summary.run_id,
        summary.status,
        summary.succeeded().len() + summary.carried_over.len(),
        summary.failed().len(),
        summary.skipped().len(),
        summary.duration.as_secs_f64()
    );
}

fn print_checkpoint(checkpoint: &SyncCheckpoint) {
    let progress = checkpoint.progress();
    println!("Run:      {}", checkpoint.run_id);
    println!("Status:   {}", checkpoint.status);
    println!(
        "Progress: {}/{} tables ({}%)",
        progress.completed,
        progress.total,
        progress.percent()
    );
    println!("Started:  {}", checkpoint.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(finished) = checkpoint.finished_at {
        println!("Finished: {}", finished.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if checkpoint.resumes > 0 {
        println!("Resumed:  {} times", checkpoint.resumes);
    }
    println!();
    for result in checkpoint.results.values() {
        println!(
            "  {} {:<24} {:>8} rows  {} attempts",
            icon(result.outcome()),
            result.table_name,
            result.sampled_row_count,
            result.attempts
        );
    }
}
