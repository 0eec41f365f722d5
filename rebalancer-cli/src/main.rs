//! Rebalancer CLI: plan, batch, status and validate commands.
//!
//! Commands:
//! - `plan`: build a single-shot plan for a portfolio snapshot and print it
//! - `batch`: evaluate the next batch of stored sequences for a snapshot
//! - `status`: report batch progress for a snapshot's fingerprint
//! - `validate`: check a planner configuration file

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rebalancer_core::config::PlannerConfiguration;
use rebalancer_core::domain::OpportunityContext;
use rebalancer_runner::export::save_artifacts;
use rebalancer_runner::{
    create_plan, spawn_batch, status, BatchConfig, BatchController, BatchError, BatchResult, CancelToken,
    JsonlRepository, Plan, PlannerEvent, SelectionBasis,
};

const DEFAULT_LOG_FILTER: &str = "info,rebalancer_core=info,rebalancer_runner=info";

#[derive(Parser)]
#[command(name = "rebalancer", about = "Rebalancer CLI: holistic trade planning")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a plan for a portfolio snapshot.
    Plan {
        /// Path to the snapshot JSON.
        #[arg(long)]
        snapshot: PathBuf,

        /// Planner configuration (TOML, or JSON by extension). Defaults apply without it.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write plan.json, steps.csv and alternatives.csv under this directory.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the full plan as JSON instead of a summary.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Evaluate the next batch of sequences, resuming from the store.
    Batch {
        /// Path to the snapshot JSON.
        #[arg(long)]
        snapshot: PathBuf,

        /// Planner configuration (TOML, or JSON by extension).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Sequence/evaluation store directory.
        #[arg(long, default_value = "planner-store")]
        store: PathBuf,

        /// Maximum sequences evaluated by this call.
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Sequences per chunk between checkpoints.
        #[arg(long, default_value_t = 10)]
        chunk_size: usize,

        /// Commit only once at the end instead of after every chunk.
        #[arg(long, default_value_t = false)]
        no_save_progress: bool,

        /// Evaluate each chunk on the rayon pool.
        #[arg(long, default_value_t = false)]
        parallel: bool,

        /// Stop after this many seconds; completed chunks are kept.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Report batch progress for a snapshot.
    Status {
        /// Path to the snapshot JSON.
        #[arg(long)]
        snapshot: PathBuf,

        /// Sequence/evaluation store directory.
        #[arg(long, default_value = "planner-store")]
        store: PathBuf,
    },
    /// Parse and validate a planner configuration.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Plan {
            snapshot,
            config,
            output,
            json,
        } => run_plan(&snapshot, config.as_deref(), output.as_deref(), json),
        Commands::Batch {
            snapshot,
            config,
            store,
            batch_size,
            chunk_size,
            no_save_progress,
            parallel,
            timeout_secs,
        } => {
            let batch_cfg = BatchConfig {
                batch_size,
                chunk_size,
                save_progress: !no_save_progress,
                parallel,
            };
            run_batch(&snapshot, config.as_deref(), &store, batch_cfg, timeout_secs)
        }
        Commands::Status { snapshot, store } => run_status(&snapshot, &store),
        Commands::Validate { config } => run_validate(&config),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { DEFAULT_LOG_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // A second init (tests) leaves the first subscriber in place.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

// ─── Inputs ──────────────────────────────────────────────────────────

fn load_snapshot(path: &Path) -> Result<OpportunityContext> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse snapshot {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<PlannerConfiguration> {
    match path {
        Some(p) => PlannerConfiguration::load(p).with_context(|| format!("invalid configuration {}", p.display())),
        None => Ok(PlannerConfiguration::default()),
    }
}

// ─── Commands ────────────────────────────────────────────────────────

fn run_plan(snapshot: &Path, config: Option<&Path>, output: Option<&Path>, json: bool) -> Result<()> {
    let ctx = load_snapshot(snapshot)?;
    let cfg = load_config(config)?;
    let plan = create_plan(&ctx, &cfg).context("planning failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print_plan(&plan);
    }

    if let Some(dir) = output {
        let run_dir = save_artifacts(&plan, dir)?;
        info!(dir = %run_dir.display(), "artifacts saved");
        println!("Artifacts saved to: {}", run_dir.display());
    }
    Ok(())
}

fn run_batch(
    snapshot: &Path,
    config: Option<&Path>,
    store: &Path,
    batch_cfg: BatchConfig,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let ctx = load_snapshot(snapshot)?;
    let cfg = load_config(config)?;
    let repo = Arc::new(JsonlRepository::new(store));
    let lock = repo.lock_path(&ctx.portfolio_hash());
    let controller = BatchController::new(repo);
    let events = controller.events().subscribe_with_capacity(256);

    let cancel = match timeout_secs {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    let mut handle = match spawn_batch(controller, ctx, cfg, batch_cfg, cancel) {
        Err(e @ BatchError::AlreadyRunning(_)) => {
            return Err(anyhow::Error::new(e).context(format!(
                "{} is held by another batch; remove it if no batch is running",
                lock.display()
            )))
        }
        other => other?,
    };
    info!(portfolio = handle.job_id().short(), "batch started");

    let result = loop {
        if let Some(result) = handle.try_result() {
            break result;
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(event)) => print_event(&event),
            Ok(None) => {}
            Err(_) => break handle.join(),
        }
    };
    for event in events.drain() {
        print_event(&event);
    }

    let result = result?;
    print_batch(&result);
    Ok(())
}

fn run_status(snapshot: &Path, store: &Path) -> Result<()> {
    let ctx = load_snapshot(snapshot)?;
    let hash = ctx.portfolio_hash();
    let repo = JsonlRepository::new(store);
    let report = status(&repo, &hash).context("failed to read planner store")?;

    println!("Portfolio:  {}", report.portfolio_hash.short());
    println!("Status:     {}", report.status);
    println!(
        "Progress:   {}/{} ({:.1}%)",
        report.sequences_evaluated,
        report.sequences_total,
        report.progress * 100.0
    );
    match report.best_score {
        Some(s) => println!("Best score: {s:.4}"),
        None => println!("Best score: -"),
    }
    Ok(())
}

fn run_validate(config: &Path) -> Result<()> {
    if !config.exists() {
        bail!("configuration file does not exist: {}", config.display());
    }
    let cfg = load_config(Some(config))?;
    println!("Configuration '{}' is valid.", cfg.name);
    println!("  max_depth:       {}", cfg.max_depth);
    println!("  beam_width:      {}", cfg.beam_width);
    println!("  calculators:     {}", cfg.calculators.len());
    println!("  patterns:        {}", cfg.patterns.len());
    println!("  generators:      {}", cfg.generators.len());
    println!("  filters:         {}", cfg.filters.len());
    Ok(())
}

// ─── Output ──────────────────────────────────────────────────────────

fn print_plan(plan: &Plan) {
    println!();
    println!("=== Plan ===");
    println!("Portfolio:      {}", plan.portfolio_hash.short());
    let basis = match plan.basis {
        SelectionBasis::Frontier => "frontier",
        SelectionBasis::PriorityFallback => "priority fallback",
        SelectionBasis::NoPlan => "no plan",
    };
    println!("Basis:          {basis}");
    println!("Summary:        {}", plan.summary);
    if plan.is_empty() {
        println!();
        return;
    }

    println!();
    println!("{:<4} {:<6} {:<10} {:>10} {:>12}  Reason", "#", "Side", "Symbol", "Qty", "Value");
    println!("{}", "-".repeat(60));
    for (i, s) in plan.steps.iter().enumerate() {
        println!(
            "{:<4} {:<6} {:<10} {:>10} {:>12.2}  {}",
            i + 1,
            s.side.as_str(),
            s.symbol,
            s.quantity,
            s.estimated_value,
            s.reason
        );
    }
    println!();
    println!("--- Evaluation ---");
    println!("Feasible:       {}", plan.feasible);
    if let Some(score) = plan.score {
        println!("Score:          {score:.4}");
    }
    if let Some(improvement) = plan.improvement {
        println!("Improvement:    {improvement:+.4}");
    }
    println!("Cash required:  {:.2}", plan.cash_required);
    println!("Cash generated: {:.2}", plan.cash_generated);
    println!("Total cost:     {:.2}", plan.total_cost);
    println!("Pareto optimal: {}", plan.pareto_optimal);
    if let Some(relaxation) = &plan.relaxation {
        println!("WARNING: constraints relaxed ({relaxation:?})");
    }
    println!(
        "Searched:       {} sequences, {} evaluated, {} alternatives",
        plan.statistics.sequences,
        plan.statistics.evaluated,
        plan.alternatives.len()
    );
    println!();
}

fn print_event(event: &PlannerEvent) {
    match event {
        PlannerEvent::SequencesGenerated { count, .. } => println!("Generated {count} sequences"),
        PlannerEvent::BatchStarted { total, evaluated, .. } => {
            println!("Resuming at {evaluated}/{total}")
        }
        PlannerEvent::ChunkEvaluated {
            evaluated,
            total,
            best_score,
            ..
        } => match best_score {
            Some(s) => println!("  {evaluated}/{total} evaluated, best {s:.4}"),
            None => println!("  {evaluated}/{total} evaluated"),
        },
        PlannerEvent::BatchCompleted { .. } => {}
        PlannerEvent::BatchFailed { error, .. } => eprintln!("Batch failed: {error}"),
    }
}

fn print_batch(result: &BatchResult) {
    println!();
    println!("=== Batch ===");
    println!("Portfolio:      {}", result.portfolio_hash.short());
    println!(
        "Evaluated:      {}/{} ({:.1}%)",
        result.sequences_evaluated,
        result.sequences_total,
        result.progress() * 100.0
    );
    println!(
        "This call:      {} ({} failed) in {} ms",
        result.evaluated_this_call, result.failed_this_call, result.elapsed_ms
    );
    match result.best_score {
        Some(s) => println!("Best score:     {s:.4}"),
        None => println!("Best score:     -"),
    }
    if let Some(plan) = &result.best_plan {
        let steps: Vec<String> = plan
            .steps
            .iter()
            .map(|s| format!("{} {} {}", s.side, s.quantity, s.symbol))
            .collect();
        println!("Best plan:      {}", steps.join(", "));
    }
    if result.cancelled {
        println!("Stopped early; run again to continue.");
    } else if result.complete {
        println!("Search complete.");
    }
    println!();
}
