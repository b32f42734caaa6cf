//! CLI command definitions for debt-forge.
//!
//! `serve` and `worker` read their settings from the environment through
//! `EvaluatorConfig::from_env`; flags only override what is listed here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::evaluation::{
    DimensionReport, DimensionScores, EvaluationReport, EvaluationVerdict, Submission, ALL_QUEUES,
};
use crate::metrics::init_metrics;
use crate::pipeline::{connect_queue, Analyzers, EvaluatorConfig, Runtime};
use crate::scheduler::QueueStats;
use crate::storage::{Database, MemoryTaskPool, TaskPool};

/// Contextual debt evaluator for agent submissions.
#[derive(Parser)]
#[command(name = "debt-forge")]
#[command(about = "Score agent submissions for contextual debt")]
#[command(version)]
#[command(
    long_about = "debt-forge asks an agent to solve a task and scores the result on three\ndimensions: rationale, architectural coherence and testing verification.\n\nExample usage:\n  debt-forge serve\n  debt-forge analyze submission.json --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the HTTP API, with workers unless --no-workers is given.
    Serve(ServeArgs),

    /// Run queue workers only. Requires REDIS_URL.
    Worker(WorkerArgs),

    /// Score a submission file offline and print the report.
    Analyze(AnalyzeArgs),

    /// Apply database migrations and optionally seed the task pool.
    Migrate(MigrateArgs),

    /// Show queue depths and dead-lettered jobs.
    #[command(name = "queue-stats")]
    QueueStats(QueueStatsArgs),
}

/// Arguments for `debt-forge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Override DEBT_FORGE_BIND_ADDR.
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Do not start workers in this process. Requires REDIS_URL.
    #[arg(long)]
    pub no_workers: bool,
}

/// Arguments for `debt-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Override DEBT_FORGE_WORKERS_PER_QUEUE.
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,
}

/// Arguments for `debt-forge analyze`.
#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    /// Path to a submission JSON file.
    pub input: PathBuf,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `debt-forge migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// JSON task list to insert into the task pool.
    #[arg(long)]
    pub seed: Option<PathBuf>,
}

/// Arguments for `debt-forge queue-stats`.
#[derive(Parser, Debug)]
pub struct QueueStatsArgs {
    /// Number of dead-lettered jobs to show per queue.
    #[arg(short = 'd', long, default_value = "0")]
    pub dead_letter: usize,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Analyze(args) => run_analyze_command(args).await,
        Commands::Migrate(args) => run_migrate_command(args).await,
        Commands::QueueStats(args) => run_queue_stats_command(args).await,
    }
}

fn load_config() -> anyhow::Result<EvaluatorConfig> {
    let config = EvaluatorConfig::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config()?;
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
        config.validate()?;
    }
    if args.no_workers && config.redis_url.is_none() {
        anyhow::bail!(
            "--no-workers requires REDIS_URL.\n\
             The in-process queue is only reachable from workers in this process."
        );
    }

    init_metrics().context("Failed to initialize metrics")?;
    let runtime = Runtime::connect(config).await?;

    let mut workers = if args.no_workers {
        None
    } else {
        let mut workers = runtime.workers(Analyzers::from_config(&runtime.config)?);
        workers.start().await?;
        Some(workers)
    };

    let state = Arc::new(AppState {
        orchestrator: runtime.orchestrator()?,
    });
    let served = api::serve(&runtime.config.bind_addr, state).await;

    if let Some(workers) = workers.as_mut() {
        workers.shutdown().await?;
    }
    served
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = load_config()?;
    if let Some(workers) = args.workers {
        config = config.with_workers_per_queue(workers);
        config.validate()?;
    }
    if config.redis_url.is_none() {
        anyhow::bail!(
            "REDIS_URL is required but not set.\n\
             Standalone workers consume the shared Redis queue."
        );
    }

    init_metrics().context("Failed to initialize metrics")?;
    let runtime = Runtime::connect(config).await?;
    let mut workers = runtime.workers(Analyzers::from_config(&runtime.config)?);
    workers.start().await?;
    info!(pools = workers.len(), "Workers running, press Ctrl+C to stop");

    api::shutdown_signal().await;
    workers.shutdown().await?;

    for (queue, stats) in workers.stats() {
        info!(
            queue = %queue,
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            "Worker pool summary"
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeOutput {
    status: String,
    contextual_debt_score: f64,
    report: EvaluationReport,
}

async fn run_analyze_command(args: AnalyzeArgs) -> anyhow::Result<()> {
    let submission = load_submission(&args.input)?;
    let config = load_config()?;
    let analyzers = Analyzers::from_config(&config)?;

    let steps = submission.reasoning_trace();
    let architectural = analyzers.architectural.clone();
    let source_code = submission.source_code.clone();
    let (rationale, architectural, testing) = tokio::join!(
        analyzers.rationale.analyze(&steps),
        tokio::task::spawn_blocking(move || architectural.analyze(&source_code)),
        analyzers
            .testing
            .analyze(&submission.source_code, submission.test_code.as_deref()),
    );
    let architectural = architectural.context("Architectural analysis panicked")?;

    let verdict = EvaluationVerdict::from_dimensions(DimensionScores {
        rationale_debt: DimensionReport::from(rationale),
        architectural_coherence_debt: DimensionReport::from(architectural),
        testing_verification_debt: DimensionReport::from(testing),
    });

    let output = AnalyzeOutput {
        status: verdict.status.to_string(),
        contextual_debt_score: verdict.contextual_debt_score,
        report: verdict.report,
    };

    if args.json {
        let json_output = serde_json::to_string_pretty(&output)
            .map_err(|e| anyhow::anyhow!("Failed to serialize report JSON: {}", e))?;
        println!("{}", json_output);
    } else {
        print_analysis(&output);
    }
    Ok(())
}

fn load_submission(path: &Path) -> anyhow::Result<Submission> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid submission in {}", path.display()))
}

fn print_analysis(output: &AnalyzeOutput) {
    println!("Status: {}", output.status);
    println!("Contextual debt score: {:.2}", output.contextual_debt_score);
    if let EvaluationReport::Dimensions(scores) = &output.report {
        for (name, dimension) in [
            ("Rationale", &scores.rationale_debt),
            ("Architectural coherence", &scores.architectural_coherence_debt),
            ("Testing verification", &scores.testing_verification_debt),
        ] {
            println!("  {:<24} {:.2}  {}", name, dimension.score, dimension.details);
        }
    }
}

async fn run_migrate_command(args: MigrateArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    let Some(url) = config.database_url.as_deref() else {
        anyhow::bail!(
            "DATABASE_URL is required but not set.\n\
             Set it to a PostgreSQL connection string before running migrations."
        );
    };

    let db = Database::connect(url).await?;
    let applied = db.run_migrations().await?;
    println!("Applied {} migration(s)", applied);

    if let Some(path) = args.seed {
        let tasks = MemoryTaskPool::from_json_file(&path)
            .await?
            .get_all_thoughts()
            .await?;
        let inserted = db.seed_thoughts(&tasks).await?;
        println!(
            "Seeded {} of {} task(s) from {}",
            inserted,
            tasks.len(),
            path.display()
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueReport {
    #[serde(flatten)]
    stats: QueueStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dead_letter: Vec<serde_json::Value>,
}

async fn run_queue_stats_command(args: QueueStatsArgs) -> anyhow::Result<()> {
    let config = load_config()?;
    if config.redis_url.is_none() {
        warn!("REDIS_URL not set, showing the empty in-process queue");
    }
    let queue = connect_queue(&config).await?;

    let mut reports = Vec::with_capacity(ALL_QUEUES.len());
    for name in ALL_QUEUES {
        let stats = queue.stats(name).await?;
        let dead_letter = if args.dead_letter > 0 {
            queue.peek_dead_letter(name, args.dead_letter).await?
        } else {
            Vec::new()
        };
        reports.push(QueueReport { stats, dead_letter });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!(
        "{:<24} {:>8} {:>11} {:>12}",
        "QUEUE", "PENDING", "PROCESSING", "DEAD LETTER"
    );
    for report in &reports {
        let stats = &report.stats;
        println!(
            "{:<24} {:>8} {:>11} {:>12}",
            stats.queue_name, stats.pending_jobs, stats.processing_jobs, stats.dead_letter_jobs
        );
        for entry in &report.dead_letter {
            println!("  {}", entry);
        }
    }
    Ok(())
}
