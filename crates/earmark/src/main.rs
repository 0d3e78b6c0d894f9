use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use earmark_core::{
    Config, HttpCompletionClient, PersistMode, PipelineConfig, RetryPolicy, RunReport, SqlStore,
    TagSchema, TaggingPipeline,
};

#[derive(Parser)]
#[command(
    name = "emk",
    about = "Batch classification of grant opportunities through a completion service",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tag every stored opportunity and persist the results
    Run(RunArgs),
    /// Show document and tag counts for a database
    Stats {
        /// SQLite database path
        #[arg(long, env = "EARMARK_DB")]
        db: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// SQLite database path
    #[arg(long, env = "EARMARK_DB")]
    db: Option<String>,
    /// How tags are persisted: merge or append
    #[arg(long, default_value = "merge")]
    mode: PersistMode,
    /// Tag schema: core or extended
    #[arg(long, default_value = "core")]
    schema: TagSchema,
    /// Records per completion request
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
    /// Concurrent batches in flight
    #[arg(long)]
    workers: Option<usize>,
    /// Tag at most this many documents
    #[arg(long)]
    limit: Option<usize>,
    /// Extra attempts per batch after the first failure
    #[arg(long, default_value_t = 0)]
    retries: usize,
    /// Base backoff in milliseconds between attempts
    #[arg(long = "retry-delay-ms", default_value_t = 500)]
    retry_delay_ms: u64,
    /// Stop submitting batches after this many consecutive failures (0 = never)
    #[arg(long = "trip-after", default_value_t = 0)]
    trip_after: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Stats { db } => stats(db).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(db) = args.db {
        config.db_path = db;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }

    let store = SqlStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path))?;
    let client = HttpCompletionClient::new(config.completion.clone())
        .context("building completion client")?;

    let retry = if args.retries == 0 {
        RetryPolicy::none()
    } else {
        RetryPolicy::new(
            args.retries + 1,
            Duration::from_millis(args.retry_delay_ms),
        )
    };
    let pipeline_config = PipelineConfig {
        batch_size: config.batch_size,
        workers: config.workers,
        mode: args.mode,
        schema: args.schema,
        provenance: config.provenance(),
        limit: args.limit,
        retry,
        trip_after: args.trip_after,
    };

    let pipeline = TaggingPipeline::new(Arc::new(store), Arc::new(client), pipeline_config);
    let report = pipeline.run().await?;
    print_report(&report);
    Ok(())
}

async fn stats(db: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(db) = db {
        config.db_path = db;
    }

    let store = SqlStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path))?;
    println!("Documents: {}", store.count().await?);
    println!("Tagged:    {}", store.tagged_count().await?);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Loaded:  {}", report.loaded);
    println!("Batches: {}", report.batches);
    println!("Tagged:  {}", report.tagged);
    println!("Written: {}", report.written);
    if report.skipped > 0 {
        println!("Skipped: {} unparseable document(s)", report.skipped);
    }
    if report.untagged > 0 {
        println!("Untagged: {} record(s) missing from responses", report.untagged);
    }
    if !report.missed.is_empty() {
        println!("Missed:  {}", report.missed.join(", "));
    }
    if report.write_failures > 0 {
        println!("Write failures: {}", report.write_failures);
    }
    for failure in &report.failures {
        println!(
            "Batch {} failed ({} records): {}",
            failure.batch, failure.records, failure.error
        );
    }
    println!("Elapsed: {} ms", report.duration_ms);
}
