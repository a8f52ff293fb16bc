//! strata-shard: operator tool for ledger shard migration runs.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata_db::{log_pool_metrics, Database, PoolConfig, ShardRegistry};
use strata_migrate::{
    defaults, CopyParams, DeleteParams, FinalizeParams, IndexParams, LedgerTable, MigrationConfig,
    MigrationOrchestrator, OrchestratorBuilder, PhaseCommand, RelinkParams, RunHandle,
    ShardSchemaVersion,
};

#[derive(Parser)]
#[command(name = "strata-shard")]
#[command(author, version, about = "Move historical ledger heights into shard stores")]
#[command(propagate_version = true)]
struct Cli {
    /// Database URL (falls back to DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the unfinished run, if any
    Status,

    /// Start a run up to a boundary height and drive it to completion
    Run {
        /// Exclusive upper height of the new shard
        #[arg(short, long)]
        boundary: i64,
    },

    /// Continue the unfinished run until it completes
    Resume,

    /// Execute a single phase call on the unfinished run
    Phase {
        #[arg(value_enum)]
        phase: PhaseName,

        /// Restrict a data phase to these tables
        #[arg(short, long, num_args = 1..)]
        tables: Vec<LedgerTable>,

        /// Rows per batch
        #[arg(long)]
        batch_size: Option<u32>,

        /// Time budget in milliseconds
        #[arg(long)]
        budget_ms: Option<u64>,

        /// Shard hash in hex for `finalize` (computed when omitted)
        #[arg(long)]
        hash: Option<String>,
    },

    /// Move a FAILED run back to its last completed state
    Restart,

    /// Drop the unfinished run and its shard store
    Discard,

    /// Print the content hash of the unfinished run's shard
    Hash,

    /// Find the completed shard holding a height
    Lookup {
        #[arg(long)]
        height: i64,
    },

    /// List completed shards
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseName {
    SchemaInit,
    SchemaFull,
    Copy,
    Relink,
    Index,
    Delete,
    Finalize,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing from the environment.
///
///   LOG_FORMAT - "json" or "text" (default: "text")
///   LOG_FILE   - path to log file (optional, enables daily rotated file logging)
///   RUST_LOG   - standard env filter (default: "strata_migrate=info,strata_db=info")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "strata_migrate=info,strata_db=info,strata_shard=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("strata-shard.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
        }
        Some(guard)
    } else {
        // logs go to stderr so stdout stays machine readable
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        None
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let database_url = cli
        .database_url
        .or_else(|| std::env::var(defaults::ENV_DATABASE_URL).ok())
        .unwrap_or_else(|| defaults::DATABASE_URL.to_string());

    let config = MigrationConfig::from_env();
    let db =
        Database::connect_with_config(&database_url, PoolConfig::for_batches(config.parallel_tables))
            .await?;
    db.migrate().await?;

    info!(
        subsystem = "cli",
        batch_size = config.batch_size,
        time_budget_ms = config.time_budget_ms,
        parallel_tables = config.parallel_tables,
        "Connected"
    );
    let orchestrator = OrchestratorBuilder::from_database(&db)
        .with_config(config)
        .build();

    match cli.command {
        Commands::Status => {
            let record = match orchestrator.resume_run().await {
                Ok(run) => Some(orchestrator.run_record(&run).await?),
                Err(strata_migrate::Error::NotInitialized(_)) => None,
                Err(e) => return Err(e.into()),
            };
            print_json(&record)?;
        }
        Commands::Run { boundary } => {
            let run = orchestrator.begin_run(boundary).await?;
            drive(&orchestrator, &run).await?;
        }
        Commands::Resume => {
            let run = orchestrator.resume_run().await?;
            drive(&orchestrator, &run).await?;
        }
        Commands::Phase {
            phase,
            tables,
            batch_size,
            budget_ms,
            hash,
        } => {
            let run = orchestrator.resume_run().await?;
            let command = phase_command(
                &orchestrator,
                &run,
                phase,
                tables,
                batch_size,
                budget_ms,
                hash,
            )
            .await?;
            let outcome = orchestrator.execute(&run, command).await?;
            print_json(&outcome)?;
        }
        Commands::Restart => {
            let run = orchestrator.resume_run().await?;
            let state = orchestrator.restart_failed(&run).await?;
            print_json(&state)?;
        }
        Commands::Discard => {
            let run = orchestrator.resume_run().await?;
            let shard_id = run.shard_id();
            orchestrator.discard_run(run).await?;
            print_json(&serde_json::json!({ "discarded": shard_id }))?;
        }
        Commands::Hash => {
            let run = orchestrator.resume_run().await?;
            let hash = orchestrator.compute_shard_hash(&run).await?;
            print_json(&serde_json::json!({ "shard_id": run.shard_id(), "hash": hash.to_hex() }))?;
        }
        Commands::Lookup { height } => {
            print_json(&db.registry.lookup(height).await?)?;
        }
        Commands::List => {
            print_json(&db.registry.list().await?)?;
        }
    }
    log_pool_metrics(db.pool());
    Ok(())
}

/// Run to completion, cancelling at the next batch boundary on Ctrl-C.
async fn drive(orchestrator: &MigrationOrchestrator, run: &RunHandle) -> anyhow::Result<()> {
    let cancel = run.cancel_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(subsystem = "cli", "Interrupt received, stopping at next batch boundary");
            cancel.cancel();
        }
    });

    let result = orchestrator.run_to_completion(run).await;
    watcher.abort();

    let state = result?;
    print_json(&orchestrator.run_record(run).await?)?;
    if run.is_cancelled() {
        anyhow::bail!("run cancelled in state {}", state);
    }
    Ok(())
}

async fn phase_command(
    orchestrator: &MigrationOrchestrator,
    run: &RunHandle,
    phase: PhaseName,
    tables: Vec<LedgerTable>,
    batch_size: Option<u32>,
    budget_ms: Option<u64>,
    hash: Option<String>,
) -> anyhow::Result<PhaseCommand> {
    let config = orchestrator.config();
    let batch_size = batch_size.unwrap_or(config.batch_size);
    let budget = budget_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.time_budget());

    macro_rules! data_params {
        ($params:ty) => {
            if tables.is_empty() {
                <$params>::all_with(batch_size, budget)?
            } else {
                <$params>::new(tables, batch_size, budget)?
            }
        };
    }

    let command = match phase {
        PhaseName::SchemaInit => PhaseCommand::CreateSchema(ShardSchemaVersion::Init),
        PhaseName::SchemaFull => PhaseCommand::CreateSchema(ShardSchemaVersion::Full),
        PhaseName::Copy => PhaseCommand::Copy(data_params!(CopyParams)),
        PhaseName::Relink => PhaseCommand::Relink(data_params!(RelinkParams)),
        PhaseName::Index => PhaseCommand::UpdateIndex(data_params!(IndexParams)),
        PhaseName::Delete => PhaseCommand::Delete(data_params!(DeleteParams)),
        PhaseName::Finalize => {
            let hash = match hash {
                Some(hex) => strata_migrate::ShardHash::from_hex(&hex)?,
                None => orchestrator.compute_shard_hash(run).await?,
            };
            PhaseCommand::Finalize(FinalizeParams::new(hash))
        }
    };
    Ok(command)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
