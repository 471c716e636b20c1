//! docstore-migrate CLI - checkpointed document collection transfer.

use clap::{Parser, Subcommand};
use docstore_migrate::{Config, MigrateError, Orchestrator, RunStatus, TransferReport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when the run finished but some collections failed.
const EXIT_COLLECTIONS_FAILED: u8 = 3;
/// Exit code after a shutdown signal.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "docstore-migrate")]
#[command(about = "Checkpointed, resumable transfer of document collections")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer collections, resuming from their checkpoints
    Run {
        /// Fetch pages without writing documents or checkpoints
        #[arg(long)]
        dry_run: bool,

        /// Only transfer these collections (repeatable)
        #[arg(long = "collection", value_name = "NAME")]
        collections: Vec<String>,

        /// Override the number of documents per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Override how many collections run at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Show the checkpoint of each configured collection
    Status,

    /// Delete checkpoints so collections start over from initial_value
    Reset {
        /// Collections to reset
        #[arg(required_unless_present = "all")]
        collections: Vec<String>,

        /// Reset every configured collection
        #[arg(long, conflicts_with = "collections")]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format);

    let config = load_config(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            dry_run,
            collections,
            batch_size,
            concurrency,
        } => {
            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(cli.shutdown_timeout);

            let mut orchestrator = Orchestrator::connect(config)
                .await?
                .with_cancellation(cancel_token)
                .with_dry_run(dry_run)
                .with_collections(&collections)?;
            if let Some(n) = batch_size {
                orchestrator = orchestrator.with_batch_size(n)?;
            }
            if let Some(n) = concurrency {
                orchestrator = orchestrator.with_concurrency(n)?;
            }

            let report = orchestrator.run().await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                print_report(&report);
            }

            Ok(match report.status {
                RunStatus::Completed => ExitCode::SUCCESS,
                RunStatus::Failed => ExitCode::from(EXIT_COLLECTIONS_FAILED),
                RunStatus::Cancelled => ExitCode::from(EXIT_CANCELLED),
            })
        }

        Commands::Status => {
            let orchestrator = Orchestrator::connect(config).await?;
            let rows = orchestrator.status().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                println!("Checkpoints:");
                for row in &rows {
                    match &row.checkpoint {
                        Some(cp) => println!(
                            "  {}: below {} ({} documents, updated {})",
                            row.collection,
                            cp.boundary()
                                .map_or_else(|| "start".to_string(), |b| b.to_string()),
                            cp.documents_transferred,
                            cp.updated_at.to_rfc3339()
                        ),
                        None => println!("  {}: not started", row.collection),
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reset { collections, all } => {
            let names: Vec<String> = if all { Vec::new() } else { collections };
            let orchestrator = Orchestrator::connect(config)
                .await?
                .with_collections(&names)?;
            let deleted = orchestrator.reset().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&deleted)?);
            } else if deleted.is_empty() {
                println!("No checkpoints to delete");
            } else {
                println!("Deleted checkpoints: {}", deleted.join(", "));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load configuration, reporting an unreadable file as a configuration error.
fn load_config(path: &Path) -> Result<Config, MigrateError> {
    Config::load(path).map_err(|e| match e {
        MigrateError::Io(io) => {
            MigrateError::Config(format!("cannot read {}: {}", path.display(), io))
        }
        other => other,
    })
}

fn print_report(report: &TransferReport) {
    let status_msg = match (report.status, report.dry_run) {
        (RunStatus::Completed, true) => "Dry run completed!",
        (RunStatus::Completed, false) => "Transfer completed!",
        (RunStatus::Failed, _) => "Transfer finished with failures",
        (RunStatus::Cancelled, _) => "Transfer cancelled",
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", report.run_id);
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Collections: {}/{}",
        report.collections_done, report.collections_total
    );
    println!("  Documents: {}", report.documents_transferred);

    for outcome in &report.collections {
        match &outcome.failure {
            None => println!(
                "  ✓ {}: {} documents in {} batches",
                outcome.collection, outcome.stats.documents, outcome.stats.batches
            ),
            Some(failure) => {
                println!(
                    "  ✗ {}: {} (during {:?}{})",
                    outcome.collection,
                    failure.message,
                    failure.phase,
                    if failure.retryable { ", retryable" } else { "" }
                );
                for cause in &failure.caused_by {
                    println!("      caused by: {}", cause);
                }
                println!(
                    "      resume below: {}",
                    outcome
                        .resume_boundary
                        .as_ref()
                        .map_or_else(|| "start".to_string(), |b| b.to_string())
                );
            }
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    // RUST_LOG takes precedence over --verbosity
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Force the process down if graceful shutdown exceeds `timeout_secs`.
fn spawn_shutdown_deadline(token: CancellationToken, timeout_secs: u64) {
    tokio::spawn(async move {
        token.cancelled().await;
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        eprintln!("Shutdown timeout of {}s exceeded, exiting", timeout_secs);
        std::process::exit(i32::from(EXIT_CANCELLED));
    });
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (container/orchestrator shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!(
                        "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                        name, shutdown_timeout
                    );
                    token.cancel();
                });
            }
            Err(e) => warn!("Failed to setup {} handler: {}", name, e),
        }
    }

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!("\nReceived Ctrl-C. Shutting down gracefully...");
                token.cancel();
            }
            Err(e) => warn!("Failed to setup Ctrl-C handler: {}", e),
        }
    });

    spawn_shutdown_deadline(cancel_token.clone(), shutdown_timeout);
    cancel_token
}
