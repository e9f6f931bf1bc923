//! mssql-pg-etl CLI - parallel bulk ETL from MSSQL to PostgreSQL.

use clap::{Parser, Subcommand};
use mssql_pg_etl::{Config, JobState, MigrateError, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-pg-etl")]
#[command(about = "Parallel bulk ETL from MSSQL to PostgreSQL")]
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

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    /// Directory for per-table stats files (overrides migration.stats_dir)
    #[arg(long)]
    stats_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configured tables
    Run {
        /// Only load these tables (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Override number of transform workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override number of bulk writers
        #[arg(long)]
        writers: Option<usize>,

        /// Dry run: load caches and select strategies without writing
        #[arg(long)]
        dry_run: bool,

        /// Load all tables in one transaction; any failure rolls back every table
        #[arg(long)]
        common_transaction: bool,
    },

    /// Migrate binary attachment payloads as background jobs
    Attachments {
        /// Only migrate these attachment tables (repeatable)
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Correlation id shared by the queued jobs
        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Validate row counts between source and target
    Validate,

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler(cli.shutdown_timeout);

    match cli.command {
        Commands::Run {
            tables,
            workers,
            writers,
            dry_run,
            common_transaction,
        } => {
            if let Some(w) = workers {
                config.migration.workers = Some(w);
            }
            if let Some(w) = writers {
                config.migration.writers = Some(w);
            }
            if common_transaction {
                config.migration.common_transaction = true;
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let orchestrator = Orchestrator::new(config)
                .await?
                .with_progress(cli.progress)
                .with_stats_dir(cli.stats_dir.clone());

            let result = orchestrator.run(&tables, cancel_token, dry_run).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else if dry_run {
                println!("\nDry run completed!");
                for plan in &result.plans {
                    println!(
                        "  {} -> {}: {} ({} writers, {} source rows)",
                        plan.table,
                        plan.target_table,
                        plan.strategy,
                        plan.writers,
                        plan.source_rows
                            .map_or_else(|| "unknown".to_string(), |n| n.to_string())
                    );
                }
            } else {
                println!("\nMigration completed!");
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Tables: {}", result.tables_total);
                println!("  Processed: {}", result.rows_processed);
                println!(
                    "  Inserted: {} ({} updated)",
                    result.rows_inserted, result.rows_updated
                );
                println!("  Skipped: {}", result.rows_skipped);
                println!("  Throughput: {} rows/sec", result.rows_per_second);
            }
        }

        Commands::Attachments {
            tables,
            correlation_id,
        } => {
            let config = config.with_auto_tuning();
            let correlation_id =
                correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let orchestrator = Orchestrator::new(config).await?;
            let statuses = orchestrator
                .run_attachments(&tables, &correlation_id, cancel_token)
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!("Attachment jobs ({}):", correlation_id);
                for status in &statuses {
                    println!(
                        "  {} {}: {:?}, {}/{} files, {} skipped",
                        status.job_id,
                        status.table,
                        status.state,
                        status.processed_files,
                        status.total_files,
                        status.skipped_files
                    );
                    if let Some(ref err) = status.error_message {
                        println!("    Error: {}", err);
                    }
                }
            }

            let failed = statuses
                .iter()
                .filter(|s| s.state == JobState::Failed)
                .count();
            if failed > 0 {
                return Err(MigrateError::Job(format!(
                    "{} of {} attachment jobs failed",
                    failed,
                    statuses.len()
                )));
            }
        }

        Commands::Validate => {
            let orchestrator = Orchestrator::new(config.with_auto_tuning()).await?;
            let results = orchestrator.validate().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for r in &results {
                    println!(
                        "  {}: source={} target={} {}",
                        r.table,
                        r.source_rows,
                        r.target_rows,
                        if r.matches { "OK" } else { "MISMATCH" }
                    );
                }
                println!("Validation completed");
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::new(config).await?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source (MSSQL): {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if result.target_connected { "OK" } else { "FAILED" },
                    result.target_latency_ms
                );
                if let Some(ref err) = result.target_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (Kubernetes/Airflow shutdown).
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
                    tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
                    eprintln!("Shutdown timeout exceeded, exiting");
                    std::process::exit(i32::from(mssql_pg_etl::error::EXIT_CANCELLED));
                });
            }
            Err(e) => eprintln!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Shutting down gracefully (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
            tokio::time::sleep(std::time::Duration::from_secs(shutdown_timeout)).await;
            std::process::exit(i32::from(mssql_pg_etl::error::EXIT_CANCELLED));
        }
    });

    cancel_token
}
