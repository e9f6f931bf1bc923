//! # mssql-pg-etl
//!
//! Parallel bulk ETL from Microsoft SQL Server into PostgreSQL.
//!
//! Each table load runs as a bounded-queue pipeline:
//!
//! - **Reader** streams a source query into the raw record queue
//! - **Transform workers** resolve references against pre-loaded caches and
//!   build fixed-size batches, turning bad records into skip records
//! - **Bulk writers** load batches with binary COPY, text COPY, a staging
//!   table merge, row-by-row upserts or staged updates
//!
//! Every record taken from the source is either loaded or reported as
//! skipped, including when the run is cancelled.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_pg_etl::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> mssql_pg_etl::Result<()> {
//! let config = Config::load("config.yaml")?.with_auto_tuning();
//! let orchestrator = Orchestrator::new(config).await?;
//! let result = orchestrator.run(&[], CancellationToken::new(), false).await?;
//! println!("Inserted {} rows", result.rows_inserted);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod jobs;
pub mod load;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod transform;

#[cfg(test)]
pub mod testing;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, SourceConfig, TargetConfig};
pub use error::{MigrateError, Result};
pub use jobs::{AttachmentJobService, JobRetention, JobState, JobStatus};
pub use orchestrator::{
    DryRunTable, HealthCheckResult, MigrationResult, Orchestrator, TableValidation,
};
pub use pipeline::{Pipeline, PipelineOptions, TablePlan, TransactionRun};
pub use report::{ProgressReporter, RunSummary};
