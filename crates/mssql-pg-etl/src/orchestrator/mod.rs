//! Migration orchestrator - runs configured tables and attachment jobs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, TableConfig};
use crate::core::{RowSource, TargetStore};
use crate::drivers::{MssqlSource, PgStore};
use crate::error::{MigrateError, Result};
use crate::jobs::{AttachmentJobService, JobState, JobStatus};
use crate::pipeline::{Pipeline, PipelineOptions, TablePlan};
use crate::report::{
    JsonLinesReporter, ProgressReporter, RunSummary, StatsExport, Throttled, TracingReporter,
};
use crate::transform::{MappingTransform, Transform};

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn RowSource>,
    target: Arc<dyn TargetStore>,
    progress: bool,
    stats_dir: Option<PathBuf>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// "completed" or "dry_run".
    pub status: String,

    /// SHA-256 of the configuration the run used.
    pub config_hash: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub rows_processed: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_skipped: u64,

    /// Average insert throughput (rows/second).
    pub rows_per_second: i64,

    /// Per-table summaries, in run order.
    pub tables: Vec<RunSummary>,

    /// Per-table plans of a dry run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<DryRunTable>,
}

/// What a dry run would do for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunTable {
    pub table: String,
    pub target_table: String,
    pub strategy: String,
    pub writers: usize,
    /// Source rows, when the count query succeeds.
    pub source_rows: Option<i64>,
    /// Entries per loaded reference cache.
    pub caches: BTreeMap<String, usize>,
}

/// Source and target row counts of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableValidation {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
    pub matches: bool,
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
}

impl Orchestrator {
    /// Connect to both stores.
    pub async fn new(config: Config) -> Result<Self> {
        let mssql_pool_size = config.migration.get_max_mssql_connections() as u32;
        let source = MssqlSource::new(&config.source, mssql_pool_size).await?;

        let max_conns = config.migration.get_max_pg_connections();
        let target = PgStore::new(&config.target, max_conns).await?;

        Ok(Self::with_stores(config, Arc::new(source), Arc::new(target)))
    }

    /// Use already connected stores.
    pub fn with_stores(
        config: Config,
        source: Arc<dyn RowSource>,
        target: Arc<dyn TargetStore>,
    ) -> Self {
        let stats_dir = config.migration.stats_dir.clone();
        Self {
            config,
            source,
            target,
            progress: false,
            stats_dir,
        }
    }

    /// Emit progress as JSON lines on stderr instead of log lines.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Override the stats directory from the configuration.
    pub fn with_stats_dir(mut self, dir: Option<PathBuf>) -> Self {
        if dir.is_some() {
            self.stats_dir = dir;
        }
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn pipeline(&self) -> Pipeline {
        let interval = Duration::from_millis(self.config.migration.progress_throttle_ms);
        let reporter: Arc<dyn ProgressReporter> = if self.progress {
            Arc::new(Throttled::new(JsonLinesReporter::stderr(), interval))
        } else {
            Arc::new(Throttled::new(TracingReporter, interval))
        };
        Pipeline::new(self.source.clone(), self.target.clone()).with_reporter(reporter)
    }

    /// Configured tables named in `only`, or all of them, in config order.
    fn selected_tables(&self, only: &[String]) -> Result<Vec<&TableConfig>> {
        if only.is_empty() {
            return Ok(self.config.tables.iter().collect());
        }
        only.iter()
            .map(|name| {
                self.config
                    .table(name)
                    .ok_or_else(|| MigrateError::Config(format!("unknown table '{}'", name)))
            })
            .collect()
    }

    /// Load the selected tables one after another.
    ///
    /// A table that aborts stops the run; its error carries the partial
    /// summary. With `dry_run`, caches are loaded and strategies selected
    /// but nothing is written. With `migration.common_transaction` every
    /// table loads into one transaction that commits only if all succeed.
    pub async fn run(
        &self,
        only: &[String],
        cancel: CancellationToken,
        dry_run: bool,
    ) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let tables = self.selected_tables(only)?;
        info!(
            "Starting {} {}: {} tables",
            if dry_run { "dry run" } else { "migration run" },
            run_id,
            tables.len()
        );

        let pipeline = self.pipeline();
        let mut summaries = Vec::with_capacity(tables.len());
        let mut plans = Vec::new();

        if self.config.migration.common_transaction && !dry_run {
            let loads = tables
                .into_iter()
                .map(|table| {
                    let transform: Arc<dyn Transform> = Arc::new(MappingTransform::new(table)?);
                    Ok((TablePlan::from_config(table, &self.config), transform))
                })
                .collect::<Result<Vec<_>>>()?;
            let run = pipeline.run_in_transaction(loads, cancel.clone()).await;
            for summary in &run.summaries {
                self.export_stats(summary);
            }
            summaries = run.into_result()?;
        } else {
            for table in tables {
                if cancel.is_cancelled() {
                    return Err(MigrateError::Cancelled);
                }
                let plan = TablePlan::from_config(table, &self.config);
                let transform = Arc::new(MappingTransform::new(table)?);

                if dry_run {
                    let columns = transform.target_columns().to_vec();
                    plans.push(self.dry_run_table(&pipeline, &plan, &columns).await?);
                    continue;
                }

                match pipeline.run(&plan, transform, cancel.clone()).await {
                    Ok(summary) => {
                        self.export_stats(&summary);
                        summaries.push(summary);
                    }
                    Err(e) => {
                        if let Some(summary) = e.summary() {
                            self.export_stats(summary);
                        }
                        return Err(e);
                    }
                }
            }
        }

        let completed_at = Utc::now();
        let duration_seconds = started.elapsed().as_secs_f64();
        let rows_inserted: u64 = summaries.iter().map(|s| s.inserted).sum();
        let result = MigrationResult {
            run_id,
            status: if dry_run { "dry_run" } else { "completed" }.to_string(),
            config_hash: self.config.hash(),
            started_at,
            completed_at,
            duration_seconds,
            tables_total: summaries.len().max(plans.len()),
            rows_processed: summaries.iter().map(|s| s.total).sum(),
            rows_inserted,
            rows_updated: summaries.iter().map(|s| s.updated).sum(),
            rows_skipped: summaries.iter().map(|s| s.skipped).sum(),
            rows_per_second: if duration_seconds > 0.0 {
                (rows_inserted as f64 / duration_seconds) as i64
            } else {
                0
            },
            tables: summaries,
            plans,
        };

        info!(
            "Migration {}: {} tables, {} rows inserted, {} skipped in {:.1}s ({} rows/s)",
            result.status,
            result.tables_total,
            result.rows_inserted,
            result.rows_skipped,
            result.duration_seconds,
            result.rows_per_second
        );
        Ok(result)
    }

    async fn dry_run_table(
        &self,
        pipeline: &Pipeline,
        plan: &TablePlan,
        columns: &[String],
    ) -> Result<DryRunTable> {
        let prepared = pipeline.prepare(plan, columns, true).await?;
        let source_rows = match self.source.count(&plan.source_query).await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("{}: source count failed: {}", plan.name, e);
                None
            }
        };
        let caches = plan
            .caches
            .iter()
            .map(|spec| (spec.name.clone(), prepared.caches.len(&spec.name)))
            .collect();
        info!(
            "{}: would load into {} with {} ({} writers)",
            plan.name, plan.target_table, prepared.strategy, prepared.writers
        );
        Ok(DryRunTable {
            table: plan.name.clone(),
            target_table: plan.target_table.clone(),
            strategy: prepared.strategy.name().to_string(),
            writers: prepared.writers,
            source_rows,
            caches,
        })
    }

    fn export_stats(&self, summary: &RunSummary) {
        let Some(dir) = &self.stats_dir else {
            return;
        };
        match StatsExport::new(dir).write(summary) {
            Ok((csv, _)) => info!("{}: stats written to {}", summary.table, csv.display()),
            Err(e) => warn!("{}: failed to write stats: {}", summary.table, e),
        }
    }

    /// Queue one attachment job per table and wait for all of them.
    ///
    /// Returns the final status of every job; failed jobs are reported in
    /// their status rather than as an error.
    pub async fn run_attachments(
        &self,
        only: &[String],
        correlation_id: &str,
        cancel: CancellationToken,
    ) -> Result<Vec<JobStatus>> {
        let tables: Vec<String> = if only.is_empty() {
            self.config
                .attachments
                .iter()
                .map(|a| a.table.clone())
                .collect()
        } else {
            only.to_vec()
        };

        let runner_cancel = cancel.child_token();
        let (service, runner) = AttachmentJobService::start(
            self.source.clone(),
            self.target.clone(),
            &self.config.attachments,
            PipelineOptions::from_config(&self.config),
            runner_cancel.clone(),
        );
        let mut events = service.subscribe(correlation_id);

        let job_ids = tables
            .iter()
            .map(|table| service.enqueue(table, correlation_id))
            .collect::<Result<Vec<_>>>()?;
        info!("Queued {} attachment jobs ({})", job_ids.len(), correlation_id);

        let all_terminal = |service: &AttachmentJobService| {
            job_ids.iter().all(|id| {
                service
                    .status(*id)
                    .map_or(true, |status| status.state.is_terminal())
            })
        };
        while !all_terminal(&service) {
            match events.recv().await {
                Some(status) if status.state.is_terminal() => info!(
                    "Attachment job {} ({}): {:?}, {}/{} files, {} skipped",
                    status.job_id,
                    status.table,
                    status.state,
                    status.processed_files,
                    status.total_files,
                    status.skipped_files
                ),
                Some(_) => {}
                None => break,
            }
        }

        runner_cancel.cancel();
        if let Err(e) = runner.await {
            warn!("attachment job runner ended abnormally: {}", e);
        }

        let statuses: Vec<JobStatus> = job_ids
            .iter()
            .filter_map(|id| service.status(*id))
            .collect();
        let failed = statuses
            .iter()
            .filter(|s| s.state == JobState::Failed)
            .count();
        if failed > 0 {
            warn!("{} of {} attachment jobs failed", failed, statuses.len());
        }
        Ok(statuses)
    }

    /// Compare source query counts with target row counts.
    pub async fn validate(&self) -> Result<Vec<TableValidation>> {
        let mut results = Vec::with_capacity(self.config.tables.len());
        for table in &self.config.tables {
            let plan = TablePlan::from_config(table, &self.config);
            let source_rows = self.source.count(&plan.source_query).await?;
            let target_rows = self.target.row_count(&plan.target_table).await?;
            let matches = source_rows == target_rows;
            if matches {
                info!("{}: {} rows (match)", table.name, source_rows);
            } else {
                warn!(
                    "{}: source={} target={} (MISMATCH)",
                    table.name, source_rows, target_rows
                );
            }
            results.push(TableValidation {
                table: table.name.clone(),
                source_rows,
                target_rows,
                matches,
            });
        }
        Ok(results)
    }

    /// Ping both stores and time the round trips.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let started = Instant::now();
        let source = self.source.ping().await;
        let source_latency_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let target = self.target.execute("SELECT 1").await;
        let target_latency_ms = started.elapsed().as_millis() as u64;

        Ok(HealthCheckResult {
            healthy: source.is_ok() && target.is_ok(),
            source_connected: source.is_ok(),
            source_latency_ms,
            source_error: source.err().map(|e| e.to_string()),
            target_connected: target.is_ok(),
            target_latency_ms,
            target_error: target.err().map(|e| e.to_string()),
        })
    }
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SqlNullType, SqlValue};
    use crate::testing::{raw_rows, MemorySource, MemoryStore};

    const CONFIG: &str = r#"
source:
  host: mssql.internal
  database: Legacy
  user: sa
target:
  host: pg.internal
  database: app
  user: app
migration:
  workers: 2
  writers: 1
  batch_size: 10
references:
  - name: user_ids
    query: SELECT id FROM users
tables:
  - name: events
    source_query: SELECT Id, OwnerId, Title FROM dbo.Events
    id_column: Id
    columns:
      - target: id
        source: Id
      - target: owner_id
        source: OwnerId
        reference: user_ids
      - target: title
        source: Title
attachments:
  - table: documents
    source_query: SELECT DocumentId, Payload FROM dbo.Documents
    source_key: DocumentId
    source_data: Payload
    key_column: id
    data_column: payload
    max_bytes: 16
"#;

    const EVENTS: &str = "SELECT Id, OwnerId, Title FROM dbo.Events";

    fn fixture() -> (Config, MemorySource, MemoryStore) {
        let config = Config::from_yaml(CONFIG).unwrap();
        let rows = (1..=25i64)
            .map(|id| {
                let owner = if id % 5 == 0 { 100 + id } else { 1 + id % 3 };
                vec![
                    SqlValue::I64(id),
                    SqlValue::I64(owner),
                    SqlValue::text_owned(format!("event {}", id)),
                ]
            })
            .collect();
        let source = MemorySource::new().with_rows(EVENTS, &["Id", "OwnerId", "Title"], rows);

        let store = MemoryStore::new();
        store.create_table("public.events", &["id", "owner_id", "title"]);
        store.set_query_result(
            "SELECT id FROM users",
            raw_rows(&["id"], (1..=3i64).map(|i| vec![SqlValue::I64(i)]).collect()),
        );
        (config, source, store)
    }

    fn orchestrator(config: Config, source: MemorySource, store: &MemoryStore) -> Orchestrator {
        Orchestrator::with_stores(config, Arc::new(source), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_run_loads_tables_and_exports_stats() {
        let (config, source, store) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(config, source, &store)
            .with_stats_dir(Some(dir.path().to_path_buf()));

        let result = orch.run(&[], CancellationToken::new(), false).await.unwrap();
        assert_eq!(result.status, "completed");
        assert_eq!(result.tables_total, 1);
        assert_eq!(result.rows_processed, 25);
        assert_eq!(result.rows_inserted, 20);
        assert_eq!(result.rows_skipped, 5);
        assert_eq!(store.rows("public.events").len(), 20);
        assert!(dir.path().join("events_stats.csv").exists());
        assert!(dir.path().join("events_stats.json").exists());

        let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["tables"][0]["skipped"], 5);
        assert!(json.get("plans").is_none());
    }

    #[tokio::test]
    async fn test_common_transaction_rolls_back_on_failure() {
        let (mut config, source, store) = fixture();
        config.migration.common_transaction = true;
        store.fail_batches_with("7");
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(config, source, &store)
            .with_stats_dir(Some(dir.path().to_path_buf()));

        let err = orch.run(&[], CancellationToken::new(), false).await.unwrap_err();
        assert!(err.to_string().contains("injected failure at record 7"));
        let summary = err.summary().unwrap();
        assert_eq!(summary.inserted, 0);
        assert!(summary.is_conserved());
        assert!(store.rows("public.events").is_empty());
        assert!(dir.path().join("events_stats.csv").exists());
    }

    #[tokio::test]
    async fn test_common_transaction_commits() {
        let (mut config, source, store) = fixture();
        config.migration.common_transaction = true;
        let orch = orchestrator(config, source, &store);

        let result = orch.run(&[], CancellationToken::new(), false).await.unwrap();
        assert_eq!(result.rows_inserted, 20);
        assert_eq!(store.rows("public.events").len(), 20);
        assert_eq!(store.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (config, source, store) = fixture();
        let orch = orchestrator(config, source, &store);

        let result = orch.run(&[], CancellationToken::new(), true).await.unwrap();
        assert_eq!(result.status, "dry_run");
        assert_eq!(result.plans.len(), 1);
        let plan = &result.plans[0];
        assert_eq!(plan.target_table, "public.events");
        assert_eq!(plan.strategy, "binary_copy");
        assert_eq!(plan.source_rows, Some(25));
        assert_eq!(plan.caches["user_ids"], 3);
        assert!(store.rows("public.events").is_empty());
        assert!(store.batch_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_table_is_config_error() {
        let (config, source, store) = fixture();
        let orch = orchestrator(config, source, &store);
        let err = orch
            .run(&["missing".to_string()], CancellationToken::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (config, source, store) = fixture();
        let orch = orchestrator(config, source, &store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orch.run(&[], cancel, false).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.rows("public.events").is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_mismatch() {
        let (config, source, store) = fixture();
        store.insert_rows(
            "public.events",
            vec![vec![
                SqlValue::I64(1),
                SqlValue::Null(SqlNullType::I64),
                SqlValue::text_owned("seed"),
            ]],
        );
        let orch = orchestrator(config, source, &store);
        let results = orch.validate().await.unwrap();
        assert_eq!(
            results,
            vec![TableValidation {
                table: "events".into(),
                source_rows: 25,
                target_rows: 1,
                matches: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let (config, source, store) = fixture();
        let orch = orchestrator(config, source, &store);
        let health = orch.health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.source_connected && health.target_connected);
        assert!(health.source_error.is_none());
    }

    #[tokio::test]
    async fn test_attachments_run_to_completion() {
        let (config, _, store) = fixture();
        let payloads = (1..=6i64)
            .map(|id| {
                let payload = if id == 4 { vec![0u8; 32] } else { vec![id as u8; 4] };
                vec![SqlValue::I64(id), SqlValue::bytes_owned(payload)]
            })
            .collect();
        let source = MemorySource::new().with_rows(
            "SELECT DocumentId, Payload FROM dbo.Documents",
            &["DocumentId", "Payload"],
            payloads,
        );
        store.create_table("documents", &["id", "payload"]);
        store.insert_rows(
            "documents",
            (1..=6i64)
                .map(|id| vec![SqlValue::I64(id), SqlValue::Null(SqlNullType::Bytes)])
                .collect(),
        );

        let orch = orchestrator(config, source, &store);
        let statuses = orch
            .run_attachments(&[], "batch-1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, JobState::Completed);
        assert_eq!(statuses[0].processed_files, 5);
        assert_eq!(statuses[0].skipped_files, 1);

        let failed = orch
            .run_attachments(&["photos".to_string()], "batch-2", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(failed[0].state, JobState::Failed);
    }
}
