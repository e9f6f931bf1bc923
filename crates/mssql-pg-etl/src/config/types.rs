//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MSSQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Pipeline sizing and behavior.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Reference caches loaded from the target before any table runs.
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,

    /// Tables to migrate, in order.
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Binary payload tables handled by the attachment job runner.
    #[serde(default)]
    pub attachments: Vec<AttachmentConfig>,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }

    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Look up an attachment table by name.
    pub fn attachment(&self, table: &str) -> Option<&AttachmentConfig> {
        self.attachments
            .iter()
            .find(|a| a.table.eq_ignore_ascii_case(table))
    }
}

/// Source database (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database type (always "mssql").
    #[serde(default = "default_mssql")]
    pub r#type: String,

    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .finish()
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres").
    #[serde(default = "default_postgres")]
    pub r#type: String,

    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Schema used for unqualified table names (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// SSL mode: disable, require, verify-ca, verify-full (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Pipeline sizing and behavior.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Transform workers. Defaults to cores - 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Bulk writers, each with its own target connection. Defaults to
    /// min(4, cores / 2).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writers: Option<usize>,

    /// Records per batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Raw record queue capacity. Defaults to max(1000, workers * 2000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_queue_capacity: Option<usize>,

    /// Batch queue capacity. Defaults to max(4, writers * 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_queue_capacity: Option<usize>,

    /// Report progress every N processed records (default: 100).
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,

    /// Minimum time between forwarded progress events (default: 500 ms).
    #[serde(default = "default_progress_throttle_ms")]
    pub progress_throttle_ms: u64,

    /// Load each table in one transaction with a single writer.
    #[serde(default)]
    pub single_transaction: bool,

    /// Load all tables of a run in one transaction that commits only if
    /// every table succeeds.
    #[serde(default)]
    pub common_transaction: bool,

    /// Keys per CASE update statement in the second pass (default: 500).
    #[serde(default = "default_update_chunk_size")]
    pub update_chunk_size: usize,

    /// Directory for per-table skip/stats exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_dir: Option<PathBuf>,

    /// Maximum MSSQL connections. Auto-tuned if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mssql_connections: Option<usize>,

    /// Maximum PostgreSQL connections. Auto-tuned from writers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pg_connections: Option<usize>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            workers: None,
            writers: None,
            batch_size: default_batch_size(),
            raw_queue_capacity: None,
            batch_queue_capacity: None,
            progress_interval: default_progress_interval(),
            progress_throttle_ms: default_progress_throttle_ms(),
            single_transaction: false,
            common_transaction: false,
            update_chunk_size: default_update_chunk_size(),
            stats_dir: None,
            max_mssql_connections: None,
            max_pg_connections: None,
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores.max(1);

        let workers = *self.workers.get_or_insert(cores.saturating_sub(1).max(1));
        let writers = *self.writers.get_or_insert((cores / 2).clamp(1, 4));

        if self.max_mssql_connections.is_none() {
            self.max_mssql_connections = Some(4);
        }
        if self.max_pg_connections.is_none() {
            self.max_pg_connections = Some((writers + 4).min(64));
        }

        info!(
            "Auto-tuned config: workers={}, writers={}, batch_size={}, mssql_conns={}, pg_conns={}",
            workers,
            writers,
            self.batch_size,
            self.get_max_mssql_connections(),
            self.get_max_pg_connections(),
        );

        self
    }

    // Effective values with fallbacks for configs that were not auto-tuned.

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(2).max(1)
    }

    pub fn get_writers(&self) -> usize {
        self.writers.unwrap_or(2).max(1)
    }

    pub fn get_max_mssql_connections(&self) -> usize {
        self.max_mssql_connections.unwrap_or(4)
    }

    pub fn get_max_pg_connections(&self) -> usize {
        self.max_pg_connections.unwrap_or(8)
    }
}

/// Shape of a reference cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    /// Set of keys from the first column.
    #[default]
    Set,
    /// First column to second column.
    Map,
    /// First `key_columns` columns to the next column.
    Composite,
}

/// A reference cache loaded from the target store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceConfig {
    pub name: String,

    pub query: String,

    #[serde(default)]
    pub kind: ReferenceKind,

    /// Number of key columns for composite caches (default: 2).
    #[serde(default = "default_composite_keys")]
    pub key_columns: usize,

    /// Column that orders duplicate composite keys; the highest value wins.
    /// Without it the first row returned wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_column: Option<String>,
}

/// How a table is written to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Binary COPY into the final table.
    #[default]
    Copy,

    /// Text COPY with escaping, for tables needing sanitized text.
    TextCopy,

    /// Staging table plus ON CONFLICT merge on `key_columns`.
    Merge,
}

/// A migrated table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Name used in logs, reports and on the command line.
    pub name: String,

    /// Query streamed from the source.
    pub source_query: String,

    /// Target table, optionally schema-qualified (default: `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    /// Source column used as the record id in skip reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,

    #[serde(default)]
    pub load: LoadMode,

    /// Business key for merge mode.
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// Strip control characters from text columns (forces text COPY).
    #[serde(default)]
    pub sanitize_text: bool,

    /// Empty the target table before loading.
    #[serde(default)]
    pub truncate_first: bool,

    /// Overrides `migration.batch_size` for this table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    pub columns: Vec<ColumnConfig>,

    /// Second pass for a self or parent reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_reference: Option<ForwardReferenceConfig>,

    /// Statements run after a successful load.
    #[serde(default)]
    pub after_load: Vec<String>,
}

impl TableConfig {
    pub fn target_table(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.name)
    }

    pub fn target_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.target.clone()).collect()
    }
}

/// Target value conversion applied after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastType {
    Smallint,
    Integer,
    Bigint,
    Double,
    Numeric,
    Text,
    Uuid,
    Boolean,
    Timestamp,
    Date,
}

/// Action when a lookup finds no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Skip the record as a missing reference.
    #[default]
    Skip,
    /// Load NULL.
    Null,
    /// Load the column default.
    Default,
}

/// Value lookup through a map or composite cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    pub cache: String,

    /// Source columns forming the lookup key.
    pub keys: Vec<String>,

    #[serde(default)]
    pub on_missing: OnMissing,
}

/// Masking applied to a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    /// Hex SHA-256 digest of the text value.
    Sha256,
    /// First two characters of the local part, the rest starred:
    /// `ab***@example.com`.
    Email,
    /// Every character but the last four starred: `******1234`.
    Phone,
}

/// Mapping of one target column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    /// Target column name.
    pub target: String,

    /// Source column (omit for constant columns).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Skip the record when the value is NULL.
    #[serde(default)]
    pub required: bool,

    /// Set cache that must contain the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupConfig>,

    /// Value used for NULL sources, missing lookups and constant columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cast: Option<CastType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<MaskKind>,

    /// Skip the record when the text or binary payload exceeds this size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,

    /// Skip the record when the text or binary payload is empty.
    #[serde(default)]
    pub reject_empty: bool,

    /// Load NULL now and fill the value in the second pass.
    #[serde(default)]
    pub deferred: bool,
}

/// Second pass update of a deferred column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardReferenceConfig {
    /// Target key column identifying rows in the update (must be mapped).
    pub key_column: String,

    /// Query returning (source reference, target value) pairs, run after
    /// the first pass.
    pub resolve_query: String,
}

/// A binary payload table updated by the attachment job runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Table name accepted by `enqueue`.
    pub table: String,

    /// Query returning the key and payload columns.
    pub source_query: String,

    /// Target table (default: `table`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,

    /// Source column holding the key.
    pub source_key: String,

    /// Source column holding the payload.
    pub source_data: String,

    /// Target key column.
    #[serde(default = "default_id")]
    pub key_column: String,

    /// Target payload column.
    #[serde(default = "default_data")]
    pub data_column: String,

    /// Timestamp column touched on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touch_column: Option<String>,

    /// Largest accepted payload (default: 250 MB).
    #[serde(default = "default_max_attachment_bytes")]
    pub max_bytes: usize,

    /// Payloads per batch (default: 20).
    #[serde(default = "default_attachment_batch_size")]
    pub batch_size: usize,
}

impl AttachmentConfig {
    pub fn target_table(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.table)
    }
}

fn default_mssql() -> String {
    "mssql".to_string()
}

fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_progress_interval() -> u64 {
    100
}

fn default_progress_throttle_ms() -> u64 {
    500
}

fn default_update_chunk_size() -> usize {
    500
}

fn default_composite_keys() -> usize {
    2
}

fn default_id() -> String {
    "id".to_string()
}

fn default_data() -> String {
    "data".to_string()
}

fn default_max_attachment_bytes() -> usize {
    250 * 1024 * 1024
}

fn default_attachment_batch_size() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_tuning_defaults() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 8,
        };
        let tuned = MigrationConfig::default().with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(7));
        assert_eq!(tuned.writers, Some(4));
        assert_eq!(tuned.max_pg_connections, Some(8));

        let single = SystemResources {
            total_memory_gb: 2.0,
            cpu_cores: 1,
        };
        let tuned = MigrationConfig::default().with_auto_tuning(&single);
        assert_eq!(tuned.workers, Some(1));
        assert_eq!(tuned.writers, Some(1));
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_values() {
        let resources = SystemResources {
            total_memory_gb: 16.0,
            cpu_cores: 8,
        };
        let config = MigrationConfig {
            workers: Some(3),
            writers: Some(1),
            ..Default::default()
        };
        let tuned = config.with_auto_tuning(&resources);
        assert_eq!(tuned.workers, Some(3));
        assert_eq!(tuned.writers, Some(1));
    }
}
