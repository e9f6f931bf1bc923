//! Core traits at the store boundaries.
//!
//! - [`RowSource`]: forward-only cursor over the source store
//! - [`TargetStore`]: the target store, used for queries, metadata lookups and DDL
//! - [`TargetSession`]: one writer's dedicated connection with explicit
//!   transaction control and bulk load primitives
//!
//! The pipeline only depends on these traits. Drivers implement them for
//! SQL Server and PostgreSQL; tests use in-memory implementations.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

use super::column::ColumnType;
use super::record::{RawRecord, TargetRecord};
use super::value::SqlValue;

/// Receiver half of a streaming cursor.
///
/// The source spawns a task that fills the channel, so a full channel
/// applies backpressure to the cursor. An `Err` item ends the stream.
pub type RowStream = mpsc::Receiver<Result<RawRecord>>;

/// Read rows from the source store.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Open a forward-only cursor over `query`.
    ///
    /// `buffer` bounds the number of decoded rows held ahead of the consumer.
    fn open_cursor(&self, query: &str, buffer: usize) -> RowStream;

    /// Count the rows `query` would return.
    async fn count(&self, query: &str) -> Result<i64>;

    /// Round-trip a trivial query to check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Get the database type identifier (e.g., "mssql").
    fn db_type(&self) -> &str;
}

/// Wire format for `COPY ... FROM STDIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Binary,
    /// Pipe-delimited text with `\N` for NULL. With `sanitize`, control
    /// characters are stripped from text values before escaping.
    Text { sanitize: bool },
}

/// Result of probing a unique constraint on a business key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyConstraint {
    /// A unique constraint or index covers exactly the key columns.
    Present,
    /// No constraint exists and the existing data allows creating one.
    Creatable,
    /// Existing rows hold duplicate keys, so no constraint can be created.
    Blocked { duplicate_keys: i64 },
}

/// Staging merge of one batch into a table keyed by `key_columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub table: String,
    /// All loaded columns in record value order.
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    /// Name of the per-session temp table.
    pub staging_table: String,
}

impl MergePlan {
    /// Columns that get overwritten on conflict.
    pub fn update_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !self.key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
            .map(String::as_str)
            .collect()
    }
}

/// Rows inserted vs merged into existing rows by one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl MergeOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Update of existing rows from a staged binary copy, matched by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpdatePlan {
    pub table: String,
    /// All staged columns in record value order (keys included).
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    pub staging_table: String,
    /// Timestamp column set to `CURRENT_TIMESTAMP` on update.
    pub touch_column: Option<String>,
}

/// Keyed single-column update, rendered as one `UPDATE ... SET col = CASE`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseUpdate {
    pub table: String,
    pub key_column: String,
    pub target_column: String,
    /// `(key, new value)` pairs.
    pub assignments: Vec<(SqlValue<'static>, SqlValue<'static>)>,
}

/// Access to the target store outside of writer sessions.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Open a dedicated session for one writer.
    async fn session(&self) -> Result<Box<dyn TargetSession>>;

    /// Run a query and return all rows.
    async fn query(&self, sql: &str) -> Result<Vec<RawRecord>>;

    /// Run a statement and return the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Check whether `key_columns` are covered by a unique constraint.
    async fn key_constraint(&self, table: &str, key_columns: &[String]) -> Result<KeyConstraint>;

    /// Wire types of `columns` of `table`, in the given order.
    async fn column_types(&self, table: &str, columns: &[String]) -> Result<Vec<ColumnType>>;

    /// Create a unique index over `key_columns`.
    async fn create_unique_key(&self, table: &str, key_columns: &[String]) -> Result<()>;

    async fn truncate(&self, table: &str) -> Result<()>;

    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Get the database type identifier (e.g., "postgres").
    fn db_type(&self) -> &str;
}

/// One writer's connection to the target.
///
/// Every load primitive runs inside the transaction opened by [`begin`].
///
/// [`begin`]: TargetSession::begin
#[async_trait]
pub trait TargetSession: Send {
    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Run a query on this session, seeing its uncommitted writes.
    async fn query(&mut self, sql: &str) -> Result<Vec<RawRecord>>;

    /// Run a statement on this session and return the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Stream records into `table` with `COPY ... FROM STDIN`.
    ///
    /// Binary payloads are encoded for the column types of `table`.
    async fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        records: &[TargetRecord],
        format: CopyFormat,
    ) -> Result<u64>;

    /// Copy records into a staging table and merge them with `ON CONFLICT`.
    ///
    /// Records sharing a key within the batch collapse to the last one.
    async fn merge_from_staging(
        &mut self,
        plan: &MergePlan,
        records: &[TargetRecord],
    ) -> Result<MergeOutcome>;

    /// Binary copy records into a staging table, then update matching rows.
    async fn update_from_staging(
        &mut self,
        plan: &StagedUpdatePlan,
        records: &[TargetRecord],
    ) -> Result<u64>;

    /// Check whether a row with the record's key already exists.
    async fn row_exists(
        &mut self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        record: &TargetRecord,
    ) -> Result<bool>;

    async fn insert_row(
        &mut self,
        table: &str,
        columns: &[String],
        record: &TargetRecord,
    ) -> Result<()>;

    /// Update the non-key columns of the row matching the record's key.
    async fn update_row(
        &mut self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        record: &TargetRecord,
    ) -> Result<u64>;

    /// Apply a keyed `CASE` update and return the affected row count.
    async fn apply_case_update(&mut self, update: &CaseUpdate) -> Result<u64>;
}
