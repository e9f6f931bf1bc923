//! Records flowing through the pipeline.
//!
//! A [`RawRecord`] is produced by the source cursor and consumed by exactly
//! one transform worker. A worker turns it into either a [`TargetRecord`]
//! or a [`SkipRecord`]. Target records are grouped into a [`Batch`] which is
//! moved whole from the worker to a bulk writer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::value::{FromSqlValue, SqlNullType, SqlValue};

/// Column layout shared by every record of one cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSchema {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl RecordSchema {
    /// Build a schema from column names. Lookups are case-insensitive.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.to_lowercase(), i))
            .collect();
        Self { columns, index }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(&column.to_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Typed field access failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("column '{column}' holds {found}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// One source row with typed, nullable-aware accessors.
#[derive(Debug, Clone)]
pub struct RawRecord {
    schema: Arc<RecordSchema>,
    values: Vec<SqlValue<'static>>,
}

impl RawRecord {
    pub fn new(schema: Arc<RecordSchema>, values: Vec<SqlValue<'static>>) -> Self {
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<RecordSchema> {
        &self.schema
    }

    /// Raw value of a column.
    pub fn value(&self, column: &str) -> Result<&SqlValue<'static>, FieldError> {
        self.schema
            .position(column)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| FieldError::UnknownColumn(column.to_string()))
    }

    /// Typed value of a column; `Ok(None)` for NULL.
    pub fn get<T: FromSqlValue>(&self, column: &str) -> Result<Option<T>, FieldError> {
        let value = self.value(column)?;
        if value.is_null() {
            return Ok(None);
        }
        T::from_sql_value(value)
            .map(Some)
            .ok_or_else(|| FieldError::TypeMismatch {
                column: column.to_string(),
                expected: T::EXPECTED,
                found: value.null_type().name(),
            })
    }

    /// Positional access in cursor column order.
    pub fn values(&self) -> &[SqlValue<'static>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue<'static>> {
        self.values
    }
}

/// Forward reference held back for the second pass of a parent/child load.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredRef {
    /// Business key of the row that carries the reference.
    pub key: SqlValue<'static>,
    /// Unresolved source value of the reference.
    pub reference: SqlValue<'static>,
}

/// A record ready to be loaded, values in target column order.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    /// Source identifier used for skip reporting.
    pub record_id: String,
    pub values: Vec<SqlValue<'static>>,
    pub deferred: Option<DeferredRef>,
}

impl TargetRecord {
    pub fn new(record_id: impl Into<String>, values: Vec<SqlValue<'static>>) -> Self {
        Self {
            record_id: record_id.into(),
            values,
            deferred: None,
        }
    }

    pub fn with_deferred(mut self, deferred: DeferredRef) -> Self {
        self.deferred = Some(deferred);
        self
    }
}

/// An ordered group of target records, never split once queued.
#[derive(Debug)]
pub struct Batch {
    pub records: Vec<TargetRecord>,
    /// Worker that assembled the batch.
    pub worker_id: usize,
    /// Per-worker sequence number.
    pub seq: u64,
}

impl Batch {
    pub fn new(records: Vec<TargetRecord>, worker_id: usize, seq: u64) -> Self {
        Self {
            records,
            worker_id,
            seq,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Row values in target column order.
    pub fn rows(&self) -> impl Iterator<Item = &[SqlValue<'static>]> {
        self.records.iter().map(|r| r.values.as_slice())
    }
}

/// Why a record was not loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    /// A required foreign reference is not in the reference cache.
    MissingReference,
    /// A required field is NULL or empty.
    MissingRequired,
    /// A payload exceeds its size limit.
    Oversized,
    /// The transform rejected the record for a business rule.
    Rejected,
    /// The transform failed on this record.
    TransformFault,
    /// The batch holding the record failed to load.
    BatchFailed,
    /// The record was in flight when the load was cancelled.
    Cancelled,
}

impl fmt::Display for SkipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipKind::MissingReference => "missing_reference",
            SkipKind::MissingRequired => "missing_required",
            SkipKind::Oversized => "oversized",
            SkipKind::Rejected => "rejected",
            SkipKind::TransformFault => "transform_fault",
            SkipKind::BatchFailed => "batch_failed",
            SkipKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A record that did not make it into the target, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub record_id: String,
    pub kind: SkipKind,
    pub reason: String,
}

impl SkipRecord {
    pub fn new(record_id: impl Into<String>, kind: SkipKind, reason: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// Render a value as a record identifier for skip reports.
pub fn record_id_of(value: &SqlValue<'_>) -> String {
    match value {
        SqlValue::Null(_) => "<null>".to_string(),
        SqlValue::Text(s) => s.to_string(),
        SqlValue::Uuid(u) => u.to_string(),
        other => match other.as_i64() {
            Some(v) => v.to_string(),
            None => other.to_sql_literal(),
        },
    }
}

/// Typed NULL for a column whose type is unknown at construction.
pub const NULL_TEXT: SqlValue<'static> = SqlValue::Null(SqlNullType::String);

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RawRecord {
        let schema = Arc::new(RecordSchema::new(["Id", "Name", "ParentId"]));
        RawRecord::new(
            schema,
            vec![
                SqlValue::I32(7),
                SqlValue::text_owned("Acme"),
                SqlValue::Null(SqlNullType::I32),
            ],
        )
    }

    #[test]
    fn test_typed_accessors() {
        let r = record();
        assert_eq!(r.get::<i64>("id").unwrap(), Some(7));
        assert_eq!(r.get::<String>("NAME").unwrap(), Some("Acme".to_string()));
        assert_eq!(r.get::<i64>("ParentId").unwrap(), None);
    }

    #[test]
    fn test_unknown_column_and_mismatch() {
        let r = record();
        assert_eq!(
            r.get::<i64>("missing"),
            Err(FieldError::UnknownColumn("missing".into()))
        );
        let err = r.get::<i64>("Name").unwrap_err();
        assert!(err.to_string().contains("expected bigint"));
    }

    #[test]
    fn test_record_id_rendering() {
        assert_eq!(record_id_of(&SqlValue::I64(42)), "42");
        assert_eq!(record_id_of(&SqlValue::text_owned("abc")), "abc");
        assert_eq!(record_id_of(&NULL_TEXT), "<null>");
    }
}
