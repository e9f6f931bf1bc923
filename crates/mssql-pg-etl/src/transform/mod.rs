//! Per-record transforms.
//!
//! A [`Transform`] maps one [`RawRecord`] to a [`TargetRecord`] using only
//! the record and the read-only [`ReferenceCache`]. It never touches either
//! store. Outcomes the worker pool distinguishes:
//!
//! - `Ok(record)`: append to the current batch
//! - [`TransformError::Skip`]: a validation failure, reported as a skip
//! - [`TransformError::Record`]: a fault confined to this record
//! - [`TransformError::Systemic`]: a fault that makes every later record
//!   meaningless; the load is cancelled

mod mapping;

pub use mapping::MappingTransform;

use thiserror::Error;

use crate::cache::ReferenceCache;
use crate::core::{FieldError, RawRecord, SkipKind, TargetRecord};

/// Why a transform produced no target record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("{reason}")]
    Skip { kind: SkipKind, reason: String },

    #[error("{0}")]
    Record(String),

    #[error("{0}")]
    Systemic(String),
}

impl TransformError {
    pub fn skip(kind: SkipKind, reason: impl Into<String>) -> Self {
        TransformError::Skip {
            kind,
            reason: reason.into(),
        }
    }

    pub fn missing_reference(reason: impl Into<String>) -> Self {
        Self::skip(SkipKind::MissingReference, reason)
    }
}

impl From<FieldError> for TransformError {
    fn from(e: FieldError) -> Self {
        TransformError::Record(e.to_string())
    }
}

/// Pure mapping from a source row to a target row.
pub trait Transform: Send + Sync {
    /// Target columns, in the order of [`TargetRecord::values`].
    fn target_columns(&self) -> &[String];

    /// Identifier of the record for skip reports.
    fn record_id(&self, raw: &RawRecord) -> String;

    fn apply(
        &self,
        raw: &RawRecord,
        caches: &ReferenceCache,
    ) -> Result<TargetRecord, TransformError>;
}

/// Transform built from a closure, for hand-written table mappings.
pub struct FnTransform<F> {
    columns: Vec<String>,
    id_column: Option<String>,
    f: F,
}

impl<F> FnTransform<F>
where
    F: Fn(&RawRecord, &ReferenceCache) -> Result<TargetRecord, TransformError> + Send + Sync,
{
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>, f: F) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            id_column: None,
            f,
        }
    }

    /// Source column rendered into skip reports.
    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = Some(column.into());
        self
    }
}

impl<F> Transform for FnTransform<F>
where
    F: Fn(&RawRecord, &ReferenceCache) -> Result<TargetRecord, TransformError> + Send + Sync,
{
    fn target_columns(&self) -> &[String] {
        &self.columns
    }

    fn record_id(&self, raw: &RawRecord) -> String {
        record_id(raw, self.id_column.as_deref())
    }

    fn apply(
        &self,
        raw: &RawRecord,
        caches: &ReferenceCache,
    ) -> Result<TargetRecord, TransformError> {
        (self.f)(raw, caches)
    }
}

/// Record id from the named column, or the first column.
pub(crate) fn record_id(raw: &RawRecord, id_column: Option<&str>) -> String {
    let value = match id_column {
        Some(column) => raw.value(column).ok(),
        None => raw.values().first(),
    };
    value.map_or_else(|| "<unknown>".to_string(), crate::core::record_id_of)
}
