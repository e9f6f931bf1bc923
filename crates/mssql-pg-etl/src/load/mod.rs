//! Bulk load strategies for the PostgreSQL target.
//!
//! The strategy is chosen once per table by [`select_strategy`] and then
//! applied to every batch by a [`BulkWriter`]:
//!
//! - [`LoadStrategy::BinaryCopy`]: `COPY ... (FORMAT BINARY)` into the table,
//!   each field encoded for its target column type
//! - [`LoadStrategy::TextCopy`]: pipe-delimited text COPY with escaping
//! - [`LoadStrategy::StagingMerge`]: text COPY into a temp table, then
//!   `INSERT ... ON CONFLICT` on the business key
//! - [`LoadStrategy::RowByRow`]: existence check then `UPDATE` or `INSERT`,
//!   used when no unique constraint can back the merge
//! - [`LoadStrategy::StagedUpdate`]: binary COPY into a temp table, then
//!   `UPDATE ... FROM` existing rows (attachment payloads)

pub mod binary_copy;
pub mod sql;
pub mod text_copy;
pub mod two_pass;
mod writer;

pub use two_pass::{case_updates, TwoPassOutcome, TwoPassStage};
pub use writer::{BatchOutcome, BatchState, BulkWriter, LoadCount};

use std::fmt;

use tracing::{info, warn};

use crate::config::LoadMode;
use crate::core::{KeyConstraint, TargetStore};
use crate::error::Result;

/// How batches of one table reach the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStrategy {
    BinaryCopy,
    TextCopy {
        sanitize: bool,
    },
    StagingMerge {
        key_columns: Vec<String>,
    },
    RowByRow {
        key_columns: Vec<String>,
    },
    StagedUpdate {
        key_columns: Vec<String>,
        touch_column: Option<String>,
    },
}

impl LoadStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LoadStrategy::BinaryCopy => "binary_copy",
            LoadStrategy::TextCopy { .. } => "text_copy",
            LoadStrategy::StagingMerge { .. } => "staging_merge",
            LoadStrategy::RowByRow { .. } => "row_by_row",
            LoadStrategy::StagedUpdate { .. } => "staged_update",
        }
    }

    /// Row-by-row checks are only correct with one writer per table.
    pub fn requires_single_writer(&self) -> bool {
        matches!(self, LoadStrategy::RowByRow { .. })
    }

    /// Whether re-running a batch leaves the target unchanged.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, LoadStrategy::BinaryCopy | LoadStrategy::TextCopy { .. })
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategy::StagingMerge { key_columns }
            | LoadStrategy::RowByRow { key_columns }
            | LoadStrategy::StagedUpdate { key_columns, .. } => {
                write!(f, "{} ({})", self.name(), key_columns.join(", "))
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Inputs to strategy selection for one table.
#[derive(Debug, Clone)]
pub struct StrategyRequest<'a> {
    pub table: &'a str,
    /// Loaded columns, in record value order.
    pub columns: &'a [String],
    pub mode: LoadMode,
    pub key_columns: &'a [String],
    pub sanitize_text: bool,
    /// Check only; never create a missing unique index.
    pub dry_run: bool,
}

/// Choose the load strategy for a table.
///
/// Copy loads use binary COPY unless a target column has a type the binary
/// encoder cannot produce. Merge loads check the unique constraint on the
/// business key first. A missing constraint is created when existing data
/// allows it; otherwise the table degrades to row-by-row loading.
pub async fn select_strategy(
    store: &dyn TargetStore,
    request: &StrategyRequest<'_>,
) -> Result<LoadStrategy> {
    let strategy = match request.mode {
        LoadMode::Copy if request.sanitize_text => LoadStrategy::TextCopy { sanitize: true },
        LoadMode::Copy => {
            let types = store.column_types(request.table, request.columns).await?;
            let unsupported: Vec<String> = request
                .columns
                .iter()
                .zip(&types)
                .filter(|(_, ty)| !ty.is_binary_encodable())
                .map(|(column, ty)| format!("{} {}", column, ty))
                .collect();
            if unsupported.is_empty() {
                LoadStrategy::BinaryCopy
            } else {
                warn!(
                    "{}: no binary encoding for ({}), using text COPY",
                    request.table,
                    unsupported.join(", ")
                );
                LoadStrategy::TextCopy { sanitize: false }
            }
        }
        LoadMode::TextCopy => LoadStrategy::TextCopy {
            sanitize: request.sanitize_text,
        },
        LoadMode::Merge => {
            let key_columns = request.key_columns.to_vec();
            match store.key_constraint(request.table, &key_columns).await? {
                KeyConstraint::Present => LoadStrategy::StagingMerge { key_columns },
                KeyConstraint::Creatable if request.dry_run => {
                    info!(
                        "{}: unique key ({}) would be created",
                        request.table,
                        key_columns.join(", ")
                    );
                    LoadStrategy::StagingMerge { key_columns }
                }
                KeyConstraint::Creatable => {
                    match store.create_unique_key(request.table, &key_columns).await {
                        Ok(()) => {
                            info!(
                                "{}: created unique key ({})",
                                request.table,
                                key_columns.join(", ")
                            );
                            LoadStrategy::StagingMerge { key_columns }
                        }
                        Err(e) => {
                            warn!(
                                "{}: could not create unique key ({}), loading row by row: {}",
                                request.table,
                                key_columns.join(", "),
                                e
                            );
                            LoadStrategy::RowByRow { key_columns }
                        }
                    }
                }
                KeyConstraint::Blocked { duplicate_keys } => {
                    warn!(
                        "{}: {} duplicate keys block a unique key on ({}), loading row by row",
                        request.table,
                        duplicate_keys,
                        key_columns.join(", ")
                    );
                    LoadStrategy::RowByRow { key_columns }
                }
            }
        }
    };
    Ok(strategy)
}
