//! Per-batch loading with transaction control.

use std::fmt;

use tracing::{debug, warn};

use super::sql::bare_table;
use super::LoadStrategy;
use crate::core::{
    Batch, CopyFormat, DeferredRef, MergePlan, SkipKind, SkipRecord, StagedUpdatePlan,
    TargetRecord, TargetSession,
};
use crate::error::Result;

/// Lifecycle of one batch inside a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Received,
    Loading,
    Committed,
    Failed,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Received => "received",
            BatchState::Loading => "loading",
            BatchState::Committed => "committed",
            BatchState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rows written by one load call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCount {
    pub inserted: u64,
    pub updated: u64,
}

/// Terminal result of one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub state: BatchState,
    pub count: LoadCount,
    /// Every record of a failed batch.
    pub skipped: Vec<SkipRecord>,
    /// Forward references carried by a committed batch.
    pub deferred: Vec<DeferredRef>,
    pub error: Option<String>,
}

/// Applies one load strategy to batches of one table.
#[derive(Debug, Clone)]
pub struct BulkWriter {
    table: String,
    columns: Vec<String>,
    strategy: LoadStrategy,
    staging_table: String,
}

impl BulkWriter {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        strategy: LoadStrategy,
        writer_id: usize,
    ) -> Self {
        let table = table.into();
        let staging_table = format!("_staging_{}_{}", bare_table(&table), writer_id);
        Self {
            table,
            columns,
            strategy,
            staging_table,
        }
    }

    pub fn strategy(&self) -> &LoadStrategy {
        &self.strategy
    }

    /// Load and commit one batch in its own transaction.
    ///
    /// A failure rolls the transaction back and turns every record of the
    /// batch into a [`SkipKind::BatchFailed`] skip. The session should be
    /// replaced afterwards.
    pub async fn write(&self, session: &mut dyn TargetSession, batch: &Batch) -> BatchOutcome {
        debug!(
            "{}: batch {}/{} ({} records) {}",
            self.table,
            batch.worker_id,
            batch.seq,
            batch.len(),
            BatchState::Received
        );

        let result = async {
            session.begin().await?;
            debug!(
                "{}: batch {}/{} {}",
                self.table,
                batch.worker_id,
                batch.seq,
                BatchState::Loading
            );
            let count = self.load(session, &batch.records).await?;
            session.commit().await?;
            Ok::<_, crate::error::MigrateError>(count)
        }
        .await;

        match result {
            Ok(count) => {
                debug!(
                    "{}: batch {}/{} {} ({} inserted, {} updated)",
                    self.table,
                    batch.worker_id,
                    batch.seq,
                    BatchState::Committed,
                    count.inserted,
                    count.updated
                );
                BatchOutcome {
                    state: BatchState::Committed,
                    count,
                    skipped: Vec::new(),
                    deferred: collect_deferred(&batch.records),
                    error: None,
                }
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    debug!("{}: rollback failed: {}", self.table, rollback);
                }
                let message = e.to_string();
                warn!(
                    "{}: batch {}/{} {} ({} records skipped): {}",
                    self.table,
                    batch.worker_id,
                    batch.seq,
                    BatchState::Failed,
                    batch.len(),
                    message
                );
                BatchOutcome {
                    state: BatchState::Failed,
                    count: LoadCount::default(),
                    skipped: failed_batch_skips(&batch.records, &message),
                    deferred: Vec::new(),
                    error: Some(message),
                }
            }
        }
    }

    /// Apply the strategy to `records` inside the caller's transaction.
    pub async fn load(
        &self,
        session: &mut dyn TargetSession,
        records: &[TargetRecord],
    ) -> Result<LoadCount> {
        if records.is_empty() {
            return Ok(LoadCount::default());
        }

        match &self.strategy {
            LoadStrategy::BinaryCopy => {
                let n = session
                    .copy_in(&self.table, &self.columns, records, CopyFormat::Binary)
                    .await?;
                Ok(LoadCount {
                    inserted: n,
                    updated: 0,
                })
            }
            LoadStrategy::TextCopy { sanitize } => {
                let n = session
                    .copy_in(
                        &self.table,
                        &self.columns,
                        records,
                        CopyFormat::Text {
                            sanitize: *sanitize,
                        },
                    )
                    .await?;
                Ok(LoadCount {
                    inserted: n,
                    updated: 0,
                })
            }
            LoadStrategy::StagingMerge { key_columns } => {
                let plan = MergePlan {
                    table: self.table.clone(),
                    columns: self.columns.clone(),
                    key_columns: key_columns.clone(),
                    staging_table: self.staging_table.clone(),
                };
                let outcome = session.merge_from_staging(&plan, records).await?;
                // A record overtaken by a later one with the same key in this
                // batch still replaced a row.
                let superseded = (records.len() as u64).saturating_sub(outcome.total());
                Ok(LoadCount {
                    inserted: records.len() as u64,
                    updated: outcome.updated + superseded,
                })
            }
            LoadStrategy::RowByRow { key_columns } => {
                let mut count = LoadCount::default();
                for record in records {
                    let exists = session
                        .row_exists(&self.table, &self.columns, key_columns, record)
                        .await?;
                    if exists {
                        session
                            .update_row(&self.table, &self.columns, key_columns, record)
                            .await?;
                        count.updated += 1;
                    } else {
                        session.insert_row(&self.table, &self.columns, record).await?;
                    }
                    count.inserted += 1;
                }
                Ok(count)
            }
            LoadStrategy::StagedUpdate {
                key_columns,
                touch_column,
            } => {
                let plan = StagedUpdatePlan {
                    table: self.table.clone(),
                    columns: self.columns.clone(),
                    key_columns: key_columns.clone(),
                    staging_table: self.staging_table.clone(),
                    touch_column: touch_column.clone(),
                };
                let matched = session.update_from_staging(&plan, records).await?;
                if matched < records.len() as u64 {
                    warn!(
                        "{}: {} of {} staged rows matched an existing row",
                        self.table,
                        matched,
                        records.len()
                    );
                }
                Ok(LoadCount {
                    inserted: records.len() as u64,
                    updated: matched,
                })
            }
        }
    }
}

pub(crate) fn collect_deferred(records: &[TargetRecord]) -> Vec<DeferredRef> {
    records.iter().filter_map(|r| r.deferred.clone()).collect()
}

pub(crate) fn failed_batch_skips(records: &[TargetRecord], message: &str) -> Vec<SkipRecord> {
    records
        .iter()
        .map(|r| {
            SkipRecord::new(
                r.record_id.clone(),
                SkipKind::BatchFailed,
                format!("batch load failed: {}", message),
            )
        })
        .collect()
}
