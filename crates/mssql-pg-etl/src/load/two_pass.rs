//! Second pass of a parent/child load.
//!
//! Rows that point at other rows of the same table are first loaded with the
//! reference column NULL. Once every batch is committed, the source values
//! of those references are mapped to target keys through `resolve_query` and
//! written back with chunked `UPDATE ... SET col = CASE key ... END`
//! statements.

use tracing::{info, warn};

use crate::cache::{CacheShape, CacheSpec, KeyPart, LookupKey, ReferenceCache};
use crate::config::TableConfig;
use crate::core::{CaseUpdate, DeferredRef, SqlValue, TargetSession, TargetStore};
use crate::error::Result;

/// Deferred references logged individually before switching to a count.
const MAX_LOGGED_UNRESOLVED: usize = 10;

/// Result of the second pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwoPassOutcome {
    pub resolved: u64,
    pub updated: u64,
    pub unresolved: u64,
}

/// Pass-two update of one deferred column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwoPassStage {
    pub table: String,
    pub key_column: String,
    pub target_column: String,
    /// Two-column query mapping a source reference to the target key.
    pub resolve_query: String,
    pub chunk_size: usize,
}

impl TwoPassStage {
    /// Stage for a table with a forward reference, if it has one.
    pub fn for_table(table: &TableConfig, chunk_size: usize) -> Option<Self> {
        let forward = table.forward_reference.as_ref()?;
        let column = table.columns.iter().find(|c| c.deferred)?;
        Some(Self {
            table: table.target_table().to_string(),
            key_column: forward.key_column.clone(),
            target_column: column.target.clone(),
            resolve_query: forward.resolve_query.clone(),
            chunk_size: chunk_size.max(1),
        })
    }

    /// Resolve `pending` and write the resolved values back in a
    /// transaction of its own.
    pub async fn run(
        &self,
        store: &dyn TargetStore,
        pending: Vec<DeferredRef>,
    ) -> Result<TwoPassOutcome> {
        if pending.iter().all(|d| d.reference.is_null()) {
            return Ok(TwoPassOutcome::default());
        }

        let mut session = store.session().await?;
        session.begin().await?;
        match self.apply(session.as_mut(), pending).await {
            Ok(outcome) => {
                session.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    warn!("{}: rollback failed: {}", self.table, rollback);
                }
                Err(e)
            }
        }
    }

    /// Resolve `pending` and write the resolved values back inside the
    /// caller's transaction.
    pub async fn apply(
        &self,
        session: &mut dyn TargetSession,
        pending: Vec<DeferredRef>,
    ) -> Result<TwoPassOutcome> {
        let pending: Vec<DeferredRef> = pending
            .into_iter()
            .filter(|d| !d.reference.is_null())
            .collect();
        if pending.is_empty() {
            return Ok(TwoPassOutcome::default());
        }

        let spec = CacheSpec {
            name: format!("{}.{}", self.table, self.target_column),
            query: self.resolve_query.clone(),
            shape: CacheShape::Map,
        };
        let resolver = ReferenceCache::load_in_session(session, std::slice::from_ref(&spec)).await?;

        let mut outcome = TwoPassOutcome::default();
        let mut assignments = Vec::with_capacity(pending.len());
        for deferred in pending {
            let value = KeyPart::from_value(&deferred.reference)
                .map(LookupKey::single)
                .map(|key| resolver.lookup(&spec.name, &key))
                .transpose()?
                .flatten();
            match value {
                Some(value) => {
                    assignments.push((deferred.key, value.clone()));
                    outcome.resolved += 1;
                }
                None => {
                    outcome.unresolved += 1;
                    if outcome.unresolved as usize <= MAX_LOGGED_UNRESOLVED {
                        warn!(
                            "{}: {} of row {} references unknown {}",
                            self.table,
                            self.target_column,
                            deferred.key.to_sql_literal(),
                            deferred.reference.to_sql_literal()
                        );
                    }
                }
            }
        }

        let updates = case_updates(
            &self.table,
            &self.key_column,
            &self.target_column,
            assignments,
            self.chunk_size,
        );

        for update in &updates {
            outcome.updated += session.apply_case_update(update).await?;
        }

        if outcome.unresolved > 0 {
            warn!(
                "{}: {} references in {} could not be resolved and stay NULL",
                self.table, outcome.unresolved, self.target_column
            );
        }
        info!(
            "{}: second pass set {} on {} rows in {} statements",
            self.table,
            self.target_column,
            outcome.updated,
            updates.len()
        );
        Ok(outcome)
    }
}

/// Split `(key, value)` assignments into updates of at most `chunk_size` keys.
pub fn case_updates(
    table: &str,
    key_column: &str,
    target_column: &str,
    assignments: Vec<(SqlValue<'static>, SqlValue<'static>)>,
    chunk_size: usize,
) -> Vec<CaseUpdate> {
    assignments
        .chunks(chunk_size.max(1))
        .map(|chunk| CaseUpdate {
            table: table.to_string(),
            key_column: key_column.to_string(),
            target_column: target_column.to_string(),
            assignments: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SqlNullType;
    use crate::testing::{raw_rows, MemoryStore};

    fn stage() -> TwoPassStage {
        TwoPassStage {
            table: "steps".into(),
            key_column: "id".into(),
            target_column: "parent_id".into(),
            resolve_query: "SELECT legacy_id, id FROM steps".into(),
            chunk_size: 2,
        }
    }

    fn deferred(key: i64, reference: i64) -> DeferredRef {
        DeferredRef {
            key: SqlValue::I64(key),
            reference: SqlValue::I64(reference),
        }
    }

    #[test]
    fn test_chunking() {
        let assignments = (1..=5)
            .map(|i| (SqlValue::I64(i), SqlValue::I64(i * 10)))
            .collect();
        let updates = case_updates("t", "id", "parent_id", assignments, 2);
        let sizes: Vec<usize> = updates.iter().map(|u| u.assignments.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_resolves_and_counts_unresolved() {
        let store = MemoryStore::new();
        store.create_table("steps", &["id", "legacy_id", "parent_id"]);
        let null = || SqlValue::Null(SqlNullType::I64);
        store.insert_rows(
            "steps",
            vec![
                vec![SqlValue::I64(1), SqlValue::I64(100), null()],
                vec![SqlValue::I64(2), SqlValue::I64(200), null()],
                vec![SqlValue::I64(3), SqlValue::I64(300), null()],
                vec![SqlValue::I64(4), SqlValue::I64(400), null()],
            ],
        );
        store.set_query_result(
            "SELECT legacy_id, id FROM steps",
            raw_rows(
                &["legacy_id", "id"],
                (1..=4)
                    .map(|i| vec![SqlValue::I64(i * 100), SqlValue::I64(i)])
                    .collect(),
            ),
        );

        let outcome = stage()
            .run(
                &store,
                vec![
                    deferred(2, 100),
                    deferred(3, 200),
                    deferred(4, 300),
                    deferred(1, 999),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TwoPassOutcome {
                resolved: 3,
                updated: 3,
                unresolved: 1
            }
        );
        assert_eq!(
            store.column("steps", "parent_id"),
            vec![null(), SqlValue::I64(1), SqlValue::I64(2), SqlValue::I64(3)]
        );
        let statements = store.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CASE \"id\" WHEN 2 THEN 1 WHEN 3 THEN 2"));
    }

    #[tokio::test]
    async fn test_nothing_pending_skips_resolver() {
        let store = MemoryStore::new();
        let outcome = stage().run(&store, Vec::new()).await.unwrap();
        assert_eq!(outcome, TwoPassOutcome::default());
    }
}
