//! PostgreSQL target store and writer sessions.
//!
//! The store wraps a deadpool pool. A [`PgSession`] keeps one pooled client
//! for a writer's lifetime and drives transactions with plain
//! `BEGIN`/`COMMIT`/`ROLLBACK`, so a single transaction can span every
//! batch in single-transaction mode.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info, warn};

use super::tls::SslMode;
use super::types::{params, rows_to_records};
use crate::config::TargetConfig;
use crate::core::{
    CaseUpdate, ColumnType, CopyFormat, KeyConstraint, MergeOutcome, MergePlan, RawRecord, StagedUpdatePlan,
    TargetRecord, TargetSession, TargetStore,
};
use crate::error::{MigrateError, Result};
use crate::load::{binary_copy, sql, text_copy};

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL implementation of [`TargetStore`].
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub async fn new(config: &TargetConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);
        pg_config.application_name("mssql-pg-etl");
        if config.schema != "public" {
            pg_config.options(&format!("-c search_path={},public", config.schema));
        }

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let mgr = match SslMode::parse(&config.ssl_mode)?.connector()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns.max(1))
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL target pool"))?;

        let store = Self { pool };
        store.client().await?.simple_query("SELECT 1").await?;
        info!(
            "Connected to PostgreSQL target: {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(store)
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting PostgreSQL connection"))
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn session(&self) -> Result<Box<dyn TargetSession>> {
        Ok(Box::new(PgSession {
            client: Some(self.client().await?),
            in_transaction: false,
            column_types: HashMap::new(),
        }))
    }

    async fn query(&self, sql: &str) -> Result<Vec<RawRecord>> {
        let rows = self.client().await?.query(sql, &[]).await?;
        rows_to_records(&rows)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        Ok(self.client().await?.execute(sql, &[]).await?)
    }

    async fn key_constraint(&self, table: &str, key_columns: &[String]) -> Result<KeyConstraint> {
        let client = self.client().await?;
        let indexes = client
            .query(sql::UNIQUE_INDEXES_QUERY, &[&sql::qualify_table(table)])
            .await?;
        for row in &indexes {
            let name: String = row.try_get(0)?;
            let columns: Vec<String> = row.try_get(1)?;
            if same_columns(&columns, key_columns) {
                debug!("{}: unique key ({}) covered by {}", table, key_columns.join(", "), name);
                return Ok(KeyConstraint::Present);
            }
        }

        let row = client
            .query_one(&sql::duplicate_keys_statement(table, key_columns), &[])
            .await?;
        let duplicate_keys: i64 = row.try_get(0)?;
        Ok(if duplicate_keys == 0 {
            KeyConstraint::Creatable
        } else {
            KeyConstraint::Blocked { duplicate_keys }
        })
    }

    async fn column_types(&self, table: &str, columns: &[String]) -> Result<Vec<ColumnType>> {
        let client = self.client().await?;
        describe_column_types(&client, table, columns).await
    }

    async fn create_unique_key(&self, table: &str, key_columns: &[String]) -> Result<()> {
        let statement = sql::create_unique_index(table, key_columns);
        self.client().await?.batch_execute(&statement).await?;
        info!("{}: created unique index on ({})", table, key_columns.join(", "));
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        self.client()
            .await?
            .batch_execute(&sql::truncate_statement(table))
            .await?;
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        let statement = format!("SELECT COUNT(*) FROM {}", sql::qualify_table(table));
        let row = self.client().await?.query_one(&statement, &[]).await?;
        Ok(row.try_get(0)?)
    }

    fn db_type(&self) -> &str {
        "postgres"
    }
}

/// Column types from the result description of a zero-row select.
async fn describe_column_types(
    client: &tokio_postgres::Client,
    table: &str,
    columns: &[String],
) -> Result<Vec<ColumnType>> {
    let statement = client
        .prepare(&sql::describe_columns_statement(table, columns))
        .await?;
    Ok(statement
        .columns()
        .iter()
        .map(|c| ColumnType::from_pg_name(c.type_().name()))
        .collect())
}

fn same_columns(index: &[String], key: &[String]) -> bool {
    index.len() == key.len()
        && key
            .iter()
            .all(|k| index.iter().any(|c| c.eq_ignore_ascii_case(k)))
}

/// One writer's connection.
pub struct PgSession {
    client: Option<Object>,
    in_transaction: bool,
    /// Described column types per `table(columns)`.
    column_types: HashMap<String, Vec<ColumnType>>,
}

impl PgSession {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::transfer("postgres", "session is closed"))
    }

    async fn types_for(&mut self, table: &str, columns: &[String]) -> Result<Vec<ColumnType>> {
        let key = format!("{}({})", table, columns.join(","));
        if let Some(types) = self.column_types.get(&key) {
            return Ok(types.clone());
        }
        let types = describe_column_types(self.client()?, table, columns).await?;
        debug!(
            "{}: column types {}",
            table,
            types.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );
        self.column_types.insert(key, types.clone());
        Ok(types)
    }

    async fn copy(&self, statement: &str, payload: Bytes) -> Result<u64> {
        let sink = self.client()?.copy_in::<_, Bytes>(statement).await?;
        tokio::pin!(sink);
        sink.send(payload).await?;
        Ok(sink.finish().await?)
    }

    async fn stage(
        &self,
        staging: &str,
        table: &str,
        columns: &[String],
        payload: Bytes,
        format: CopyFormat,
    ) -> Result<u64> {
        let client = self.client()?;
        client.batch_execute(&sql::drop_staging(staging)).await?;
        client
            .batch_execute(&sql::create_staging(staging, table))
            .await?;
        self.copy(&sql::copy_statement(staging, columns, format), payload)
            .await
    }

    async fn unstage(&self, staging: &str) -> Result<()> {
        self.client()?
            .batch_execute(&sql::drop_staging(staging))
            .await?;
        Ok(())
    }
}

/// Values of `key_columns` in key order.
fn key_values<'r>(
    columns: &[String],
    key_columns: &[String],
    record: &'r TargetRecord,
) -> Result<Vec<&'r crate::core::SqlValue<'static>>> {
    key_columns
        .iter()
        .map(|k| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(k))
                .and_then(|i| record.values.get(i))
                .ok_or_else(|| {
                    MigrateError::Config(format!("key column '{}' is not a loaded column", k))
                })
        })
        .collect()
}

#[async_trait]
impl TargetSession for PgSession {
    async fn begin(&mut self) -> Result<()> {
        self.client()?.batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client()?.batch_execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client()?.batch_execute("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<RawRecord>> {
        let rows = self.client()?.query(sql, &[]).await?;
        rows_to_records(&rows)
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.client()?.execute(sql, &[]).await?)
    }

    async fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        records: &[TargetRecord],
        format: CopyFormat,
    ) -> Result<u64> {
        let payload = match format {
            CopyFormat::Binary => {
                let types = self.types_for(table, columns).await?;
                binary_copy::encode_records(records, columns, &types)?
            }
            CopyFormat::Text { sanitize } => text_copy::encode_records(records, sanitize),
        };
        self.copy(&sql::copy_statement(table, columns, format), payload)
            .await
    }

    async fn merge_from_staging(
        &mut self,
        plan: &MergePlan,
        records: &[TargetRecord],
    ) -> Result<MergeOutcome> {
        self.stage(
            &plan.staging_table,
            &plan.table,
            &plan.columns,
            text_copy::encode_records(records, false),
            CopyFormat::Text { sanitize: false },
        )
        .await?;
        let row = self
            .client()?
            .query_one(&sql::merge_statement(plan), &[])
            .await?;
        let inserted: i64 = row.try_get(0)?;
        let updated: i64 = row.try_get(1)?;
        self.unstage(&plan.staging_table).await?;
        Ok(MergeOutcome {
            inserted: inserted as u64,
            updated: updated as u64,
        })
    }

    async fn update_from_staging(
        &mut self,
        plan: &StagedUpdatePlan,
        records: &[TargetRecord],
    ) -> Result<u64> {
        // The staging table is created LIKE the target, so it shares its types.
        let types = self.types_for(&plan.table, &plan.columns).await?;
        let payload = binary_copy::encode_records(records, &plan.columns, &types)?;
        self.stage(
            &plan.staging_table,
            &plan.table,
            &plan.columns,
            payload,
            CopyFormat::Binary,
        )
        .await?;
        let updated = self
            .client()?
            .execute(&sql::staged_update_statement(plan), &[])
            .await?;
        self.unstage(&plan.staging_table).await?;
        Ok(updated)
    }

    async fn row_exists(
        &mut self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        record: &TargetRecord,
    ) -> Result<bool> {
        let keys = key_values(columns, key_columns, record)?;
        let row = self
            .client()?
            .query_one(
                &sql::exists_statement(table, key_columns),
                &params(keys.into_iter()),
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn insert_row(
        &mut self,
        table: &str,
        columns: &[String],
        record: &TargetRecord,
    ) -> Result<()> {
        self.client()?
            .execute(
                &sql::insert_statement(table, columns),
                &params(record.values.iter()),
            )
            .await?;
        Ok(())
    }

    async fn update_row(
        &mut self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        record: &TargetRecord,
    ) -> Result<u64> {
        let keys = key_values(columns, key_columns, record)?;
        let values = columns
            .iter()
            .zip(&record.values)
            .filter(|(c, _)| !key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
            .map(|(_, v)| v)
            .chain(keys);
        Ok(self
            .client()?
            .execute(
                &sql::update_statement(table, columns, key_columns),
                &params(values),
            )
            .await?)
    }

    async fn apply_case_update(&mut self, update: &CaseUpdate) -> Result<u64> {
        Ok(self
            .client()?
            .execute(&sql::case_update_statement(update), &[])
            .await?)
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // A connection left inside a transaction must not go back to the pool.
        if self.in_transaction {
            if let Some(client) = self.client.take() {
                warn!("closing PostgreSQL session with an open transaction");
                drop(Object::take(client));
            }
        }
    }
}
