//! Streaming source over SQL Server.
//!
//! Uses Tiberius with a bb8 pool. Each cursor holds one pooled connection
//! for the lifetime of its query and decodes rows on a spawned task, so the
//! bounded channel is what throttles the server-side read.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::{RawRecord, RecordSchema, RowSource, RowStream, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};

/// Maximum TDS packet size.
const TDS_MAX_PACKET_SIZE: u32 = 32767;

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// bb8 manager for Tiberius clients.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));
        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }
        config.packet_size(TDS_MAX_PACKET_SIZE);
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = Client<Compat<TcpStream>>;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        // Long cursors sit idle on the wire while writers catch up.
        let socket = socket2::SockRef::from(&tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// SQL Server implementation of [`RowSource`].
pub struct MssqlSource {
    pool: Pool<TiberiusConnectionManager>,
}

impl MssqlSource {
    pub async fn new(config: &SourceConfig, max_size: u32) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size.max(1))
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| MigrateError::pool(e, "creating MSSQL connection pool"))?;

        let source = Self { pool };
        source.ping().await?;
        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );
        Ok(source)
    }

    async fn client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting MSSQL connection from pool"))
    }
}

#[async_trait]
impl RowSource for MssqlSource {
    fn open_cursor(&self, query: &str, buffer: usize) -> RowStream {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let pool = self.pool.clone();
        let query = query.to_string();
        tokio::spawn(async move {
            if let Err(e) = stream_rows(pool, &query, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    async fn count(&self, query: &str) -> Result<i64> {
        let mut client = self.client().await?;
        let row = client
            .simple_query(count_query(query))
            .await?
            .into_row()
            .await?;
        let count = match row {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => None,
        };
        Ok(count.unwrap_or(0))
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mssql"
    }
}

async fn stream_rows(
    pool: Pool<TiberiusConnectionManager>,
    query: &str,
    tx: &mpsc::Sender<Result<RawRecord>>,
) -> Result<()> {
    let mut client = pool
        .get()
        .await
        .map_err(|e| MigrateError::pool(e, "getting connection for cursor"))?;
    let mut rows = client.simple_query(query).await?.into_row_stream();

    let mut schema: Option<Arc<RecordSchema>> = None;
    let mut sent = 0u64;
    while let Some(row) = rows.try_next().await? {
        let schema = schema
            .get_or_insert_with(|| {
                Arc::new(RecordSchema::new(
                    row.columns().iter().map(|c| c.name().to_string()),
                ))
            })
            .clone();
        let values = row
            .into_iter()
            .map(|data| column_value(&data))
            .collect::<Result<Vec<_>>>()?;
        if tx.send(Ok(RawRecord::new(schema, values))).await.is_err() {
            debug!("cursor closed by consumer after {} rows", sent);
            return Ok(());
        }
        sent += 1;
    }
    debug!("cursor drained: {} rows", sent);
    Ok(())
}

/// Wrap `query` in a `COUNT_BIG(*)`, dropping a trailing `ORDER BY` that a
/// derived table would reject.
pub fn count_query(query: &str) -> String {
    let trimmed = query.trim().trim_end_matches(';');
    let upper = trimmed.to_ascii_uppercase();
    let body = match upper.rfind("ORDER BY") {
        Some(pos) if !trimmed[pos..].contains(')') => trimmed[..pos].trim_end(),
        _ => trimmed,
    };
    format!("SELECT COUNT_BIG(*) FROM ({}) AS counted", body)
}

fn column_value(data: &ColumnData<'static>) -> Result<SqlValue<'static>> {
    fn or_null<T>(
        v: Option<T>,
        f: impl FnOnce(T) -> SqlValue<'static>,
        null: SqlNullType,
    ) -> SqlValue<'static> {
        v.map(f).unwrap_or(SqlValue::Null(null))
    }

    let value = match data {
        ColumnData::U8(v) => or_null(*v, |v| SqlValue::I16(i16::from(v)), SqlNullType::I16),
        ColumnData::I16(v) => or_null(*v, SqlValue::I16, SqlNullType::I16),
        ColumnData::I32(v) => or_null(*v, SqlValue::I32, SqlNullType::I32),
        ColumnData::I64(v) => or_null(*v, SqlValue::I64, SqlNullType::I64),
        ColumnData::F32(v) => or_null(*v, SqlValue::F32, SqlNullType::F32),
        ColumnData::F64(v) => or_null(*v, SqlValue::F64, SqlNullType::F64),
        ColumnData::Bit(v) => or_null(*v, SqlValue::Bool, SqlNullType::Bool),
        ColumnData::Guid(v) => or_null(*v, SqlValue::Uuid, SqlNullType::Uuid),
        ColumnData::String(v) => or_null(
            v.as_ref(),
            |s| SqlValue::Text(Cow::Owned(s.to_string())),
            SqlNullType::String,
        ),
        ColumnData::Binary(v) => or_null(
            v.as_ref(),
            |b| SqlValue::Bytes(Cow::Owned(b.to_vec())),
            SqlNullType::Bytes,
        ),
        ColumnData::Xml(v) => or_null(
            v.as_ref(),
            |x| SqlValue::text_owned(x.as_ref().clone().into_string()),
            SqlNullType::String,
        ),
        ColumnData::Numeric(_) => {
            or_null(Decimal::from_sql(data)?, SqlValue::Decimal, SqlNullType::Decimal)
        }
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            or_null(
                NaiveDateTime::from_sql(data)?,
                SqlValue::DateTime,
                SqlNullType::DateTime,
            )
        }
        ColumnData::Date(_) => or_null(NaiveDate::from_sql(data)?, SqlValue::Date, SqlNullType::Date),
        ColumnData::Time(_) => or_null(NaiveTime::from_sql(data)?, SqlValue::Time, SqlNullType::Time),
        ColumnData::DateTimeOffset(_) => or_null(
            DateTime::<FixedOffset>::from_sql(data)?,
            SqlValue::DateTimeOffset,
            SqlNullType::DateTimeOffset,
        ),
    };
    Ok(value)
}
