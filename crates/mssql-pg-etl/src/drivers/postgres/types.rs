//! Conversions between `SqlValue` and the PostgreSQL wire types.

use std::borrow::Cow;
use std::error::Error;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::Row;
use uuid::Uuid;

use crate::core::{RawRecord, RecordSchema, SqlNullType, SqlValue};
use crate::error::Result;

type BoxError = Box<dyn Error + Sync + Send>;

impl ToSql for SqlValue<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            SqlValue::Null(_) => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::I16(v) => int_to_sql(i64::from(*v), ty, out),
            SqlValue::I32(v) => int_to_sql(i64::from(*v), ty, out),
            SqlValue::I64(v) => int_to_sql(*v, ty, out),
            SqlValue::F32(v) if *ty == Type::FLOAT8 => f64::from(*v).to_sql(ty, out),
            SqlValue::F32(v) => v.to_sql(ty, out),
            SqlValue::F64(v) => v.to_sql(ty, out),
            SqlValue::Text(s) => s.as_ref().to_sql(ty, out),
            SqlValue::Bytes(b) => b.as_ref().to_sql(ty, out),
            SqlValue::Uuid(u) => u.to_sql(ty, out),
            SqlValue::Decimal(d) => d.to_sql(ty, out),
            SqlValue::DateTime(dt) => dt.to_sql(ty, out),
            SqlValue::DateTimeOffset(dt) => dt.to_sql(ty, out),
            SqlValue::Date(d) => d.to_sql(ty, out),
            SqlValue::Time(t) => t.to_sql(ty, out),
        }
    }

    // The target column type decides the encoding; integers are narrowed or
    // widened to fit it above.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn int_to_sql(v: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(v)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(v)?.to_sql(ty, out),
        Type::NUMERIC => Decimal::from(v).to_sql(ty, out),
        _ => v.to_sql(ty, out),
    }
}

/// Parameter list borrowing `values`.
pub fn params<'a>(values: impl IntoIterator<Item = &'a SqlValue<'static>>) -> Vec<&'a (dyn ToSql + Sync)> {
    values
        .into_iter()
        .map(|v| v as &(dyn ToSql + Sync))
        .collect()
}

/// Decode query rows into records sharing one schema.
pub fn rows_to_records(rows: &[Row]) -> Result<Vec<RawRecord>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let schema = Arc::new(RecordSchema::new(
        first.columns().iter().map(|c| c.name().to_string()),
    ));
    rows.iter()
        .map(|row| Ok(RawRecord::new(schema.clone(), row_values(row)?)))
        .collect()
}

fn row_values(row: &Row) -> Result<Vec<SqlValue<'static>>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| column_value(row, idx, column.type_()))
        .collect()
}

fn get<'a, T: FromSql<'a>>(
    row: &'a Row,
    idx: usize,
    f: impl FnOnce(T) -> SqlValue<'static>,
    null: SqlNullType,
) -> Result<SqlValue<'static>> {
    Ok(row
        .try_get::<_, Option<T>>(idx)?
        .map(f)
        .unwrap_or(SqlValue::Null(null)))
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> Result<SqlValue<'static>> {
    match *ty {
        Type::BOOL => get::<bool>(row, idx, SqlValue::Bool, SqlNullType::Bool),
        Type::INT2 => get::<i16>(row, idx, SqlValue::I16, SqlNullType::I16),
        Type::INT4 => get::<i32>(row, idx, SqlValue::I32, SqlNullType::I32),
        Type::INT8 => get::<i64>(row, idx, SqlValue::I64, SqlNullType::I64),
        Type::FLOAT4 => get::<f32>(row, idx, SqlValue::F32, SqlNullType::F32),
        Type::FLOAT8 => get::<f64>(row, idx, SqlValue::F64, SqlNullType::F64),
        Type::NUMERIC => get::<Decimal>(row, idx, SqlValue::Decimal, SqlNullType::Decimal),
        Type::UUID => get::<Uuid>(row, idx, SqlValue::Uuid, SqlNullType::Uuid),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx, SqlValue::DateTime, SqlNullType::DateTime),
        Type::TIMESTAMPTZ => get::<DateTime<FixedOffset>>(
            row,
            idx,
            SqlValue::DateTimeOffset,
            SqlNullType::DateTimeOffset,
        ),
        Type::DATE => get::<NaiveDate>(row, idx, SqlValue::Date, SqlNullType::Date),
        Type::TIME => get::<NaiveTime>(row, idx, SqlValue::Time, SqlNullType::Time),
        Type::BYTEA => get::<Vec<u8>>(
            row,
            idx,
            |b| SqlValue::Bytes(Cow::Owned(b)),
            SqlNullType::Bytes,
        ),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(
            row,
            idx,
            |v| SqlValue::text_owned(v.to_string()),
            SqlNullType::String,
        ),
        _ => get::<String>(row, idx, SqlValue::text_owned, SqlNullType::String),
    }
}
