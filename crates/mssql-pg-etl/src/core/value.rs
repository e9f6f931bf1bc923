//! SQL value types moved between the source and target stores.
//!
//! Values read from the source cursor are owned (`'static`) once they enter
//! the raw queue. The `Cow` payloads let transforms pass text and binary
//! columns through without copying them a second time.

use std::borrow::Cow;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values to ensure correct target encoding.
///
/// Binary COPY needs the column type even for NULL so the row layout stays
/// aligned with the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl SqlNullType {
    /// Short name used in type mismatch messages.
    pub fn name(self) -> &'static str {
        match self {
            SqlNullType::Bool => "bool",
            SqlNullType::I16 => "smallint",
            SqlNullType::I32 => "int",
            SqlNullType::I64 => "bigint",
            SqlNullType::F32 => "real",
            SqlNullType::F64 => "float",
            SqlNullType::String => "text",
            SqlNullType::Bytes => "binary",
            SqlNullType::Uuid => "uuid",
            SqlNullType::Decimal => "decimal",
            SqlNullType::DateTime => "datetime",
            SqlNullType::DateTimeOffset => "datetimeoffset",
            SqlNullType::Date => "date",
            SqlNullType::Time => "time",
        }
    }
}

/// A single nullable column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue<'a> {
    /// NULL with type hint for correct wire format encoding.
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl<'a> SqlValue<'a> {
    /// Convert to a fully owned value with `'static` lifetime.
    #[must_use]
    pub fn into_owned(self) -> SqlValue<'static> {
        match self {
            SqlValue::Null(t) => SqlValue::Null(t),
            SqlValue::Bool(v) => SqlValue::Bool(v),
            SqlValue::I16(v) => SqlValue::I16(v),
            SqlValue::I32(v) => SqlValue::I32(v),
            SqlValue::I64(v) => SqlValue::I64(v),
            SqlValue::F32(v) => SqlValue::F32(v),
            SqlValue::F64(v) => SqlValue::F64(v),
            SqlValue::Text(v) => SqlValue::Text(Cow::Owned(v.into_owned())),
            SqlValue::Bytes(v) => SqlValue::Bytes(Cow::Owned(v.into_owned())),
            SqlValue::Uuid(v) => SqlValue::Uuid(v),
            SqlValue::Decimal(v) => SqlValue::Decimal(v),
            SqlValue::DateTime(v) => SqlValue::DateTime(v),
            SqlValue::DateTimeOffset(v) => SqlValue::DateTimeOffset(v),
            SqlValue::Date(v) => SqlValue::Date(v),
            SqlValue::Time(v) => SqlValue::Time(v),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value (for type-aware NULL encoding).
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Integer view of any integer-like value (zero-scale decimals included).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            _ => None,
        }
    }

    /// Borrow the text payload, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Size of the payload in bytes for text and binary values.
    pub fn payload_len(&self) -> Option<usize> {
        match self {
            SqlValue::Text(s) => Some(s.len()),
            SqlValue::Bytes(b) => Some(b.len()),
            _ => None,
        }
    }

    /// Render as a SQL literal for generated statements.
    ///
    /// Text is single-quoted with embedded quotes doubled, binary becomes a
    /// `'\x..'::bytea` literal and temporal values are quoted ISO strings.
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Null(_) => "NULL".to_string(),
            SqlValue::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) if v.is_finite() => v.to_string(),
            SqlValue::F32(v) => float_literal(f64::from(*v)),
            SqlValue::F64(v) => float_literal(*v),
            SqlValue::Decimal(v) => v.to_string(),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Bytes(b) => format!("'\\x{}'::bytea", hex::encode(b.as_ref())),
            SqlValue::Uuid(u) => format!("'{}'::uuid", u),
            SqlValue::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            SqlValue::DateTimeOffset(dt) => {
                format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.f%:z"))
            }
            SqlValue::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
            SqlValue::Time(t) => format!("'{}'", t.format("%H:%M:%S%.f")),
        }
    }
}

/// Non-finite floats only parse as quoted, typed literals.
fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "'NaN'::float8".to_string()
    } else if v.is_infinite() {
        let sign = if v.is_sign_negative() { "-" } else { "" };
        format!("'{}Infinity'::float8", sign)
    } else {
        v.to_string()
    }
}

/// Quote a string as a SQL literal, doubling embedded single quotes.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl SqlValue<'static> {
    #[must_use]
    pub fn text_owned(s: impl Into<String>) -> Self {
        SqlValue::Text(Cow::Owned(s.into()))
    }

    #[must_use]
    pub fn bytes_owned(b: Vec<u8>) -> Self {
        SqlValue::Bytes(Cow::Owned(b))
    }
}

impl From<bool> for SqlValue<'static> {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue<'static> {
    fn from(v: i16) -> Self {
        SqlValue::I16(v)
    }
}

impl From<i32> for SqlValue<'static> {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue<'static> {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue<'static> {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue<'static> {
    fn from(v: String) -> Self {
        SqlValue::Text(Cow::Owned(v))
    }
}

impl From<&str> for SqlValue<'static> {
    fn from(v: &str) -> Self {
        SqlValue::Text(Cow::Owned(v.to_string()))
    }
}

impl From<Vec<u8>> for SqlValue<'static> {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(Cow::Owned(v))
    }
}

impl From<Uuid> for SqlValue<'static> {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue<'static> {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue<'static> {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<DateTime<FixedOffset>> for SqlValue<'static> {
    fn from(v: DateTime<FixedOffset>) -> Self {
        SqlValue::DateTimeOffset(v)
    }
}

impl From<NaiveDate> for SqlValue<'static> {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

/// Typed extraction from a [`SqlValue`].
///
/// Returns `None` when the value is not representable as `Self`. NULL is
/// handled by the caller, so implementations never see it.
pub trait FromSqlValue: Sized {
    /// Name used in type mismatch messages.
    const EXPECTED: &'static str;

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self>;
}

impl FromSqlValue for bool {
    const EXPECTED: &'static str = "bool";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::Bool(b) => Some(*b),
            other => other.as_i64().map(|v| v != 0),
        }
    }
}

impl FromSqlValue for i32 {
    const EXPECTED: &'static str = "int";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }
}

impl FromSqlValue for i64 {
    const EXPECTED: &'static str = "bigint";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        value.as_i64()
    }
}

impl FromSqlValue for f64 {
    const EXPECTED: &'static str = "float";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::F32(v) => Some(f64::from(*v)),
            SqlValue::F64(v) => Some(*v),
            SqlValue::Decimal(d) => d.to_f64(),
            other => other.as_i64().map(|v| v as f64),
        }
    }
}

impl FromSqlValue for Decimal {
    const EXPECTED: &'static str = "decimal";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::Decimal(d) => Some(*d),
            other => other.as_i64().map(Decimal::from),
        }
    }
}

impl FromSqlValue for String {
    const EXPECTED: &'static str = "text";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::Text(s) => Some(s.to_string()),
            SqlValue::Uuid(u) => Some(u.to_string()),
            _ => None,
        }
    }
}

impl FromSqlValue for Vec<u8> {
    const EXPECTED: &'static str = "binary";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::Bytes(b) => Some(b.to_vec()),
            _ => None,
        }
    }
}

impl FromSqlValue for Uuid {
    const EXPECTED: &'static str = "uuid";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::Uuid(u) => Some(*u),
            SqlValue::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }
}

impl FromSqlValue for NaiveDateTime {
    const EXPECTED: &'static str = "datetime";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::DateTime(dt) => Some(*dt),
            SqlValue::DateTimeOffset(dt) => Some(dt.naive_utc()),
            SqlValue::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }
}

impl FromSqlValue for NaiveDate {
    const EXPECTED: &'static str = "date";

    fn from_sql_value(value: &SqlValue<'_>) -> Option<Self> {
        match value {
            SqlValue::Date(d) => Some(*d),
            SqlValue::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }
}
