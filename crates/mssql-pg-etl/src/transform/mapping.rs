//! Configuration-driven column mapping.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{record_id, Transform, TransformError};
use crate::cache::{KeyPart, LookupKey, ReferenceCache};
use crate::config::{CastType, ColumnConfig, MaskKind, OnMissing, TableConfig};
use crate::core::{
    DeferredRef, FromSqlValue, RawRecord, SkipKind, SqlNullType, SqlValue, TargetRecord,
};
use crate::error::{MigrateError, Result};

/// Maps source columns to target columns as described by a [`TableConfig`].
#[derive(Debug)]
pub struct MappingTransform {
    columns: Vec<String>,
    mappings: Vec<ColumnMapping>,
    id_column: Option<String>,
    /// Position of the key column carried by deferred references.
    deferred_key: Option<usize>,
}

#[derive(Debug)]
struct ColumnMapping {
    config: ColumnConfig,
    default: Option<SqlValue<'static>>,
}

impl MappingTransform {
    pub fn new(table: &TableConfig) -> Result<Self> {
        let columns = table.target_columns();
        let mappings = table
            .columns
            .iter()
            .map(|c| {
                let default = c
                    .default
                    .as_ref()
                    .map(|v| yaml_to_value(&c.target, v))
                    .transpose()?;
                Ok(ColumnMapping {
                    config: c.clone(),
                    default,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let deferred_key = match &table.forward_reference {
            Some(fwd) => Some(
                columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(&fwd.key_column))
                    .ok_or_else(|| {
                        MigrateError::Config(format!(
                            "table '{}': forward_reference key column '{}' is not mapped",
                            table.name, fwd.key_column
                        ))
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            columns,
            mappings,
            id_column: table.id_column.clone(),
            deferred_key,
        })
    }

    fn map_column(
        &self,
        mapping: &ColumnMapping,
        raw: &RawRecord,
        caches: &ReferenceCache,
    ) -> std::result::Result<SqlValue<'static>, TransformError> {
        let column = &mapping.config;

        let mut value = match &column.source {
            Some(source) => raw.value(source)?.clone(),
            None => SqlValue::Null(SqlNullType::String),
        };
        if value.is_null() {
            if let Some(default) = &mapping.default {
                value = default.clone();
            }
        }

        if let Some(cache) = &column.reference {
            if let Some(part) = KeyPart::from_value(&value) {
                let found = caches
                    .contains(cache, &LookupKey::single(part.clone()))
                    .map_err(|e| TransformError::Systemic(e.to_string()))?;
                if !found {
                    return Err(TransformError::missing_reference(format!(
                        "{} references missing {} entry {}",
                        column.target, cache, part
                    )));
                }
            }
        }

        if let Some(lookup) = &column.lookup {
            let parts = lookup
                .keys
                .iter()
                .map(|k| raw.value(k))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if let Some(key) = LookupKey::from_values(parts) {
                let found = caches
                    .lookup(&lookup.cache, &key)
                    .map_err(|e| TransformError::Systemic(e.to_string()))?;
                value = match (found, lookup.on_missing) {
                    (Some(v), _) => v.clone(),
                    (None, OnMissing::Skip) => {
                        return Err(TransformError::missing_reference(format!(
                            "{}: no {} entry for {}",
                            column.target, lookup.cache, key
                        )))
                    }
                    (None, OnMissing::Null) => SqlValue::Null(SqlNullType::String),
                    (None, OnMissing::Default) => mapping
                        .default
                        .clone()
                        .unwrap_or(SqlValue::Null(SqlNullType::String)),
                };
            } else {
                value = SqlValue::Null(SqlNullType::String);
            }
        }

        if value.is_null() && column.required {
            return Err(TransformError::skip(
                SkipKind::MissingRequired,
                format!("required field {} is missing", column.target),
            ));
        }

        if let Some(len) = value.payload_len() {
            if len == 0 && column.reject_empty {
                return Err(TransformError::skip(
                    SkipKind::MissingRequired,
                    format!("{} is empty", column.target),
                ));
            }
            if let Some(max) = column.max_bytes {
                if len > max {
                    return Err(TransformError::skip(
                        SkipKind::Oversized,
                        format!("{} too large: {} bytes", column.target, len),
                    ));
                }
            }
        }

        if let Some(kind) = column.mask {
            value = mask(value, kind);
        }

        if let Some(cast) = column.cast {
            value = cast_value(value, cast).map_err(|e| {
                TransformError::Record(format!("{}: {}", column.target, e))
            })?;
        }

        Ok(value)
    }
}

impl Transform for MappingTransform {
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
    ) -> std::result::Result<TargetRecord, TransformError> {
        let mut values = Vec::with_capacity(self.mappings.len());
        let mut deferred = None;

        for mapping in &self.mappings {
            if mapping.config.deferred {
                let reference = match &mapping.config.source {
                    Some(source) => raw.value(source)?.clone(),
                    None => SqlValue::Null(SqlNullType::String),
                };
                if !reference.is_null() {
                    deferred = Some(reference);
                }
                values.push(SqlValue::Null(SqlNullType::String));
                continue;
            }
            values.push(self.map_column(mapping, raw, caches)?);
        }

        let mut record = TargetRecord::new(self.record_id(raw), values);
        if let (Some(reference), Some(key_idx)) = (deferred, self.deferred_key) {
            let key = record.values[key_idx].clone();
            record = record.with_deferred(DeferredRef { key, reference });
        }
        Ok(record)
    }
}

fn yaml_to_value(column: &str, value: &serde_yaml::Value) -> Result<SqlValue<'static>> {
    match value {
        serde_yaml::Value::Null => Ok(SqlValue::Null(SqlNullType::String)),
        serde_yaml::Value::Bool(b) => Ok(SqlValue::Bool(*b)),
        serde_yaml::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(SqlValue::I64(i)),
            (None, Some(f)) => Ok(SqlValue::F64(f)),
            _ => Err(MigrateError::Config(format!(
                "column '{}': unsupported numeric default {}",
                column, n
            ))),
        },
        serde_yaml::Value::String(s) => Ok(SqlValue::text_owned(s.clone())),
        _ => Err(MigrateError::Config(format!(
            "column '{}': default must be a scalar",
            column
        ))),
    }
}

fn mask(value: SqlValue<'static>, kind: MaskKind) -> SqlValue<'static> {
    if value.is_null() {
        return value;
    }
    match kind {
        MaskKind::Sha256 => mask_sha256(value),
        MaskKind::Email => SqlValue::text_owned(mask_email(&plain_text(&value))),
        MaskKind::Phone => SqlValue::text_owned(mask_phone(&plain_text(&value))),
    }
}

/// Blank values and values without `@` pass through unchanged.
fn mask_email(email: &str) -> String {
    if email.trim().is_empty() {
        return email.to_string();
    }
    let Some((user, domain)) = email.split_once('@') else {
        return email.to_string();
    };
    let len = user.chars().count();
    if len <= 2 {
        return format!("***@{}", domain);
    }
    let kept: String = user.chars().take(2).collect();
    format!("{}{}@{}", kept, "*".repeat(len - 2), domain)
}

fn mask_phone(phone: &str) -> String {
    let len = phone.chars().count();
    if phone.trim().is_empty() || len < 4 {
        return "****".to_string();
    }
    let last: String = phone.chars().skip(len - 4).collect();
    format!("{}{}", "*".repeat(len - 4), last)
}

fn mask_sha256(value: SqlValue<'static>) -> SqlValue<'static> {
    let digest = match &value {
        SqlValue::Null(_) => return value,
        SqlValue::Bytes(b) => Sha256::digest(b.as_ref()),
        other => Sha256::digest(plain_text(other).as_bytes()),
    };
    SqlValue::text_owned(hex::encode(digest))
}

/// Unescaped text rendering used for casts and masking.
fn plain_text(value: &SqlValue<'_>) -> String {
    match value {
        SqlValue::Null(_) => String::new(),
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::I16(v) => v.to_string(),
        SqlValue::I32(v) => v.to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::F32(v) => v.to_string(),
        SqlValue::F64(v) => v.to_string(),
        SqlValue::Decimal(v) => v.to_string(),
        SqlValue::Text(s) => s.to_string(),
        SqlValue::Bytes(b) => hex::encode(b.as_ref()),
        SqlValue::Uuid(u) => u.to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        SqlValue::DateTimeOffset(dt) => dt.to_rfc3339(),
        SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn typed<T: FromSqlValue>(value: &SqlValue<'_>) -> Option<T> {
    T::from_sql_value(value)
}

/// Convert a value to the target column type.
fn cast_value(
    value: SqlValue<'static>,
    to: CastType,
) -> std::result::Result<SqlValue<'static>, String> {
    if value.is_null() {
        let null_type = match to {
            CastType::Smallint => SqlNullType::I16,
            CastType::Integer => SqlNullType::I32,
            CastType::Bigint => SqlNullType::I64,
            CastType::Double => SqlNullType::F64,
            CastType::Numeric => SqlNullType::Decimal,
            CastType::Text => SqlNullType::String,
            CastType::Uuid => SqlNullType::Uuid,
            CastType::Boolean => SqlNullType::Bool,
            CastType::Timestamp => SqlNullType::DateTime,
            CastType::Date => SqlNullType::Date,
        };
        return Ok(SqlValue::Null(null_type));
    }

    let text = value.as_str().map(str::trim);
    let fail = || format!("cannot convert {} to {:?}", value.null_type().name(), to);

    let converted = match to {
        CastType::Smallint => typed::<i64>(&value)
            .or_else(|| text.and_then(|s| s.parse().ok()))
            .and_then(|v| i16::try_from(v).ok())
            .map(SqlValue::I16),
        CastType::Integer => typed::<i64>(&value)
            .or_else(|| text.and_then(|s| s.parse().ok()))
            .and_then(|v| i32::try_from(v).ok())
            .map(SqlValue::I32),
        CastType::Bigint => typed::<i64>(&value)
            .or_else(|| text.and_then(|s| s.parse().ok()))
            .map(SqlValue::I64),
        CastType::Double => typed::<f64>(&value)
            .or_else(|| text.and_then(|s| s.parse().ok()))
            .map(SqlValue::F64),
        CastType::Numeric => {
            let decimal = match &value {
                SqlValue::F32(f) => Decimal::try_from(f64::from(*f)).ok(),
                SqlValue::F64(f) => Decimal::try_from(*f).ok(),
                other => typed::<Decimal>(other)
                    .or_else(|| text.and_then(|s| Decimal::from_str(s).ok())),
            };
            decimal.map(SqlValue::Decimal)
        }
        CastType::Text => Some(match &value {
            SqlValue::Text(_) => value.clone(),
            other => SqlValue::text_owned(plain_text(other)),
        }),
        CastType::Uuid => typed::<Uuid>(&value).map(SqlValue::Uuid),
        CastType::Boolean => {
            let flag = match text {
                Some(s) => match s.to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" | "1" => Some(true),
                    "false" | "f" | "no" | "n" | "0" => Some(false),
                    _ => None,
                },
                None => typed::<bool>(&value),
            };
            flag.map(SqlValue::Bool)
        }
        CastType::Timestamp => typed::<NaiveDateTime>(&value)
            .or_else(|| text.and_then(parse_datetime))
            .map(SqlValue::DateTime),
        CastType::Date => typed::<NaiveDate>(&value)
            .or_else(|| text.and_then(|s| parse_datetime(s).map(|dt| dt.date())))
            .map(SqlValue::Date),
    };

    converted.ok_or_else(fail)
}
