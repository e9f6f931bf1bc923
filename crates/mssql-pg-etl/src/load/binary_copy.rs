//! PostgreSQL binary COPY encoding.
//!
//! Layout: 11 byte signature, i32 flags, i32 header extension length, then
//! per row an i16 field count followed by i32 length + payload per field
//! (length -1 for NULL), and an i16 -1 trailer.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::core::{ColumnType, SqlValue, TargetRecord};
use crate::error::{MigrateError, Result};

const SIGNATURE: &[u8] = b"PGCOPY\n\xff\r\n\0";

/// Microseconds between the Unix epoch and 2000-01-01.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;

/// `num_days_from_ce` of 2000-01-01.
const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

const NUMERIC_POS: i16 = 0x0000;
const NUMERIC_NEG: i16 = 0x4000;

/// Version byte that prefixes a `jsonb` field.
const JSONB_VERSION: u8 = 1;

/// Encode records as one complete binary COPY payload.
///
/// Every field is written in the wire format of its target column, so an
/// `I32` bound for a `bigint` column is widened to 8 bytes and an `I64`
/// bound for an `integer` column is narrowed when it fits. A value that
/// cannot be represented in its column fails the whole payload.
pub fn encode_records(
    records: &[TargetRecord],
    columns: &[String],
    types: &[ColumnType],
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(records.len() * 128 + 32);
    write_header(&mut buf);
    for record in records {
        write_row(&mut buf, &record.values, types).map_err(|(idx, message)| {
            MigrateError::Encode {
                record_id: record.record_id.clone(),
                column: columns
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("#{}", idx + 1)),
                message,
            }
        })?;
    }
    buf.put_i16(-1);
    Ok(buf.freeze())
}

pub(crate) fn write_header(buf: &mut BytesMut) {
    buf.put_slice(SIGNATURE);
    buf.put_i32(0);
    buf.put_i32(0);
}

/// Write one tuple. Errors carry the offending column index.
pub(crate) fn write_row(
    buf: &mut BytesMut,
    values: &[SqlValue<'_>],
    types: &[ColumnType],
) -> std::result::Result<(), (usize, String)> {
    if values.len() != types.len() {
        return Err((
            values.len().min(types.len()),
            format!("record has {} values for {} columns", values.len(), types.len()),
        ));
    }
    buf.put_i16(values.len() as i16);
    for (idx, (value, ty)) in values.iter().zip(types).enumerate() {
        write_value(buf, value, ty).map_err(|message| (idx, message))?;
    }
    Ok(())
}

/// Write one field as length-prefixed binary in the format of `ty`.
pub(crate) fn write_value(
    buf: &mut BytesMut,
    value: &SqlValue<'_>,
    ty: &ColumnType,
) -> std::result::Result<(), String> {
    match value {
        SqlValue::Null(_) => buf.put_i32(-1),
        SqlValue::Bool(b) => match ty {
            ColumnType::Bool => {
                buf.put_i32(1);
                buf.put_u8(u8::from(*b));
            }
            ColumnType::Text => write_text(buf, if *b { "true" } else { "false" }),
            _ => return Err(mismatch(value, ty)),
        },
        SqlValue::I16(_) | SqlValue::I32(_) | SqlValue::I64(_) => {
            let v = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
            write_integer(buf, v, ty).ok_or_else(|| mismatch(value, ty))??;
        }
        SqlValue::F32(v) => write_float(buf, f64::from(*v), ty).ok_or_else(|| mismatch(value, ty))??,
        SqlValue::F64(v) => write_float(buf, *v, ty).ok_or_else(|| mismatch(value, ty))??,
        SqlValue::Decimal(d) => match ty {
            ColumnType::Numeric => write_numeric(buf, d),
            ColumnType::Float4 | ColumnType::Float8 => {
                let v = d.to_f64().ok_or_else(|| mismatch(value, ty))?;
                write_float(buf, v, ty).ok_or_else(|| mismatch(value, ty))??;
            }
            ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8 => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| format!("{} is not an integer", d))?;
                write_integer(buf, v, ty).ok_or_else(|| mismatch(value, ty))??;
            }
            ColumnType::Text => write_text(buf, &d.to_string()),
            _ => return Err(mismatch(value, ty)),
        },
        SqlValue::Text(s) => write_text_as(buf, s, ty)?,
        SqlValue::Bytes(b) => match ty {
            ColumnType::Bytea => {
                buf.put_i32(b.len() as i32);
                buf.put_slice(b);
            }
            _ => return Err(mismatch(value, ty)),
        },
        SqlValue::Uuid(u) => match ty {
            ColumnType::Uuid => write_uuid(buf, u),
            ColumnType::Text => write_text(buf, &u.to_string()),
            _ => return Err(mismatch(value, ty)),
        },
        SqlValue::DateTime(dt) => write_timestamp(buf, dt, ty).ok_or_else(|| mismatch(value, ty))?,
        SqlValue::DateTimeOffset(dto) => write_timestamp(buf, &dto.naive_utc(), ty)
            .ok_or_else(|| mismatch(value, ty))?,
        SqlValue::Date(d) => match ty {
            ColumnType::Date => write_date(buf, d),
            ColumnType::Timestamp | ColumnType::TimestampTz => d
                .and_hms_opt(0, 0, 0)
                .and_then(|midnight| write_timestamp(buf, &midnight, ty))
                .ok_or_else(|| mismatch(value, ty))?,
            _ => return Err(mismatch(value, ty)),
        },
        SqlValue::Time(t) => match ty {
            ColumnType::Time => write_time(buf, t),
            _ => return Err(mismatch(value, ty)),
        },
    }
    Ok(())
}

fn mismatch(value: &SqlValue<'_>, ty: &ColumnType) -> String {
    format!("{} value does not match column type {}", value.null_type().name(), ty)
}

fn out_of_range(v: i64, ty: &ColumnType) -> String {
    format!("{} is out of range for type {}", v, ty)
}

/// `None` when `ty` does not take integers.
fn write_integer(
    buf: &mut BytesMut,
    v: i64,
    ty: &ColumnType,
) -> Option<std::result::Result<(), String>> {
    let written = match ty {
        ColumnType::Int2 => i16::try_from(v).map(|n| {
            buf.put_i32(2);
            buf.put_i16(n);
        }),
        ColumnType::Int4 => i32::try_from(v).map(|n| {
            buf.put_i32(4);
            buf.put_i32(n);
        }),
        ColumnType::Int8 => {
            buf.put_i32(8);
            buf.put_i64(v);
            Ok(())
        }
        ColumnType::Float4 => {
            buf.put_i32(4);
            buf.put_f32(v as f32);
            Ok(())
        }
        ColumnType::Float8 => {
            buf.put_i32(8);
            buf.put_f64(v as f64);
            Ok(())
        }
        ColumnType::Numeric => {
            write_numeric(buf, &Decimal::from(v));
            Ok(())
        }
        ColumnType::Text => {
            write_text(buf, &v.to_string());
            Ok(())
        }
        _ => return None,
    };
    Some(written.map_err(|_| out_of_range(v, ty)))
}

/// `None` when `ty` does not take floating point values.
fn write_float(
    buf: &mut BytesMut,
    v: f64,
    ty: &ColumnType,
) -> Option<std::result::Result<(), String>> {
    match ty {
        ColumnType::Float4 => {
            buf.put_i32(4);
            buf.put_f32(v as f32);
        }
        ColumnType::Float8 => {
            buf.put_i32(8);
            buf.put_f64(v);
        }
        ColumnType::Numeric => match Decimal::try_from(v) {
            Ok(d) => write_numeric(buf, &d),
            Err(_) => return Some(Err(format!("{} cannot be stored as numeric", v))),
        },
        _ => return None,
    }
    Some(Ok(()))
}

fn write_text(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Text bound for a non-text column is parsed the way the server would
/// parse the literal.
fn write_text_as(buf: &mut BytesMut, s: &str, ty: &ColumnType) -> std::result::Result<(), String> {
    match ty {
        ColumnType::Text | ColumnType::Json => write_text(buf, s),
        ColumnType::Jsonb => {
            buf.put_i32(s.len() as i32 + 1);
            buf.put_u8(JSONB_VERSION);
            buf.put_slice(s.as_bytes());
        }
        ColumnType::Uuid => {
            let u = Uuid::parse_str(s.trim()).map_err(|e| format!("invalid uuid '{}': {}", s, e))?;
            write_uuid(buf, &u);
        }
        ColumnType::Int2 | ColumnType::Int4 | ColumnType::Int8 => {
            let v: i64 = s
                .trim()
                .parse()
                .map_err(|_| format!("invalid integer '{}'", s))?;
            write_integer(buf, v, ty).ok_or_else(|| out_of_range(v, ty))??;
        }
        ColumnType::Numeric => {
            let d: Decimal = s
                .trim()
                .parse()
                .map_err(|_| format!("invalid numeric '{}'", s))?;
            write_numeric(buf, &d);
        }
        ColumnType::Bool => match s.trim().to_lowercase().as_str() {
            "t" | "true" | "1" | "yes" | "y" => write_value(buf, &SqlValue::Bool(true), ty)?,
            "f" | "false" | "0" | "no" | "n" => write_value(buf, &SqlValue::Bool(false), ty)?,
            _ => return Err(format!("invalid boolean '{}'", s)),
        },
        _ => return Err(format!("text value does not match column type {}", ty)),
    }
    Ok(())
}

fn write_uuid(buf: &mut BytesMut, u: &Uuid) {
    buf.put_i32(16);
    buf.put_slice(u.as_bytes());
}

/// `None` when `ty` is not a timestamp or date column.
fn write_timestamp(buf: &mut BytesMut, dt: &NaiveDateTime, ty: &ColumnType) -> Option<()> {
    match ty {
        ColumnType::Timestamp | ColumnType::TimestampTz => {
            buf.put_i32(8);
            buf.put_i64(dt.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS);
        }
        ColumnType::Date => write_date(buf, &dt.date()),
        _ => return None,
    }
    Some(())
}

fn write_date(buf: &mut BytesMut, d: &NaiveDate) {
    buf.put_i32(4);
    buf.put_i32(d.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE);
}

fn write_time(buf: &mut BytesMut, t: &NaiveTime) {
    let micros =
        i64::from(t.num_seconds_from_midnight()) * 1_000_000 + i64::from(t.nanosecond() / 1_000);
    buf.put_i32(8);
    buf.put_i64(micros);
}

/// Encode a decimal as NUMERIC: ndigits, weight, sign, dscale, then
/// base-10000 digits.
fn write_numeric(buf: &mut BytesMut, d: &Decimal) {
    let dscale = d.scale() as i16;
    if d.is_zero() {
        buf.put_i32(8);
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i16(NUMERIC_POS);
        buf.put_i16(dscale);
        return;
    }

    let sign = if d.is_sign_negative() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    let text = d.abs().to_string();
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text.as_str(), ""));
    let int_part = int_part.trim_start_matches('0');

    // Align both halves on the decimal point in groups of four digits.
    let int_width = int_part.len().div_ceil(4) * 4;
    let frac_width = frac_part.len().div_ceil(4) * 4;
    let aligned = format!(
        "{:0>iw$}{:0<fw$}",
        int_part,
        frac_part,
        iw = int_width,
        fw = frac_width
    );

    let mut groups: Vec<i16> = aligned
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0i16, |acc, b| acc * 10 + i16::from(b.wrapping_sub(b'0')))
        })
        .collect();
    let mut weight = (int_width / 4) as i16 - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i16;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    buf.put_i32(8 + 2 * groups.len() as i32);
    buf.put_i16(groups.len() as i16);
    buf.put_i16(weight);
    buf.put_i16(sign);
    buf.put_i16(dscale);
    for group in groups {
        buf.put_i16(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use chrono::NaiveDate;

    use crate::core::SqlNullType;

    fn numeric(d: &str) -> (i16, i16, i16, i16, Vec<i16>) {
        let mut buf = BytesMut::new();
        write_numeric(&mut buf, &d.parse().unwrap());
        let mut cur = std::io::Cursor::new(&buf[..]);
        let len = cur.get_i32();
        let ndigits = cur.get_i16();
        assert_eq!(len, 8 + 2 * i32::from(ndigits));
        let weight = cur.get_i16();
        let sign = cur.get_i16();
        let dscale = cur.get_i16();
        let digits = (0..ndigits).map(|_| cur.get_i16()).collect();
        (ndigits, weight, sign, dscale, digits)
    }

    #[test]
    fn test_numeric_encoding() {
        assert_eq!(numeric("0"), (0, 0, NUMERIC_POS, 0, vec![]));
        assert_eq!(numeric("12345"), (2, 1, NUMERIC_POS, 0, vec![1, 2345]));
        assert_eq!(numeric("123.45"), (2, 0, NUMERIC_POS, 2, vec![123, 4500]));
        assert_eq!(numeric("-456.78"), (2, 0, NUMERIC_NEG, 2, vec![456, 7800]));
        assert_eq!(numeric("0.01"), (1, -1, NUMERIC_POS, 2, vec![100]));
        assert_eq!(numeric("0.0000000001"), (1, -3, NUMERIC_POS, 10, vec![100]));
        assert_eq!(
            numeric("12345678901234"),
            (4, 3, NUMERIC_POS, 0, vec![12, 3456, 7890, 1234])
        );
        assert_eq!(numeric("10000"), (1, 1, NUMERIC_POS, 0, vec![1]));
    }

    #[test]
    fn test_temporal_epochs() {
        let mut buf = BytesMut::new();
        let epoch = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        write_value(&mut buf, &SqlValue::Date(epoch), &ColumnType::Date).unwrap();
        write_value(
            &mut buf,
            &SqlValue::DateTime(epoch.and_hms_opt(0, 0, 1).unwrap()),
            &ColumnType::Timestamp,
        )
        .unwrap();
        write_value(&mut buf, &SqlValue::Date(epoch), &ColumnType::TimestampTz).unwrap();
        let mut cur = std::io::Cursor::new(&buf[..]);
        assert_eq!(cur.get_i32(), 4);
        assert_eq!(cur.get_i32(), 0);
        assert_eq!(cur.get_i32(), 8);
        assert_eq!(cur.get_i64(), 1_000_000);
        assert_eq!(cur.get_i32(), 8);
        assert_eq!(cur.get_i64(), 0);
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_payload_framing() {
        let records = vec![TargetRecord::new(
            "1",
            vec![SqlValue::I32(7), SqlValue::Null(SqlNullType::String)],
        )];
        let payload = encode_records(
            &records,
            &cols(&["id", "name"]),
            &[ColumnType::Int4, ColumnType::Text],
        )
        .unwrap();
        assert!(payload.starts_with(SIGNATURE));
        let mut cur = std::io::Cursor::new(&payload[SIGNATURE.len()..]);
        assert_eq!(cur.get_i32(), 0);
        assert_eq!(cur.get_i32(), 0);
        assert_eq!(cur.get_i16(), 2);
        assert_eq!(cur.get_i32(), 4);
        assert_eq!(cur.get_i32(), 7);
        assert_eq!(cur.get_i32(), -1);
        assert_eq!(cur.get_i16(), -1);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_integers_take_the_column_width() {
        // An MSSQL int bound for bigint and a YAML default bound for integer.
        let records = vec![TargetRecord::new(
            "1",
            vec![SqlValue::I32(1), SqlValue::I64(7), SqlValue::from("title")],
        )];
        let payload = encode_records(
            &records,
            &cols(&["id", "owner_id", "title"]),
            &[ColumnType::Int8, ColumnType::Int4, ColumnType::Text],
        )
        .unwrap();
        let mut cur = std::io::Cursor::new(&payload[SIGNATURE.len() + 8..]);
        assert_eq!(cur.get_i16(), 3);
        assert_eq!(cur.get_i32(), 8);
        assert_eq!(cur.get_i64(), 1);
        assert_eq!(cur.get_i32(), 4);
        assert_eq!(cur.get_i32(), 7);
        assert_eq!(cur.get_i32(), 5);
    }

    #[test]
    fn test_numeric_and_float_columns() {
        let mut buf = BytesMut::new();
        write_value(&mut buf, &SqlValue::I16(3), &ColumnType::Numeric).unwrap();
        write_value(&mut buf, &SqlValue::F32(1.5), &ColumnType::Float8).unwrap();
        let mut cur = std::io::Cursor::new(&buf[..]);
        assert_eq!(cur.get_i32(), 10);
        assert_eq!(cur.get_i16(), 1);
        cur.advance(6);
        assert_eq!(cur.get_i16(), 3);
        assert_eq!(cur.get_i32(), 8);
        assert_eq!(cur.get_f64(), 1.5);
    }

    #[test]
    fn test_text_parsed_for_typed_columns() {
        let id = Uuid::new_v4();
        let mut buf = BytesMut::new();
        write_value(&mut buf, &SqlValue::text_owned(id.to_string()), &ColumnType::Uuid).unwrap();
        write_value(&mut buf, &SqlValue::from("{}"), &ColumnType::Jsonb).unwrap();
        let mut cur = std::io::Cursor::new(&buf[..]);
        assert_eq!(cur.get_i32(), 16);
        let mut raw = [0u8; 16];
        cur.copy_to_slice(&mut raw);
        assert_eq!(Uuid::from_bytes(raw), id);
        assert_eq!(cur.get_i32(), 3);
        assert_eq!(cur.get_u8(), JSONB_VERSION);
    }

    #[test]
    fn test_unrepresentable_value_names_record_and_column() {
        let records = vec![
            TargetRecord::new("1", vec![SqlValue::I64(1)]),
            TargetRecord::new("2", vec![SqlValue::I64(1 << 40)]),
        ];
        let err = encode_records(&records, &cols(&["owner_id"]), &[ColumnType::Int4]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("record 2"), "{}", message);
        assert!(message.contains("owner_id"), "{}", message);
        assert!(message.contains("out of range for type integer"), "{}", message);

        let mut buf = BytesMut::new();
        let mismatch = write_value(&mut buf, &SqlValue::bytes_owned(vec![1]), &ColumnType::Int4);
        assert_eq!(
            mismatch.unwrap_err(),
            "binary value does not match column type integer"
        );
    }
}
