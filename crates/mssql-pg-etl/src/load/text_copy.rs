//! PostgreSQL text COPY encoding with sanitizing.
//!
//! Fields are separated by `|`, rows end with `\n` and NULL is written as
//! `\N`. Backslash, the delimiter, tab, newline and carriage return inside a
//! field are backslash-escaped.

use std::borrow::Cow;

use bytes::Bytes;

use crate::core::{SqlValue, TargetRecord};

/// Field delimiter used for text COPY.
pub const DELIMITER: char = '|';

/// NULL sentinel used for text COPY.
pub const NULL_SENTINEL: &str = "\\N";

/// Options clause matching [`encode_records`].
pub const COPY_OPTIONS: &str = "FORMAT TEXT, DELIMITER '|', NULL '\\N'";

/// Remove NUL and control characters below 0x20 other than tab, newline and
/// carriage return.
pub fn sanitize(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !is_stripped(*c)).collect())
}

fn is_stripped(c: char) -> bool {
    (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r')
}

/// Escape one field for text COPY.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            DELIMITER => {
                out.push('\\');
                out.push(DELIMITER);
            }
            _ => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`] the way the COPY parser does.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Split one encoded row into fields, honoring escaped delimiters.
///
/// `None` marks a NULL field.
pub fn split_row(line: &str) -> Vec<Option<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            DELIMITER => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
        .into_iter()
        .map(|f| (f != NULL_SENTINEL).then(|| unescape(&f)))
        .collect()
}

/// Render one value as an escaped text COPY field.
pub fn field(value: &SqlValue<'_>, sanitize_text: bool) -> String {
    match value {
        SqlValue::Null(_) => NULL_SENTINEL.to_string(),
        SqlValue::Bool(b) => (if *b { "t" } else { "f" }).to_string(),
        SqlValue::I16(v) => v.to_string(),
        SqlValue::I32(v) => v.to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::F32(v) => v.to_string(),
        SqlValue::F64(v) => v.to_string(),
        SqlValue::Text(s) if sanitize_text => escape(&sanitize(s)),
        SqlValue::Text(s) => escape(s),
        // bytea hex input; the backslash itself needs escaping
        SqlValue::Bytes(b) => format!("\\\\x{}", hex::encode(b.as_ref())),
        SqlValue::Uuid(u) => u.to_string(),
        SqlValue::Decimal(d) => d.to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        SqlValue::DateTimeOffset(dto) => dto.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string(),
        SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
    }
}

/// Encode records as one text COPY payload.
pub fn encode_records(records: &[TargetRecord], sanitize_text: bool) -> Bytes {
    let mut buf = String::with_capacity(records.len() * 128);
    for record in records {
        for (i, value) in record.values.iter().enumerate() {
            if i > 0 {
                buf.push(DELIMITER);
            }
            buf.push_str(&field(value, sanitize_text));
        }
        buf.push('\n');
    }
    Bytes::from(buf)
}
