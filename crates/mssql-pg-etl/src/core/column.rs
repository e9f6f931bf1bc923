//! Target column types as seen by the binary COPY encoder.

use std::fmt;

/// Wire type of one target column.
///
/// Binary COPY fields must match the column type exactly: an `integer`
/// column takes 4 bytes, a `bigint` 8. Columns of any other type are
/// [`ColumnType::Other`] and can only be loaded through text formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    /// `text`, `varchar`, `bpchar`, `name` and `citext`.
    Text,
    Bytea,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Json,
    Jsonb,
    Other(String),
}

impl ColumnType {
    /// Map a PostgreSQL type name (`pg_type.typname`).
    pub fn from_pg_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "bool" | "boolean" => ColumnType::Bool,
            "int2" | "smallint" => ColumnType::Int2,
            "int4" | "integer" | "int" => ColumnType::Int4,
            "int8" | "bigint" => ColumnType::Int8,
            "float4" | "real" => ColumnType::Float4,
            "float8" | "double precision" => ColumnType::Float8,
            "numeric" | "decimal" => ColumnType::Numeric,
            "text" | "varchar" | "character varying" | "bpchar" | "character" | "name"
            | "citext" => ColumnType::Text,
            "bytea" => ColumnType::Bytea,
            "uuid" => ColumnType::Uuid,
            "timestamp" | "timestamp without time zone" => ColumnType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ColumnType::TimestampTz,
            "date" => ColumnType::Date,
            "time" | "time without time zone" => ColumnType::Time,
            "json" => ColumnType::Json,
            "jsonb" => ColumnType::Jsonb,
            other => ColumnType::Other(other.to_string()),
        }
    }

    /// Whether the binary COPY encoder can produce this type.
    pub fn is_binary_encodable(&self) -> bool {
        !matches!(self, ColumnType::Other(_))
    }

    /// Field width of fixed-size types in the binary format.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ColumnType::Bool => Some(1),
            ColumnType::Int2 => Some(2),
            ColumnType::Int4 | ColumnType::Float4 | ColumnType::Date => Some(4),
            ColumnType::Int8
            | ColumnType::Float8
            | ColumnType::Timestamp
            | ColumnType::TimestampTz
            | ColumnType::Time => Some(8),
            ColumnType::Uuid => Some(16),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Bool => "boolean",
            ColumnType::Int2 => "smallint",
            ColumnType::Int4 => "integer",
            ColumnType::Int8 => "bigint",
            ColumnType::Float4 => "real",
            ColumnType::Float8 => "double precision",
            ColumnType::Numeric => "numeric",
            ColumnType::Text => "text",
            ColumnType::Bytea => "bytea",
            ColumnType::Uuid => "uuid",
            ColumnType::Timestamp => "timestamp",
            ColumnType::TimestampTz => "timestamptz",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Json => "json",
            ColumnType::Jsonb => "jsonb",
            ColumnType::Other(name) => name,
        };
        f.write_str(s)
    }
}
