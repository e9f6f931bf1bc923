//! Reference caches loaded from the target before transformation starts.
//!
//! Every cache is loaded in full, concurrently, and the whole load fails if
//! any single query fails. Once built, a [`ReferenceCache`] has no mutating
//! API and is shared between workers behind an `Arc`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use futures::future::try_join_all;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ReferenceConfig, ReferenceKind};
use crate::core::{RawRecord, SqlValue, TargetSession, TargetStore};
use crate::error::{MigrateError, Result};

/// Normalized component of a lookup key.
///
/// Integer widths and zero-scale decimals collapse into `Int` so a key read
/// as `int` from one store matches the same key read as `bigint` elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Bool(bool),
}

impl KeyPart {
    /// Normalize a value into a key component. NULL and non-key types give
    /// `None`.
    pub fn from_value(value: &SqlValue<'_>) -> Option<Self> {
        if let Some(v) = value.as_i64() {
            return Some(KeyPart::Int(v));
        }
        match value {
            SqlValue::Text(s) => Some(KeyPart::Text(s.trim().to_string())),
            SqlValue::Uuid(u) => Some(KeyPart::Uuid(*u)),
            SqlValue::Bool(b) => Some(KeyPart::Bool(*b)),
            _ => None,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::Text(s) => write!(f, "{}", s),
            KeyPart::Uuid(u) => write!(f, "{}", u),
            KeyPart::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Full key for a cache lookup, one part per key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey(pub Vec<KeyPart>);

impl LookupKey {
    pub fn single(part: KeyPart) -> Self {
        LookupKey(vec![part])
    }

    /// Build a key from values; `None` if any component is NULL.
    pub fn from_values<'v, I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'v SqlValue<'static>>,
    {
        values
            .into_iter()
            .map(KeyPart::from_value)
            .collect::<Option<Vec<_>>>()
            .map(LookupKey)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("/"))
    }
}

/// How duplicate composite keys are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TieBreak {
    /// The first row returned by the query is kept.
    FirstWins,
    /// The row with the highest value in this column is kept.
    LastByColumn(String),
}

/// What to load and how to shape it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheShape {
    /// First column of each row.
    Set,
    /// First column to second column; duplicate keys keep the first row.
    Map,
    /// First `key_columns` columns to the column after them.
    Composite {
        key_columns: usize,
        tie: TieBreak,
    },
}

/// One named cache to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSpec {
    pub name: String,
    pub query: String,
    pub shape: CacheShape,
}

impl From<&ReferenceConfig> for CacheSpec {
    fn from(config: &ReferenceConfig) -> Self {
        let shape = match config.kind {
            ReferenceKind::Set => CacheShape::Set,
            ReferenceKind::Map => CacheShape::Map,
            ReferenceKind::Composite => CacheShape::Composite {
                key_columns: config.key_columns,
                tie: match &config.order_column {
                    Some(column) => TieBreak::LastByColumn(column.clone()),
                    None => TieBreak::FirstWins,
                },
            },
        };
        CacheSpec {
            name: config.name.clone(),
            query: config.query.clone(),
            shape,
        }
    }
}

#[derive(Debug)]
enum CacheTable {
    Set(HashSet<LookupKey>),
    Map(HashMap<LookupKey, SqlValue<'static>>),
}

impl CacheTable {
    fn len(&self) -> usize {
        match self {
            CacheTable::Set(s) => s.len(),
            CacheTable::Map(m) => m.len(),
        }
    }
}

/// Immutable named lookup tables.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    tables: HashMap<String, CacheTable>,
}

impl ReferenceCache {
    /// An empty cache, for tables without references.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load every spec from the target. Any failure fails the whole load.
    pub async fn load(store: &dyn TargetStore, specs: &[CacheSpec]) -> Result<Self> {
        let loads = specs.iter().map(|spec| async move {
            let rows = store
                .query(&spec.query)
                .await
                .map_err(|e| MigrateError::cache(&spec.name, e))?;
            let table = build_table(spec, rows)?;
            debug!("Reference cache {}: {} entries", spec.name, table.len());
            Ok::<_, MigrateError>((spec.name.clone(), table))
        });

        let tables: HashMap<String, CacheTable> = try_join_all(loads).await?.into_iter().collect();
        if !tables.is_empty() {
            info!("Loaded {} reference caches", tables.len());
        }
        Ok(Self { tables })
    }

    /// Load every spec through one session, so the queries see rows the
    /// session wrote but has not committed yet.
    pub async fn load_in_session(
        session: &mut dyn TargetSession,
        specs: &[CacheSpec],
    ) -> Result<Self> {
        let mut tables = HashMap::with_capacity(specs.len());
        for spec in specs {
            let rows = session
                .query(&spec.query)
                .await
                .map_err(|e| MigrateError::cache(&spec.name, e))?;
            let table = build_table(spec, rows)?;
            debug!("Reference cache {}: {} entries", spec.name, table.len());
            tables.insert(spec.name.clone(), table);
        }
        Ok(Self { tables })
    }

    /// Build a cache from rows already in memory.
    pub fn from_rows(spec: &CacheSpec, rows: Vec<RawRecord>) -> Result<Self> {
        let table = build_table(spec, rows)?;
        let mut tables = HashMap::new();
        tables.insert(spec.name.clone(), table);
        Ok(Self { tables })
    }

    /// Whether a cache with this name was loaded.
    pub fn has(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Number of entries in the named cache.
    pub fn len(&self, name: &str) -> usize {
        self.tables.get(name).map_or(0, CacheTable::len)
    }

    /// Set membership. Map caches answer by key presence.
    pub fn contains(&self, name: &str, key: &LookupKey) -> Result<bool> {
        match self.table(name)? {
            CacheTable::Set(set) => Ok(set.contains(key)),
            CacheTable::Map(map) => Ok(map.contains_key(key)),
        }
    }

    /// Map or composite lookup.
    pub fn lookup(&self, name: &str, key: &LookupKey) -> Result<Option<&SqlValue<'static>>> {
        match self.table(name)? {
            CacheTable::Map(map) => Ok(map.get(key)),
            CacheTable::Set(_) => Err(MigrateError::Config(format!(
                "reference cache '{}' is a set and has no values",
                name
            ))),
        }
    }

    fn table(&self, name: &str) -> Result<&CacheTable> {
        self.tables
            .get(name)
            .ok_or_else(|| MigrateError::Config(format!("unknown reference cache '{}'", name)))
    }
}

fn build_table(spec: &CacheSpec, rows: Vec<RawRecord>) -> Result<CacheTable> {
    let width = match &spec.shape {
        CacheShape::Set => 1,
        CacheShape::Map => 2,
        CacheShape::Composite { key_columns, .. } => key_columns + 1,
    };
    if let Some(row) = rows.first() {
        if row.values().len() < width {
            return Err(MigrateError::cache(
                &spec.name,
                format!(
                    "query returns {} columns, {} needed",
                    row.values().len(),
                    width
                ),
            ));
        }
    }

    match &spec.shape {
        CacheShape::Set => Ok(CacheTable::Set(
            rows.iter()
                .filter_map(|r| KeyPart::from_value(&r.values()[0]).map(LookupKey::single))
                .collect(),
        )),
        CacheShape::Map => Ok(CacheTable::Map(first_wins(rows, 1))),
        CacheShape::Composite {
            key_columns,
            tie: TieBreak::FirstWins,
        } => Ok(CacheTable::Map(first_wins(rows, *key_columns))),
        CacheShape::Composite {
            key_columns,
            tie: TieBreak::LastByColumn(column),
        } => last_wins(spec, rows, *key_columns, column).map(CacheTable::Map),
    }
}

fn split_row(row: &RawRecord, key_columns: usize) -> Option<(LookupKey, SqlValue<'static>)> {
    let values = row.values();
    let key = LookupKey::from_values(&values[..key_columns])?;
    Some((key, values[key_columns].clone()))
}

fn first_wins(rows: Vec<RawRecord>, key_columns: usize) -> HashMap<LookupKey, SqlValue<'static>> {
    let mut map = HashMap::with_capacity(rows.len());
    for row in &rows {
        if let Some((key, value)) = split_row(row, key_columns) {
            map.entry(key).or_insert(value);
        }
    }
    map
}

/// Stable ascending sort on the order column, then insert in order so the
/// highest ordering value overwrites the rest. NULL orders first.
fn last_wins(
    spec: &CacheSpec,
    mut rows: Vec<RawRecord>,
    key_columns: usize,
    order_column: &str,
) -> Result<HashMap<LookupKey, SqlValue<'static>>> {
    if let Some(row) = rows.first() {
        row.value(order_column)
            .map_err(|e| MigrateError::cache(&spec.name, e))?;
    }
    rows.sort_by(|a, b| {
        match (a.value(order_column), b.value(order_column)) {
            (Ok(x), Ok(y)) => compare_values(x, y),
            _ => Ordering::Equal,
        }
    });

    let mut map = HashMap::with_capacity(rows.len());
    for row in &rows {
        if let Some((key, value)) = split_row(row, key_columns) {
            map.insert(key, value);
        }
    }
    Ok(map)
}

/// Total order over comparable values of the same type. Mixed types compare
/// equal, which keeps the stable sort's input order.
pub fn compare_values(a: &SqlValue<'_>, b: &SqlValue<'_>) -> Ordering {
    match (a, b) {
        (SqlValue::Null(_), SqlValue::Null(_)) => Ordering::Equal,
        (SqlValue::Null(_), _) => Ordering::Less,
        (_, SqlValue::Null(_)) => Ordering::Greater,
        (SqlValue::DateTime(x), SqlValue::DateTime(y)) => x.cmp(y),
        (SqlValue::DateTimeOffset(x), SqlValue::DateTimeOffset(y)) => x.cmp(y),
        (SqlValue::Date(x), SqlValue::Date(y)) => x.cmp(y),
        (SqlValue::Time(x), SqlValue::Time(y)) => x.cmp(y),
        (SqlValue::Text(x), SqlValue::Text(y)) => x.cmp(y),
        (SqlValue::Decimal(x), SqlValue::Decimal(y)) => x.cmp(y),
        (SqlValue::F32(x), SqlValue::F32(y)) => x.total_cmp(y),
        (SqlValue::F64(x), SqlValue::F64(y)) => x.total_cmp(y),
        (SqlValue::Bool(x), SqlValue::Bool(y)) => x.cmp(y),
        (SqlValue::Uuid(x), SqlValue::Uuid(y)) => x.cmp(y),
        _ => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
    }
}
