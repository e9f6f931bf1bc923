//! In-memory source and target stores for tests.
//!
//! [`MemoryStore`] keeps tables as rows of [`SqlValue`]s and gives every
//! session a private transaction: writes are applied to a shadow copy and
//! replayed onto the shared tables on commit. Text COPY payloads go through
//! the real encoder and are parsed back, so stored text values are what the
//! server would have received. Tables created with column types also check
//! binary COPY payloads field by field, rejecting a fixed-width field whose
//! length does not match its column the way the server does.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cache::{KeyPart, LookupKey};
use crate::core::{
    CaseUpdate, ColumnType, CopyFormat, KeyConstraint, MergeOutcome, MergePlan, RawRecord, RecordSchema,
    RowSource, RowStream, SqlNullType, SqlValue, StagedUpdatePlan, TargetRecord, TargetSession,
    TargetStore,
};
use crate::error::{MigrateError, Result};
use crate::load::{binary_copy, text_copy};
use crate::report::{Progress, ProgressReporter, RunSummary};

/// Build raw records sharing one schema.
pub fn raw_rows(columns: &[&str], data: Vec<Vec<SqlValue<'static>>>) -> Vec<RawRecord> {
    let schema = Arc::new(RecordSchema::new(columns.iter().copied()));
    data.into_iter()
        .map(|values| RawRecord::new(schema.clone(), values))
        .collect()
}

#[derive(Clone)]
struct SourceTable {
    schema: Arc<RecordSchema>,
    rows: Vec<Vec<SqlValue<'static>>>,
}

/// Source serving fixed rows per query.
#[derive(Clone, Default)]
pub struct MemorySource {
    tables: HashMap<String, SourceTable>,
    fail_at: Option<(usize, String)>,
    row_delay: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(
        mut self,
        query: &str,
        columns: &[&str],
        rows: Vec<Vec<SqlValue<'static>>>,
    ) -> Self {
        self.tables.insert(
            query.to_string(),
            SourceTable {
                schema: Arc::new(RecordSchema::new(columns.iter().copied())),
                rows,
            },
        );
        self
    }

    /// The cursor yields an error instead of row `index`.
    pub fn fail_at(mut self, index: usize, message: &str) -> Self {
        self.fail_at = Some((index, message.to_string()));
        self
    }

    /// Sleep before producing each row.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }
}

#[async_trait]
impl RowSource for MemorySource {
    fn open_cursor(&self, query: &str, buffer: usize) -> RowStream {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let table = self.tables.get(query).cloned();
        let fail_at = self.fail_at.clone();
        let delay = self.row_delay;
        let query = query.to_string();

        tokio::spawn(async move {
            let Some(table) = table else {
                let _ = tx
                    .send(Err(MigrateError::transfer(
                        "source",
                        format!("no rows registered for query: {}", query),
                    )))
                    .await;
                return;
            };
            for (i, values) in table.rows.into_iter().enumerate() {
                if let Some((at, message)) = &fail_at {
                    if *at == i {
                        let _ = tx
                            .send(Err(MigrateError::transfer("source", message.clone())))
                            .await;
                        return;
                    }
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let record = RawRecord::new(table.schema.clone(), values);
                if tx.send(Ok(record)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn count(&self, query: &str) -> Result<i64> {
        self.tables
            .get(query)
            .map(|t| t.rows.len() as i64)
            .ok_or_else(|| MigrateError::transfer("source", format!("unknown query: {}", query)))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

/// One table of the in-memory target.
#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue<'static>>>,
    pub unique_key: Option<Vec<String>>,
    /// Declared column types; untyped tables accept any value.
    pub types: Option<Vec<ColumnType>>,
}

impl MemTable {
    fn index(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| {
                MigrateError::transfer("memory", format!("column \"{}\" does not exist", column))
            })
    }

    fn key_of(&self, row: &[SqlValue<'static>], key_columns: &[String]) -> Result<Option<LookupKey>> {
        let idx = key_columns
            .iter()
            .map(|k| self.index(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(LookupKey::from_values(idx.iter().map(|i| &row[*i])))
    }

    fn find(&self, key_columns: &[String], key: &LookupKey) -> Result<Option<usize>> {
        for (i, row) in self.rows.iter().enumerate() {
            if self.key_of(row, key_columns)?.as_ref() == Some(key) {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn duplicate_keys(&self, key_columns: &[String]) -> Result<i64> {
        let mut seen = HashSet::new();
        let mut dups = HashSet::new();
        for row in &self.rows {
            if let Some(key) = self.key_of(row, key_columns)? {
                if !seen.insert(key.clone()) {
                    dups.insert(key);
                }
            }
        }
        Ok(dups.len() as i64)
    }

    fn has_unique(&self, key_columns: &[String]) -> bool {
        self.unique_key.as_ref().is_some_and(|k| same_columns(k, key_columns))
    }

    /// Types of `columns`, when the table declares them.
    fn types_for(&self, columns: &[String]) -> Result<Option<Vec<ColumnType>>> {
        let Some(types) = &self.types else {
            return Ok(None);
        };
        columns
            .iter()
            .map(|c| self.index(c).map(|i| types[i].clone()))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Widen a record in load column order to a full table row.
    fn widen(&self, columns: &[String], values: &[SqlValue<'static>]) -> Result<Vec<SqlValue<'static>>> {
        let mut row = vec![SqlValue::Null(SqlNullType::String); self.columns.len()];
        for (column, value) in columns.iter().zip(values) {
            row[self.index(column)?] = value.clone();
        }
        Ok(row)
    }
}

fn same_columns(a: &[String], b: &[String]) -> bool {
    let norm = |cols: &[String]| {
        let mut v: Vec<String> = cols.iter().map(|c| c.to_lowercase()).collect();
        v.sort();
        v
    };
    norm(a) == norm(b)
}

#[derive(Debug, Clone)]
enum Op {
    Append {
        table: String,
        rows: Vec<Vec<SqlValue<'static>>>,
    },
    Upsert {
        table: String,
        columns: Vec<String>,
        keys: Vec<String>,
        row: Vec<SqlValue<'static>>,
    },
    UpdateByKey {
        table: String,
        columns: Vec<String>,
        keys: Vec<String>,
        row: Vec<SqlValue<'static>>,
        touch: Option<String>,
    },
    Case(CaseUpdate),
    Truncate {
        table: String,
    },
}

/// Rows affected by one op: `(inserted, updated)`.
fn apply_op(tables: &mut HashMap<String, MemTable>, op: &Op) -> Result<(u64, u64)> {
    let name = match op {
        Op::Append { table, .. }
        | Op::Upsert { table, .. }
        | Op::UpdateByKey { table, .. }
        | Op::Truncate { table } => table,
        Op::Case(update) => &update.table,
    };
    let table = tables
        .get_mut(&name.to_lowercase())
        .ok_or_else(|| MigrateError::transfer(name, "relation does not exist"))?;

    match op {
        Op::Append { rows, .. } => {
            if let Some(keys) = table.unique_key.clone() {
                for row in rows {
                    if let Some(key) = table.key_of(row, &keys)? {
                        if table.find(&keys, &key)?.is_some() {
                            return Err(MigrateError::transfer(
                                name,
                                format!("duplicate key value violates unique constraint: {}", key),
                            ));
                        }
                    }
                    table.rows.push(row.clone());
                }
            } else {
                table.rows.extend(rows.iter().cloned());
            }
            Ok((rows.len() as u64, 0))
        }
        Op::Upsert {
            columns, keys, row, ..
        } => {
            if !table.has_unique(keys) {
                return Err(MigrateError::transfer(
                    name,
                    "there is no unique or exclusion constraint matching the ON CONFLICT specification",
                ));
            }
            let full = table.widen(columns, row)?;
            let Some(key) = table.key_of(&full, keys)? else {
                table.rows.push(full);
                return Ok((1, 0));
            };
            match table.find(keys, &key)? {
                Some(i) => {
                    for (column, value) in columns.iter().zip(row) {
                        let idx = table.index(column)?;
                        table.rows[i][idx] = value.clone();
                    }
                    Ok((0, 1))
                }
                None => {
                    table.rows.push(full);
                    Ok((1, 0))
                }
            }
        }
        Op::UpdateByKey {
            columns,
            keys,
            row,
            touch,
            ..
        } => {
            let full = table.widen(columns, row)?;
            let Some(key) = table.key_of(&full, keys)? else {
                return Ok((0, 0));
            };
            let touch_idx = touch.as_deref().map(|t| table.index(t)).transpose()?;
            let mut matched = 0;
            for i in 0..table.rows.len() {
                if table.key_of(&table.rows[i], keys)?.as_ref() != Some(&key) {
                    continue;
                }
                for (column, value) in columns.iter().zip(row) {
                    if keys.iter().any(|k| k.eq_ignore_ascii_case(column)) {
                        continue;
                    }
                    let idx = table.index(column)?;
                    table.rows[i][idx] = value.clone();
                }
                if let Some(idx) = touch_idx {
                    table.rows[i][idx] = SqlValue::text_owned("CURRENT_TIMESTAMP");
                }
                matched += 1;
            }
            Ok((0, matched))
        }
        Op::Case(update) => {
            let key_idx = table.index(&update.key_column)?;
            let col_idx = table.index(&update.target_column)?;
            let assignments: HashMap<KeyPart, &SqlValue<'static>> = update
                .assignments
                .iter()
                .filter_map(|(k, v)| KeyPart::from_value(k).map(|k| (k, v)))
                .collect();
            let mut matched = 0;
            for row in table.rows.iter_mut() {
                let Some(key) = KeyPart::from_value(&row[key_idx]) else {
                    continue;
                };
                if let Some(value) = assignments.get(&key) {
                    row[col_idx] = (*value).clone();
                    matched += 1;
                }
            }
            Ok((0, matched))
        }
        Op::Truncate { .. } => {
            table.rows.clear();
            Ok((0, 0))
        }
    }
}

#[derive(Default)]
struct StoreInner {
    tables: Mutex<HashMap<String, MemTable>>,
    queries: Mutex<HashMap<String, Vec<RawRecord>>>,
    statements: Mutex<Vec<String>>,
    batch_sizes: Mutex<Vec<usize>>,
    formats: Mutex<Vec<CopyFormat>>,
    constraint_overrides: Mutex<HashMap<String, KeyConstraint>>,
    failing_records: Mutex<HashSet<String>>,
    fail_key_creation: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
    sessions_opened: AtomicUsize,
}

/// Target store holding tables in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, name: &str, columns: &[&str]) {
        self.inner.tables.lock().unwrap().insert(
            name.to_lowercase(),
            MemTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            },
        );
    }

    pub fn create_typed_table(&self, name: &str, columns: &[(&str, ColumnType)]) {
        self.inner.tables.lock().unwrap().insert(
            name.to_lowercase(),
            MemTable {
                columns: columns.iter().map(|(c, _)| c.to_string()).collect(),
                types: Some(columns.iter().map(|(_, t)| t.clone()).collect()),
                ..Default::default()
            },
        );
    }

    pub fn create_table_with_key(&self, name: &str, columns: &[&str], key: &[&str]) {
        self.create_table(name, columns);
        let mut tables = self.inner.tables.lock().unwrap();
        if let Some(table) = tables.get_mut(&name.to_lowercase()) {
            table.unique_key = Some(key.iter().map(|k| k.to_string()).collect());
        }
    }

    pub fn insert_rows(&self, name: &str, rows: Vec<Vec<SqlValue<'static>>>) {
        let mut tables = self.inner.tables.lock().unwrap();
        tables
            .get_mut(&name.to_lowercase())
            .unwrap()
            .rows
            .extend(rows);
    }

    pub fn table(&self, name: &str) -> MemTable {
        self.inner.tables.lock().unwrap()[&name.to_lowercase()].clone()
    }

    pub fn rows(&self, name: &str) -> Vec<Vec<SqlValue<'static>>> {
        self.table(name).rows
    }

    /// Values of one column across all rows.
    pub fn column(&self, name: &str, column: &str) -> Vec<SqlValue<'static>> {
        let table = self.table(name);
        let idx = table.index(column).unwrap();
        table.rows.iter().map(|r| r[idx].clone()).collect()
    }

    pub fn set_query_result(&self, sql: &str, rows: Vec<RawRecord>) {
        self.inner
            .queries
            .lock()
            .unwrap()
            .insert(sql.to_string(), rows);
    }

    pub fn set_key_constraint(&self, table: &str, constraint: KeyConstraint) {
        self.inner
            .constraint_overrides
            .lock()
            .unwrap()
            .insert(table.to_lowercase(), constraint);
    }

    /// Any write that carries this record fails.
    pub fn fail_batches_with(&self, record_id: &str) {
        self.inner
            .failing_records
            .lock()
            .unwrap()
            .insert(record_id.to_string());
    }

    pub fn fail_unique_key_creation(&self) {
        self.inner.fail_key_creation.store(true, Ordering::SeqCst);
    }

    /// Sleep inside every bulk write.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.inner.write_delay.lock().unwrap() = Some(delay);
    }

    /// Record counts of every bulk write call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batch_sizes.lock().unwrap().clone()
    }

    pub fn copy_formats(&self) -> Vec<CopyFormat> {
        self.inner.formats.lock().unwrap().clone()
    }

    /// Statements run through [`TargetStore::execute`] or a session.
    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock().unwrap().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    fn with_table<T>(&self, name: &str, f: impl FnOnce(&mut MemTable) -> Result<T>) -> Result<T> {
        let mut tables = self.inner.tables.lock().unwrap();
        let table = tables
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| MigrateError::transfer(name, "relation does not exist"))?;
        f(table)
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn session(&self) -> Result<Box<dyn TargetSession>> {
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
            tx: None,
        }))
    }

    async fn query(&self, sql: &str) -> Result<Vec<RawRecord>> {
        self.inner
            .queries
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .ok_or_else(|| MigrateError::transfer("memory", format!("no result for query: {}", sql)))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.inner.statements.lock().unwrap().push(sql.to_string());
        Ok(0)
    }

    /// Untyped and unknown tables report text columns.
    async fn column_types(&self, table: &str, columns: &[String]) -> Result<Vec<ColumnType>> {
        let untyped = || vec![ColumnType::Text; columns.len()];
        match self.inner.tables.lock().unwrap().get(&table.to_lowercase()) {
            Some(t) => Ok(t.types_for(columns)?.unwrap_or_else(untyped)),
            None => Ok(untyped()),
        }
    }

    async fn key_constraint(&self, table: &str, key_columns: &[String]) -> Result<KeyConstraint> {
        if let Some(c) = self
            .inner
            .constraint_overrides
            .lock()
            .unwrap()
            .get(&table.to_lowercase())
        {
            return Ok(*c);
        }
        self.with_table(table, |t| {
            if t.has_unique(key_columns) {
                return Ok(KeyConstraint::Present);
            }
            match t.duplicate_keys(key_columns)? {
                0 => Ok(KeyConstraint::Creatable),
                n => Ok(KeyConstraint::Blocked { duplicate_keys: n }),
            }
        })
    }

    async fn create_unique_key(&self, table: &str, key_columns: &[String]) -> Result<()> {
        if self.inner.fail_key_creation.load(Ordering::SeqCst) {
            return Err(MigrateError::transfer(table, "permission denied to create index"));
        }
        self.with_table(table, |t| {
            if t.duplicate_keys(key_columns)? > 0 {
                return Err(MigrateError::transfer(table, "could not create unique index"));
            }
            t.unique_key = Some(key_columns.to_vec());
            Ok(())
        })
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        self.with_table(table, |t| {
            t.rows.clear();
            Ok(())
        })
    }

    async fn row_count(&self, table: &str) -> Result<i64> {
        self.with_table(table, |t| Ok(t.rows.len() as i64))
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}

struct Transaction {
    shadow: HashMap<String, MemTable>,
    ops: Vec<Op>,
}

/// Writer session with a private transaction.
pub struct MemorySession {
    inner: Arc<StoreInner>,
    tx: Option<Transaction>,
}

impl MemorySession {
    async fn before_write(&self, table: &str, records: &[TargetRecord]) -> Result<()> {
        let delay = *self.inner.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.batch_sizes.lock().unwrap().push(records.len());
        let failing = self.inner.failing_records.lock().unwrap();
        if let Some(r) = records.iter().find(|r| failing.contains(&r.record_id)) {
            return Err(MigrateError::transfer(
                table,
                format!("injected failure at record {}", r.record_id),
            ));
        }
        Ok(())
    }

    /// Apply ops to the transaction shadow, or straight to the tables when
    /// no transaction is open.
    fn run(&mut self, ops: Vec<Op>) -> Result<(u64, u64)> {
        let mut total = (0, 0);
        match &mut self.tx {
            Some(tx) => {
                for op in ops {
                    let name = op_table(&op).to_lowercase();
                    if !tx.shadow.contains_key(&name) {
                        let committed = self.inner.tables.lock().unwrap().get(&name).cloned();
                        if let Some(t) = committed {
                            tx.shadow.insert(name, t);
                        }
                    }
                    let (i, u) = apply_op(&mut tx.shadow, &op)?;
                    total = (total.0 + i, total.1 + u);
                    tx.ops.push(op);
                }
            }
            None => {
                let mut tables = self.inner.tables.lock().unwrap();
                for op in ops {
                    let (i, u) = apply_op(&mut tables, &op)?;
                    total = (total.0 + i, total.1 + u);
                }
            }
        }
        Ok(total)
    }

    /// Values as the server stores them from a binary COPY of `records`.
    fn binary_values(
        &self,
        table: &str,
        columns: &[String],
        records: &[TargetRecord],
    ) -> Result<Vec<Vec<SqlValue<'static>>>> {
        match self.shadow_table(table)?.types_for(columns)? {
            Some(types) => {
                let payload = binary_copy::encode_records(records, columns, &types)?;
                decode_binary(&payload, columns, &types, records)
            }
            None => Ok(records.iter().map(|r| r.values.clone()).collect()),
        }
    }

    fn shadow_table(&self, name: &str) -> Result<MemTable> {
        let key = name.to_lowercase();
        if let Some(t) = self.tx.as_ref().and_then(|tx| tx.shadow.get(&key)) {
            return Ok(t.clone());
        }
        self.inner
            .tables
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| MigrateError::transfer(name, "relation does not exist"))
    }
}

fn op_table(op: &Op) -> &str {
    match op {
        Op::Append { table, .. }
        | Op::Upsert { table, .. }
        | Op::UpdateByKey { table, .. }
        | Op::Truncate { table } => table,
        Op::Case(update) => &update.table,
    }
}

fn take<'p>(payload: &'p [u8], pos: &mut usize, n: usize) -> Result<&'p [u8]> {
    let bytes = payload
        .get(*pos..*pos + n)
        .ok_or_else(|| MigrateError::transfer("memory", "unexpected EOF in COPY data"))?;
    *pos += n;
    Ok(bytes)
}

/// Read a binary COPY payload back against the column types.
///
/// A fixed-width field of the wrong length fails like the server's
/// `incorrect binary data format` error. Integer fields are read at the
/// column width; other fields keep the record's value.
fn decode_binary(
    payload: &[u8],
    columns: &[String],
    types: &[ColumnType],
    records: &[TargetRecord],
) -> Result<Vec<Vec<SqlValue<'static>>>> {
    let mut pos = 0;
    take(payload, &mut pos, 19)?;
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let count_bytes = take(payload, &mut pos, 2)?;
        let count = i16::from_be_bytes([count_bytes[0], count_bytes[1]]);
        if count as usize != types.len() {
            return Err(MigrateError::transfer(
                "memory",
                format!("row field count is {}, expected {}", count, types.len()),
            ));
        }
        let mut row = Vec::with_capacity(types.len());
        for (i, ty) in types.iter().enumerate() {
            let len_bytes = take(payload, &mut pos, 4)?;
            let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
            if len < 0 {
                row.push(SqlValue::Null(SqlNullType::String));
                continue;
            }
            let field = take(payload, &mut pos, len as usize)?;
            if ty.fixed_width().is_some_and(|w| w != field.len()) {
                return Err(MigrateError::transfer(
                    "memory",
                    format!(
                        "incorrect binary data format in column {} (SQLSTATE 22P03)",
                        columns[i]
                    ),
                ));
            }
            let value = match ty {
                ColumnType::Int2 => SqlValue::I16(i16::from_be_bytes([field[0], field[1]])),
                ColumnType::Int4 => {
                    SqlValue::I32(i32::from_be_bytes([field[0], field[1], field[2], field[3]]))
                }
                ColumnType::Int8 => {
                    let mut be = [0u8; 8];
                    be.copy_from_slice(field);
                    SqlValue::I64(i64::from_be_bytes(be))
                }
                _ => record.values[i].clone(),
            };
            row.push(value);
        }
        rows.push(row);
    }
    let trailer = take(payload, &mut pos, 2)?;
    if trailer != [0xff, 0xff] {
        return Err(MigrateError::transfer("memory", "missing COPY trailer"));
    }
    Ok(rows)
}

/// Parse a text COPY payload back into values.
fn decode_text(payload: &[u8]) -> Vec<Vec<SqlValue<'static>>> {
    String::from_utf8_lossy(payload)
        .lines()
        .map(|line| {
            text_copy::split_row(line)
                .into_iter()
                .map(|f| match f {
                    Some(s) => SqlValue::text_owned(s),
                    None => SqlValue::Null(SqlNullType::String),
                })
                .collect()
        })
        .collect()
}

#[async_trait]
impl TargetSession for MemorySession {
    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(MigrateError::transfer("memory", "transaction already open"));
        }
        self.tx = Some(Transaction {
            shadow: HashMap::new(),
            ops: Vec::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| MigrateError::transfer("memory", "no transaction open"))?;
        let mut tables = self.inner.tables.lock().unwrap();
        let mut replay = tables.clone();
        for op in &tx.ops {
            apply_op(&mut replay, op)?;
        }
        *tables = replay;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    async fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        records: &[TargetRecord],
        format: CopyFormat,
    ) -> Result<u64> {
        self.before_write(table, records).await?;
        self.inner.formats.lock().unwrap().push(format);
        let values: Vec<Vec<SqlValue<'static>>> = match format {
            CopyFormat::Binary => self.binary_values(table, columns, records)?,
            CopyFormat::Text { sanitize } => {
                decode_text(&text_copy::encode_records(records, sanitize))
            }
        };
        let target = self.shadow_table(table)?;
        let rows = values
            .iter()
            .map(|v| target.widen(columns, v))
            .collect::<Result<Vec<_>>>()?;
        let (inserted, _) = self.run(vec![Op::Append {
            table: table.to_string(),
            rows,
        }])?;
        Ok(inserted)
    }

    async fn merge_from_staging(
        &mut self,
        plan: &MergePlan,
        records: &[TargetRecord],
    ) -> Result<MergeOutcome> {
        self.before_write(&plan.table, records).await?;
        let target = self.shadow_table(&plan.table)?;
        // Later records with the same key replace earlier ones; NULL keys
        // never collapse.
        let mut latest: HashMap<LookupKey, usize> = HashMap::new();
        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            let row = record.values.clone();
            let full = target.widen(&plan.columns, &row)?;
            let op = Op::Upsert {
                table: plan.table.clone(),
                columns: plan.columns.clone(),
                keys: plan.key_columns.clone(),
                row,
            };
            match target.key_of(&full, &plan.key_columns)? {
                Some(key) => match latest.get(&key) {
                    Some(&i) => ops[i] = op,
                    None => {
                        latest.insert(key, ops.len());
                        ops.push(op);
                    }
                },
                None => ops.push(op),
            }
        }
        let (inserted, updated) = self.run(ops)?;
        Ok(MergeOutcome { inserted, updated })
    }

    async fn update_from_staging(
        &mut self,
        plan: &StagedUpdatePlan,
        records: &[TargetRecord],
    ) -> Result<u64> {
        self.before_write(&plan.table, records).await?;
        let ops = self
            .binary_values(&plan.table, &plan.columns, records)?
            .into_iter()
            .map(|row| Op::UpdateByKey {
                table: plan.table.clone(),
                columns: plan.columns.clone(),
                keys: plan.key_columns.clone(),
                row,
                touch: plan.touch_column.clone(),
            })
            .collect();
        let (_, updated) = self.run(ops)?;
        Ok(updated)
    }

    async fn row_exists(
        &mut self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        record: &TargetRecord,
    ) -> Result<bool> {
        let target = self.shadow_table(table)?;
        let full = target.widen(columns, &record.values)?;
        match target.key_of(&full, key_columns)? {
            Some(key) => Ok(target.find(key_columns, &key)?.is_some()),
            None => Ok(false),
        }
    }

    async fn insert_row(
        &mut self,
        table: &str,
        columns: &[String],
        record: &TargetRecord,
    ) -> Result<()> {
        self.before_write(table, std::slice::from_ref(record)).await?;
        let target = self.shadow_table(table)?;
        let row = target.widen(columns, &record.values)?;
        self.run(vec![Op::Append {
            table: table.to_string(),
            rows: vec![row],
        }])?;
        Ok(())
    }

    async fn update_row(
        &mut self,
        table: &str,
        columns: &[String],
        key_columns: &[String],
        record: &TargetRecord,
    ) -> Result<u64> {
        self.before_write(table, std::slice::from_ref(record)).await?;
        let (_, updated) = self.run(vec![Op::UpdateByKey {
            table: table.to_string(),
            columns: columns.to_vec(),
            keys: key_columns.to_vec(),
            row: record.values.clone(),
            touch: None,
        }])?;
        Ok(updated)
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<RawRecord>> {
        self.inner
            .queries
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .ok_or_else(|| MigrateError::transfer("memory", format!("no result for query: {}", sql)))
    }

    /// `TRUNCATE TABLE` runs inside the session; anything else is recorded.
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.inner.statements.lock().unwrap().push(sql.to_string());
        if let Some(table) = sql.strip_prefix("TRUNCATE TABLE ") {
            self.run(vec![Op::Truncate {
                table: table.replace('"', ""),
            }])?;
        }
        Ok(0)
    }

    async fn apply_case_update(&mut self, update: &CaseUpdate) -> Result<u64> {
        self.inner
            .statements
            .lock()
            .unwrap()
            .push(crate::load::sql::case_update_statement(update));
        let (_, updated) = self.run(vec![Op::Case(update.clone())])?;
        Ok(updated)
    }
}

/// Reporter that keeps every event.
#[derive(Default)]
pub struct RecordingReporter {
    progress: Mutex<Vec<Progress>>,
    errors: Mutex<Vec<(String, String, u64)>>,
    completed: Mutex<Vec<RunSummary>>,
}

impl RecordingReporter {
    pub fn progress_count(&self) -> usize {
        self.progress.lock().unwrap().len()
    }

    pub fn progress(&self) -> Vec<Progress> {
        self.progress.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(String, String, u64)> {
        self.errors.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<RunSummary> {
        self.completed.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report_progress(&self, progress: &Progress) {
        self.progress.lock().unwrap().push(progress.clone());
    }

    fn report_error(&self, table: &str, message: &str, at_record: u64) {
        self.errors
            .lock()
            .unwrap()
            .push((table.to_string(), message.to_string(), at_record));
    }

    fn report_completed(&self, summary: &RunSummary) {
        self.completed.lock().unwrap().push(summary.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_field_width_must_match_column() {
        let columns = vec!["id".to_string(), "owner_id".to_string()];
        let records = vec![TargetRecord::new("1", vec![SqlValue::I64(1), SqlValue::I64(7)])];
        // Encoded for bigint columns, read back as integer ones.
        let payload =
            binary_copy::encode_records(&records, &columns, &[ColumnType::Int8, ColumnType::Int8])
                .unwrap();

        let err = decode_binary(&payload, &columns, &[ColumnType::Int8, ColumnType::Int4], &records)
            .unwrap_err();
        assert!(err.to_string().contains("incorrect binary data format in column owner_id"));

        let rows =
            decode_binary(&payload, &columns, &[ColumnType::Int8, ColumnType::Int8], &records)
                .unwrap();
        assert_eq!(rows, vec![vec![SqlValue::I64(1), SqlValue::I64(7)]]);
    }

    #[tokio::test]
    async fn test_session_truncate_is_transactional() {
        let store = MemoryStore::new();
        store.create_table("events", &["id"]);
        store.insert_rows("events", vec![vec![SqlValue::I64(1)]]);
        let mut session = store.session().await.unwrap();

        session.begin().await.unwrap();
        session.execute("TRUNCATE TABLE \"events\"").await.unwrap();
        assert_eq!(store.rows("events").len(), 1);
        session.rollback().await.unwrap();
        assert_eq!(store.rows("events").len(), 1);

        session.begin().await.unwrap();
        session.execute("TRUNCATE TABLE \"events\"").await.unwrap();
        session.commit().await.unwrap();
        assert!(store.rows("events").is_empty());
    }
}
