//! SQL text for the PostgreSQL load primitives.

use crate::core::{CaseUpdate, CopyFormat, MergePlan, StagedUpdatePlan};

use super::text_copy::COPY_OPTIONS;

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name (`schema.table`).
pub fn qualify_table(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(table),
    }
}

/// Unqualified part of a table name.
pub fn bare_table(table: &str) -> &str {
    table.rsplit_once('.').map_or(table, |(_, name)| name)
}

/// Comma separated quoted column list.
pub fn column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `key1 = $n AND key2 = $n+1` with parameters numbered after `offset`.
fn key_predicate(key_columns: &[String], offset: usize) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{} = ${}", quote_ident(k), offset + i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn copy_statement(table: &str, columns: &[String], format: CopyFormat) -> String {
    let options = match format {
        CopyFormat::Binary => "FORMAT BINARY",
        CopyFormat::Text { .. } => COPY_OPTIONS,
    };
    format!(
        "COPY {} ({}) FROM STDIN WITH ({})",
        qualify_table(table),
        column_list(columns),
        options
    )
}

pub fn create_staging(staging: &str, table: &str) -> String {
    format!(
        "CREATE TEMP TABLE {} (LIKE {} INCLUDING DEFAULTS)",
        quote_ident(staging),
        qualify_table(table)
    )
}

pub fn drop_staging(staging: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(staging))
}

/// `INSERT ... SELECT ... ON CONFLICT` from the staging table.
///
/// Staged rows sharing a key collapse to the last one copied (`ctid`
/// order of the freshly filled temp table), since `ON CONFLICT` cannot
/// touch one row twice in a statement. Rows with a NULL key never conflict
/// and are all kept. Returns the inserted and updated row counts.
pub fn merge_statement(plan: &MergePlan) -> String {
    let cols = column_list(&plan.columns);
    let keys = column_list(&plan.key_columns);
    let staging = quote_ident(&plan.staging_table);
    let not_null: Vec<String> = plan
        .key_columns
        .iter()
        .map(|k| format!("{} IS NOT NULL", quote_ident(k)))
        .collect();
    let any_null: Vec<String> = plan
        .key_columns
        .iter()
        .map(|k| format!("{} IS NULL", quote_ident(k)))
        .collect();
    let updates: Vec<String> = plan
        .update_columns()
        .into_iter()
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "WITH latest AS (\
         (SELECT DISTINCT ON ({keys}) {cols} FROM {staging} WHERE {not_null} ORDER BY {keys}, ctid DESC) \
         UNION ALL (SELECT {cols} FROM {staging} WHERE {any_null})), \
         merged AS (INSERT INTO {table} ({cols}) SELECT {cols} FROM latest ON CONFLICT ({keys}) {action} \
         RETURNING (xmax = 0) AS inserted) \
         SELECT COUNT(*) FILTER (WHERE inserted), COUNT(*) FILTER (WHERE NOT inserted) FROM merged",
        keys = keys,
        cols = cols,
        staging = staging,
        not_null = not_null.join(" AND "),
        any_null = any_null.join(" OR "),
        table = qualify_table(&plan.table),
        action = action
    )
}

/// `UPDATE target FROM staging` matching on the key columns.
pub fn staged_update_statement(plan: &StagedUpdatePlan) -> String {
    let mut sets: Vec<String> = plan
        .columns
        .iter()
        .filter(|c| !plan.key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
        .map(|c| format!("{} = s.{}", quote_ident(c), quote_ident(c)))
        .collect();
    if let Some(touch) = &plan.touch_column {
        sets.push(format!("{} = CURRENT_TIMESTAMP", quote_ident(touch)));
    }
    let matches: Vec<String> = plan
        .key_columns
        .iter()
        .map(|k| format!("t.{} = s.{}", quote_ident(k), quote_ident(k)))
        .collect();
    format!(
        "UPDATE {} AS t SET {} FROM {} AS s WHERE {}",
        qualify_table(&plan.table),
        sets.join(", "),
        quote_ident(&plan.staging_table),
        matches.join(" AND ")
    )
}

/// `UPDATE t SET col = CASE key WHEN k1 THEN v1 ... ELSE col END WHERE key IN (...)`.
pub fn case_update_statement(update: &CaseUpdate) -> String {
    let key = quote_ident(&update.key_column);
    let col = quote_ident(&update.target_column);
    let mut whens = String::new();
    let mut keys = Vec::with_capacity(update.assignments.len());
    for (k, v) in &update.assignments {
        let k = k.to_sql_literal();
        whens.push_str(&format!(" WHEN {} THEN {}", k, v.to_sql_literal()));
        keys.push(k);
    }
    format!(
        "UPDATE {} SET {} = CASE {}{} ELSE {} END WHERE {} IN ({})",
        qualify_table(&update.table),
        col,
        key,
        whens,
        col,
        key,
        keys.join(", ")
    )
}

pub fn exists_statement(table: &str, key_columns: &[String]) -> String {
    format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE {})",
        qualify_table(table),
        key_predicate(key_columns, 0)
    )
}

pub fn insert_statement(table: &str, columns: &[String]) -> String {
    let params: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualify_table(table),
        column_list(columns),
        params.join(", ")
    )
}

/// UPDATE of the non-key columns.
///
/// Parameters are the non-key values in column order followed by the key
/// values in key order.
pub fn update_statement(table: &str, columns: &[String], key_columns: &[String]) -> String {
    let value_columns: Vec<&String> = columns
        .iter()
        .filter(|c| !key_columns.iter().any(|k| k.eq_ignore_ascii_case(c)))
        .collect();
    let sets: Vec<String> = value_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        qualify_table(table),
        sets.join(", "),
        key_predicate(key_columns, value_columns.len())
    )
}

/// Zero-row select whose result columns carry the target column types.
pub fn describe_columns_statement(table: &str, columns: &[String]) -> String {
    format!(
        "SELECT {} FROM {} LIMIT 0",
        column_list(columns),
        qualify_table(table)
    )
}

pub fn truncate_statement(table: &str) -> String {
    format!("TRUNCATE TABLE {}", qualify_table(table))
}

/// Number of key values that occur more than once in `table`.
pub fn duplicate_keys_statement(table: &str, key_columns: &[String]) -> String {
    let keys = column_list(key_columns);
    format!(
        "SELECT COUNT(*) FROM (SELECT {} FROM {} GROUP BY {} HAVING COUNT(*) > 1) d",
        keys,
        qualify_table(table),
        keys
    )
}

/// Unique constraints and unique indexes with their column names.
pub const UNIQUE_INDEXES_QUERY: &str = "\
SELECT i.indexrelid::regclass::text, array_agg(a.attname::text ORDER BY a.attnum) \
FROM pg_index i \
JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
WHERE i.indrelid = $1::text::regclass AND i.indisunique AND i.indpred IS NULL \
GROUP BY i.indexrelid";

pub fn create_unique_index(table: &str, key_columns: &[String]) -> String {
    let index = format!("ux_{}_{}", bare_table(table), key_columns.join("_")).to_lowercase();
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&index),
        qualify_table(table),
        column_list(key_columns)
    )
}
