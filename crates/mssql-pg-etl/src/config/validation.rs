//! Configuration validation.

use std::collections::HashSet;

use super::{Config, LoadMode, OnMissing, ReferenceKind, TableConfig};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(MigrateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(MigrateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(MigrateError::Config("source.user is required".into()));
    }
    if config.source.r#type != "mssql" {
        return Err(MigrateError::Config(format!(
            "source.type must be 'mssql', got '{}'",
            config.source.r#type
        )));
    }

    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if config.target.r#type != "postgres" {
        return Err(MigrateError::Config(format!(
            "target.type must be 'postgres', got '{}'",
            config.target.r#type
        )));
    }

    let migration = &config.migration;
    if let Some(0) = migration.workers {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if let Some(0) = migration.writers {
        return Err(MigrateError::Config(
            "migration.writers must be at least 1".into(),
        ));
    }
    if migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if migration.update_chunk_size == 0 {
        return Err(MigrateError::Config(
            "migration.update_chunk_size must be at least 1".into(),
        ));
    }
    if matches!(migration.raw_queue_capacity, Some(0))
        || matches!(migration.batch_queue_capacity, Some(0))
    {
        return Err(MigrateError::Config(
            "migration queue capacities must be at least 1".into(),
        ));
    }

    let mut caches: HashSet<&str> = HashSet::new();
    for reference in &config.references {
        if reference.name.is_empty() || reference.query.is_empty() {
            return Err(MigrateError::Config(
                "references entries need a name and a query".into(),
            ));
        }
        if !caches.insert(reference.name.as_str()) {
            return Err(MigrateError::Config(format!(
                "duplicate reference cache '{}'",
                reference.name
            )));
        }
        if reference.kind == ReferenceKind::Composite && reference.key_columns == 0 {
            return Err(MigrateError::Config(format!(
                "reference '{}': composite caches need at least one key column",
                reference.name
            )));
        }
    }

    let mut names: HashSet<String> = HashSet::new();
    for table in &config.tables {
        if !names.insert(table.name.to_lowercase()) {
            return Err(MigrateError::Config(format!(
                "duplicate table '{}'",
                table.name
            )));
        }
        validate_table(table, config)?;
    }

    for attachment in &config.attachments {
        if attachment.source_query.is_empty() {
            return Err(MigrateError::Config(format!(
                "attachment '{}': source_query is required",
                attachment.table
            )));
        }
        if attachment.batch_size == 0 {
            return Err(MigrateError::Config(format!(
                "attachment '{}': batch_size must be at least 1",
                attachment.table
            )));
        }
    }

    Ok(())
}

fn validate_table(table: &TableConfig, config: &Config) -> Result<()> {
    let err = |msg: String| MigrateError::Config(format!("table '{}': {}", table.name, msg));

    if table.source_query.trim().is_empty() {
        return Err(err("source_query is required".into()));
    }
    if table.columns.is_empty() {
        return Err(err("at least one column mapping is required".into()));
    }
    if let Some(0) = table.batch_size {
        return Err(err("batch_size must be at least 1".into()));
    }

    let targets = table.target_columns();
    let has_column = |name: &str| targets.iter().any(|t| t.eq_ignore_ascii_case(name));

    if table.load == LoadMode::Merge {
        if table.key_columns.is_empty() {
            return Err(err("merge load requires key_columns".into()));
        }
        if let Some(missing) = table.key_columns.iter().find(|k| !has_column(k)) {
            return Err(err(format!("key column '{}' is not mapped", missing)));
        }
    }

    let cache_kind = |name: &str| {
        config
            .references
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.kind)
    };

    for column in &table.columns {
        if column.source.is_none() && column.default.is_none() && !column.deferred {
            return Err(err(format!(
                "column '{}' needs a source or a default",
                column.target
            )));
        }
        if let Some(cache) = &column.reference {
            if cache_kind(cache) != Some(ReferenceKind::Set) {
                return Err(err(format!(
                    "column '{}' references unknown set cache '{}'",
                    column.target, cache
                )));
            }
        }
        if let Some(lookup) = &column.lookup {
            match cache_kind(&lookup.cache) {
                Some(ReferenceKind::Map) | Some(ReferenceKind::Composite) => {}
                _ => {
                    return Err(err(format!(
                        "column '{}' looks up unknown map cache '{}'",
                        column.target, lookup.cache
                    )))
                }
            }
            if lookup.keys.is_empty() {
                return Err(err(format!("column '{}': lookup keys are empty", column.target)));
            }
            if lookup.on_missing == OnMissing::Default && column.default.is_none() {
                return Err(err(format!(
                    "column '{}': on_missing default requires a default value",
                    column.target
                )));
            }
        }
    }

    let deferred = table.columns.iter().filter(|c| c.deferred).count();
    match (&table.forward_reference, deferred) {
        (None, 0) => {}
        (Some(fwd), 1) => {
            if !has_column(&fwd.key_column) {
                return Err(err(format!(
                    "forward_reference key column '{}' is not mapped",
                    fwd.key_column
                )));
            }
            if fwd.resolve_query.trim().is_empty() {
                return Err(err("forward_reference.resolve_query is required".into()));
            }
        }
        (None, _) => {
            return Err(err("deferred columns require a forward_reference".into()));
        }
        (Some(_), _) => {
            return Err(err(
                "forward_reference requires exactly one deferred column".into(),
            ));
        }
    }

    Ok(())
}
