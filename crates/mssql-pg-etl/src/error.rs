//! Error types for the ETL library.

use thiserror::Error;

use crate::report::RunSummary;

/// Exit code for configuration errors (invalid YAML, missing fields).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connection and query failures against either store.
pub const EXIT_DATABASE_ERROR: u8 = 2;
/// Exit code for table transfer failures.
pub const EXIT_TRANSFER_ERROR: u8 = 3;
/// Exit code for a table load that was aborted part way.
pub const EXIT_ABORTED: u8 = 4;
/// Exit code for a run cancelled by signal.
pub const EXIT_CANCELLED: u8 = 5;
/// Exit code for attachment job failures.
pub const EXIT_JOB_ERROR: u8 = 6;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {}", pg_error_text(.0))]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A reference cache could not be loaded. Always fatal.
    #[error("Reference cache '{name}' failed to load: {message}")]
    ReferenceCache { name: String, message: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// A record value cannot be encoded for its target column
    #[error("Cannot encode record {record_id}, column {column}: {message}")]
    Encode {
        record_id: String,
        column: String,
        message: String,
    },

    /// A transform reported a fault that is not scoped to one record
    #[error("Transform failed: {0}")]
    Transform(String),

    /// Attachment job error
    #[error("Attachment job error: {0}")]
    Job(String),

    /// Row count validation failed
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A table load stopped before draining. Carries the partial summary.
    #[error("Load of {table} aborted after {processed} records: {source}")]
    Aborted {
        table: String,
        processed: u64,
        summary: Box<RunSummary>,
        #[source]
        source: Box<MigrateError>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a ReferenceCache error
    pub fn cache(name: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::ReferenceCache {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Partial summary of an aborted load, if this error carries one.
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            MigrateError::Aborted { summary, .. } => Some(summary),
            _ => None,
        }
    }

    /// True if the error (or the cause of an abort) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            MigrateError::Cancelled => true,
            MigrateError::Aborted { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Validation(_) => {
                EXIT_CONFIG_ERROR
            }
            MigrateError::Source(_)
            | MigrateError::Target(_)
            | MigrateError::Pool { .. }
            | MigrateError::ReferenceCache { .. } => EXIT_DATABASE_ERROR,
            MigrateError::Transfer { .. } | MigrateError::Encode { .. } | MigrateError::Transform(_) => {
                EXIT_TRANSFER_ERROR
            }
            MigrateError::Aborted { .. } if self.is_cancelled() => EXIT_CANCELLED,
            MigrateError::Aborted { .. } => EXIT_ABORTED,
            MigrateError::Cancelled => EXIT_CANCELLED,
            MigrateError::Job(_) => EXIT_JOB_ERROR,
            MigrateError::Io(_) | MigrateError::Json(_) | MigrateError::Csv(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Server message of a PostgreSQL error with its SQLSTATE, detail and hint.
///
/// The driver's own `Display` only says "db error" for server errors.
fn pg_error_text(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => db_error_text(db.code().code(), db.message(), db.detail(), db.hint()),
        None => match std::error::Error::source(e) {
            Some(cause) => format!("{}: {}", e, cause),
            None => e.to_string(),
        },
    }
}

fn db_error_text(code: &str, message: &str, detail: Option<&str>, hint: Option<&str>) -> String {
    let mut text = format!("{} (SQLSTATE {})", message, code);
    if let Some(detail) = detail {
        text.push_str(&format!(", detail: {}", detail));
    }
    if let Some(hint) = hint {
        text.push_str(&format!(", hint: {}", hint));
    }
    text
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
