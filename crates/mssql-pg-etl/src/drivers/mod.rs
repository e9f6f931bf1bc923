//! Store drivers.
//!
//! - [`mssql`]: SQL Server [`RowSource`](crate::core::RowSource)
//! - [`postgres`]: PostgreSQL [`TargetStore`](crate::core::TargetStore)

pub mod mssql;
pub mod postgres;

pub use mssql::MssqlSource;
pub use postgres::{PgStore, SslMode};
