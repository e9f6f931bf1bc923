//! PostgreSQL target driver.
//!
//! - [`PgStore`]: pooled target store used for metadata lookups, DDL and queries
//! - [`PgSession`]: a writer's dedicated connection with COPY and merge
//! - [`SslMode`]: TLS setup shared by every pooled connection

mod store;
mod tls;
mod types;

pub use store::{PgSession, PgStore};
pub use tls::SslMode;
