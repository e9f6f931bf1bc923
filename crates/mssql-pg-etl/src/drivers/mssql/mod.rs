//! Microsoft SQL Server source driver.

mod source;

pub use source::{count_query, MssqlSource, TiberiusConnectionManager};
