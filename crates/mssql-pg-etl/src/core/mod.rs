//! Core abstractions shared by the pipeline, the load strategies and the
//! drivers.
//!
//! - [`value`]: SQL value representation and typed extraction
//! - [`column`]: target column wire types
//! - [`record`]: raw and target records, batches and skip records
//! - [`traits`]: source cursor and target store boundaries

pub mod column;
pub mod record;
pub mod traits;
pub mod value;

pub use column::ColumnType;
pub use record::{
    record_id_of, Batch, DeferredRef, FieldError, RawRecord, RecordSchema, SkipKind, SkipRecord,
    TargetRecord,
};
pub use traits::{
    CaseUpdate, CopyFormat, KeyConstraint, MergeOutcome, MergePlan, RowSource, RowStream, StagedUpdatePlan,
    TargetSession, TargetStore,
};
pub use value::{quote_literal, FromSqlValue, SqlNullType, SqlValue};
