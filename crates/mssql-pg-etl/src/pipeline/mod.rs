//! Bounded-queue pipeline executor.
//!
//! One table load runs as three stages connected by bounded queues:
//!
//! ```text
//! reader --raw queue--> N transform workers --batch queue--> M bulk writers --> target
//! ```
//!
//! The reader streams the source cursor into the raw queue. Workers apply
//! the [`Transform`] and assemble batches. Writers load each batch with the
//! table's [`LoadStrategy`]. Every record taken by a worker ends up either
//! loaded or as a [`SkipRecord`], including on cancellation.
//!
//! Fatal errors (reader, systemic transform, writer session, strategy, cache)
//! are captured once in a shared slot that also cancels the load. The
//! executor still waits for every stage to unwind before returning
//! [`MigrateError::Aborted`] with the partial summary.
//!
//! [`Pipeline::run_in_transaction`] loads several tables through one target
//! session and commits them together, or rolls all of them back.

mod counters;
mod worker;

pub use counters::{Counters, FailureSlot};
pub use worker::{spawn_workers, WorkerContext, WorkerReport};

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheSpec, ReferenceCache};
use crate::config::{Config, LoadMode, TableConfig};
use crate::core::{
    Batch, DeferredRef, RawRecord, RowSource, SkipKind, SkipRecord, TargetSession, TargetStore,
};
use crate::error::{MigrateError, Result};
use crate::load::{
    select_strategy, sql, BatchState, BulkWriter, LoadStrategy, StrategyRequest, TwoPassStage,
};
use crate::report::{NullReporter, ProgressReporter, RunSummary};
use crate::transform::Transform;

/// Buffer between the driver cursor and the reader task.
const CURSOR_BUFFER: usize = 1024;

/// Concurrency and batching knobs of one load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub workers: usize,
    pub writers: usize,
    pub batch_size: usize,
    pub raw_queue_capacity: Option<usize>,
    pub batch_queue_capacity: Option<usize>,
    /// Report progress every this many processed records; 0 disables.
    pub progress_interval: u64,
    pub single_transaction: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            writers: 1,
            batch_size: 1000,
            raw_queue_capacity: None,
            batch_queue_capacity: None,
            progress_interval: 100,
            single_transaction: false,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.migration;
        Self {
            workers: m.get_workers(),
            writers: m.get_writers(),
            batch_size: m.batch_size,
            raw_queue_capacity: m.raw_queue_capacity,
            batch_queue_capacity: m.batch_queue_capacity,
            progress_interval: m.progress_interval,
            single_transaction: m.single_transaction,
        }
    }

    /// `max(1000, workers * 2000)` unless overridden.
    pub fn raw_capacity(&self) -> usize {
        self.raw_queue_capacity
            .unwrap_or_else(|| (self.workers * 2000).max(1000))
    }

    /// `max(4, writers * 4)` unless overridden.
    pub fn batch_capacity(&self) -> usize {
        self.batch_queue_capacity
            .unwrap_or_else(|| (self.writers * 4).max(4))
    }
}

/// Everything needed to load one table.
#[derive(Debug, Clone)]
pub struct TablePlan {
    /// Label used in logs and summaries.
    pub name: String,
    pub source_query: String,
    pub target_table: String,
    pub mode: LoadMode,
    pub key_columns: Vec<String>,
    pub sanitize_text: bool,
    pub truncate_first: bool,
    /// Fixed strategy that bypasses selection.
    pub strategy: Option<LoadStrategy>,
    pub caches: Vec<CacheSpec>,
    pub two_pass: Option<TwoPassStage>,
    pub after_load: Vec<String>,
    pub options: PipelineOptions,
}

impl TablePlan {
    /// Copy-mode plan with default options.
    pub fn new(
        name: impl Into<String>,
        source_query: impl Into<String>,
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_query: source_query.into(),
            target_table: target_table.into(),
            mode: LoadMode::Copy,
            key_columns: Vec::new(),
            sanitize_text: false,
            truncate_first: false,
            strategy: None,
            caches: Vec::new(),
            two_pass: None,
            after_load: Vec::new(),
            options: PipelineOptions::default(),
        }
    }

    /// Plan for a configured table, loading only the caches it uses.
    pub fn from_config(table: &TableConfig, config: &Config) -> Self {
        let used: HashSet<&str> = table
            .columns
            .iter()
            .flat_map(|c| {
                c.reference
                    .as_deref()
                    .into_iter()
                    .chain(c.lookup.as_ref().map(|l| l.cache.as_str()))
            })
            .collect();
        let caches = config
            .references
            .iter()
            .filter(|r| used.contains(r.name.as_str()))
            .map(CacheSpec::from)
            .collect();

        let mut options = PipelineOptions::from_config(config);
        if let Some(batch_size) = table.batch_size {
            options.batch_size = batch_size;
        }

        Self {
            name: table.name.clone(),
            source_query: table.source_query.clone(),
            target_table: qualify(&config.target.schema, table.target_table()),
            mode: table.load,
            key_columns: table.key_columns.clone(),
            sanitize_text: table.sanitize_text,
            truncate_first: table.truncate_first,
            strategy: None,
            caches,
            two_pass: TwoPassStage::for_table(table, config.migration.update_chunk_size).map(
                |mut stage| {
                    stage.table = qualify(&config.target.schema, &stage.table);
                    stage
                },
            ),
            after_load: table.after_load.clone(),
            options,
        }
    }
}

/// Prefix an unqualified table with the target schema.
pub fn qualify(schema: &str, table: &str) -> String {
    if table.contains('.') || schema.is_empty() {
        table.to_string()
    } else {
        format!("{}.{}", schema, table)
    }
}

/// Caches and strategy resolved before any row moves.
pub struct PreparedLoad {
    pub caches: Arc<ReferenceCache>,
    pub strategy: LoadStrategy,
    pub writers: usize,
}

/// One target session holding the transaction of a multi-table load.
pub type SharedSession = Arc<Mutex<Box<dyn TargetSession>>>;

/// Outcome of [`Pipeline::run_in_transaction`].
#[derive(Debug)]
pub struct TransactionRun {
    /// Summaries of the tables that ran, in run order. After a rollback
    /// every loaded record is counted as a `BatchFailed` skip.
    pub summaries: Vec<RunSummary>,
    /// Why the transaction rolled back.
    pub error: Option<MigrateError>,
}

impl TransactionRun {
    pub fn committed(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<RunSummary>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.summaries),
        }
    }
}

/// Result of one table load, with the ids of the records written through
/// a shared session.
struct TableRun {
    result: Result<RunSummary>,
    loaded: Vec<String>,
}

impl TableRun {
    fn failed(error: MigrateError) -> Self {
        Self {
            result: Err(error),
            loaded: Vec::new(),
        }
    }
}

/// Runs table loads between one source and one target.
#[derive(Clone)]
pub struct Pipeline {
    source: Arc<dyn RowSource>,
    target: Arc<dyn TargetStore>,
    reporter: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(source: Arc<dyn RowSource>, target: Arc<dyn TargetStore>) -> Self {
        Self {
            source,
            target,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn source(&self) -> &Arc<dyn RowSource> {
        &self.source
    }

    pub fn target(&self) -> &Arc<dyn TargetStore> {
        &self.target
    }

    /// Load the caches and pick the strategy and writer count.
    ///
    /// `columns` are the loaded target columns in record value order.
    pub async fn prepare(
        &self,
        plan: &TablePlan,
        columns: &[String],
        dry_run: bool,
    ) -> Result<PreparedLoad> {
        self.prepare_in(plan, columns, dry_run, None).await
    }

    async fn prepare_in(
        &self,
        plan: &TablePlan,
        columns: &[String],
        dry_run: bool,
        shared: Option<&SharedSession>,
    ) -> Result<PreparedLoad> {
        let caches = match shared {
            Some(session) => {
                let mut session = session.lock().await;
                ReferenceCache::load_in_session(&mut **session, &plan.caches).await?
            }
            None => ReferenceCache::load(self.target.as_ref(), &plan.caches).await?,
        };

        let strategy = match &plan.strategy {
            Some(strategy) => strategy.clone(),
            None => {
                select_strategy(
                    self.target.as_ref(),
                    &StrategyRequest {
                        table: &plan.target_table,
                        mode: plan.mode,
                        columns,
                        key_columns: &plan.key_columns,
                        sanitize_text: plan.sanitize_text,
                        dry_run,
                    },
                )
                .await?
            }
        };

        let writers = if shared.is_some()
            || plan.options.single_transaction
            || strategy.requires_single_writer()
        {
            1
        } else {
            plan.options.writers.max(1)
        };

        Ok(PreparedLoad {
            caches: Arc::new(caches),
            strategy,
            writers,
        })
    }

    /// Load one table.
    ///
    /// Returns the summary of a drained load, or [`MigrateError::Aborted`]
    /// carrying the partial summary when a fatal error or `cancel` stopped
    /// it early.
    pub async fn run(
        &self,
        plan: &TablePlan,
        transform: Arc<dyn Transform>,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        self.load_table(plan, transform, cancel, None).await.result
    }

    /// Load `loads` in order inside one transaction.
    ///
    /// Every table runs with a single writer on the shared session. The
    /// transaction commits once the last table finishes; the first table
    /// that aborts rolls back the rows of every table before it.
    pub async fn run_in_transaction(
        &self,
        loads: Vec<(TablePlan, Arc<dyn Transform>)>,
        cancel: CancellationToken,
    ) -> TransactionRun {
        let mut session = match self.target.session().await {
            Ok(session) => session,
            Err(e) => {
                return TransactionRun {
                    summaries: Vec::new(),
                    error: Some(e),
                }
            }
        };
        if let Err(e) = session.begin().await {
            return TransactionRun {
                summaries: Vec::new(),
                error: Some(e),
            };
        }
        let shared: SharedSession = Arc::new(Mutex::new(session));
        info!("Loading {} tables in one transaction", loads.len());

        let mut done: Vec<(RunSummary, Vec<String>)> = Vec::with_capacity(loads.len());
        let mut failed_loaded = Vec::new();
        let mut error = None;
        for (plan, transform) in loads {
            if cancel.is_cancelled() {
                error = Some(MigrateError::Cancelled);
                break;
            }
            let run = self
                .load_table(&plan, transform, cancel.clone(), Some(&shared))
                .await;
            match run.result {
                Ok(summary) => done.push((summary, run.loaded)),
                Err(e) => {
                    error = Some(e);
                    failed_loaded = run.loaded;
                    break;
                }
            }
        }

        let outcome = {
            let mut session = shared.lock().await;
            match error {
                None => session.commit().await,
                Some(e) => {
                    if let Err(rollback) = session.rollback().await {
                        warn!("shared transaction rollback failed: {}", rollback);
                    }
                    Err(e)
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!("Committed {} tables in one transaction", done.len());
                TransactionRun {
                    summaries: done.into_iter().map(|(summary, _)| summary).collect(),
                    error: None,
                }
            }
            Err(mut e) => {
                let reason = format!("rolled back with the shared transaction: {}", e);
                let mut summaries = Vec::with_capacity(done.len() + 1);
                for (mut summary, loaded) in done {
                    summary.roll_back(&loaded, &reason);
                    summaries.push(summary);
                }
                if let MigrateError::Aborted { summary, .. } = &mut e {
                    summary.roll_back(&failed_loaded, &reason);
                    summaries.push((**summary).clone());
                }
                error!("Shared transaction rolled back: {}", e);
                TransactionRun {
                    summaries,
                    error: Some(e),
                }
            }
        }
    }

    #[instrument(skip_all, fields(table = %plan.name))]
    async fn load_table(
        &self,
        plan: &TablePlan,
        transform: Arc<dyn Transform>,
        cancel: CancellationToken,
        shared: Option<&SharedSession>,
    ) -> TableRun {
        let started = Instant::now();
        let table = plan.name.clone();
        info!("{}: starting load into {}", table, plan.target_table);

        let columns = transform.target_columns().to_vec();
        let prepared = match self.prepare_in(plan, &columns, false, shared).await {
            Ok(prepared) => prepared,
            Err(e) => return TableRun::failed(self.abort(&table, 0, RunSummary::new(&table), e)),
        };
        let strategy = prepared.strategy.clone();
        info!(
            "{}: strategy {}, {} workers, {} writers, batch size {}",
            table,
            strategy,
            plan.options.workers,
            prepared.writers,
            plan.options.batch_size
        );

        if plan.truncate_first {
            let truncated = match shared {
                Some(session) => session
                    .lock()
                    .await
                    .execute(&sql::truncate_statement(&plan.target_table))
                    .await
                    .map(|_| ()),
                None => self.target.truncate(&plan.target_table).await,
            };
            if let Err(e) = truncated {
                return TableRun::failed(self.abort(&table, 0, RunSummary::new(&table), e));
            }
            info!("{}: truncated {}", table, plan.target_table);
        }

        let expected = match self.source.count(&plan.source_query).await {
            Ok(n) => u64::try_from(n).ok(),
            Err(e) => {
                debug!("{}: row count unavailable: {}", table, e);
                None
            }
        };

        let token = cancel.child_token();
        let counters = Arc::new(Counters::default());
        let failure = Arc::new(FailureSlot::new(token.clone()));

        let (raw_tx, raw_rx) = async_channel::bounded::<RawRecord>(plan.options.raw_capacity());
        let (batch_tx, batch_rx) = async_channel::bounded::<Batch>(plan.options.batch_capacity());

        let reader = self.spawn_reader(plan, raw_tx, &counters, &failure, &token);

        let worker_ctx = WorkerContext {
            table: table.clone(),
            transform: transform.clone(),
            caches: prepared.caches.clone(),
            raw_rx,
            batch_tx,
            batch_size: plan.options.batch_size.max(1),
            counters: counters.clone(),
            failure: failure.clone(),
            cancel: token.clone(),
            reporter: self.reporter.clone(),
            progress_interval: plan.options.progress_interval,
            expected,
            started,
        };
        let workers = spawn_workers(&worker_ctx, plan.options.workers);

        let writer_ctx = WriterContext {
            target: self.target.clone(),
            table: plan.target_table.clone(),
            columns,
            strategy: strategy.clone(),
            batch_rx,
            counters: counters.clone(),
            failure: failure.clone(),
            cancel: token.clone(),
            single_transaction: plan.options.single_transaction,
            shared: shared.cloned(),
        };
        let writers: Vec<JoinHandle<WriterReport>> = (0..prepared.writers)
            .map(|writer_id| {
                let ctx = writer_ctx.clone();
                tokio::spawn(async move { run_writer(ctx, writer_id).await })
            })
            .collect();
        drop(writer_ctx);

        // Workers hold their own queue handles; these copies would keep the
        // queues open.
        drop(worker_ctx);

        if let Err(e) = reader.await {
            failure.fail(MigrateError::transfer(&table, format!("Reader task failed: {}", e)));
        }

        let mut skipped: Vec<SkipRecord> = Vec::new();
        for result in join_all(workers).await {
            match result {
                Ok(report) => skipped.extend(report.skipped),
                Err(e) => failure.fail(MigrateError::transfer(
                    &table,
                    format!("Worker task panicked: {}", e),
                )),
            }
        }

        let mut deferred: Vec<DeferredRef> = Vec::new();
        let mut loaded: Vec<String> = Vec::new();
        for result in join_all(writers).await {
            match result {
                Ok(report) => {
                    skipped.extend(report.skipped);
                    deferred.extend(report.deferred);
                    loaded.extend(report.loaded);
                }
                Err(e) => failure.fail(MigrateError::transfer(
                    &table,
                    format!("Writer task panicked: {}", e),
                )),
            }
        }

        let mut summary = RunSummary::new(&table).with_skips(skipped);
        summary.strategy = strategy.name().to_string();
        summary.total = counters.processed();
        summary.inserted = counters.inserted.load(Ordering::Relaxed);
        summary.updated = counters.updated.load(Ordering::Relaxed);
        summary.skipped = counters.skipped.load(Ordering::Relaxed);

        let in_flight = counters.in_flight.load(Ordering::Relaxed);
        if in_flight != 0 || !summary.is_conserved() {
            error!(
                "{}: record accounting mismatch: {} processed, {} inserted, {} skipped, {} in flight",
                table, summary.total, summary.inserted, summary.skipped, in_flight
            );
        }

        let fatal = failure.take();
        if fatal.is_some() || token.is_cancelled() {
            summary.finish(started.elapsed());
            let source = fatal.unwrap_or(MigrateError::Cancelled);
            let processed = summary.total;
            return TableRun {
                result: Err(self.abort(&table, processed, summary, source)),
                loaded,
            };
        }

        if let Some(stage) = &plan.two_pass {
            let second_pass = match shared {
                Some(session) => stage.apply(&mut **session.lock().await, deferred).await,
                None => stage.run(self.target.as_ref(), deferred).await,
            };
            match second_pass {
                Ok(outcome) => summary.unresolved_references = outcome.unresolved,
                Err(e) => {
                    summary.finish(started.elapsed());
                    let processed = summary.total;
                    return TableRun {
                        result: Err(self.abort(&table, processed, summary, e)),
                        loaded,
                    };
                }
            }
        }

        for statement in &plan.after_load {
            let executed = match shared {
                Some(session) => session.lock().await.execute(statement).await,
                None => self.target.execute(statement).await,
            };
            match executed {
                Ok(n) => info!("{}: post-load statement affected {} rows", table, n),
                Err(e) => {
                    summary.finish(started.elapsed());
                    let processed = summary.total;
                    return TableRun {
                        result: Err(self.abort(&table, processed, summary, e)),
                        loaded,
                    };
                }
            }
        }

        summary.finish(started.elapsed());
        if summary.skipped > 0 {
            let kinds: Vec<String> = summary
                .skip_counts
                .iter()
                .map(|(kind, n)| format!("{} {}", n, kind))
                .collect();
            warn!("{}: skipped {} records ({})", table, summary.skipped, kinds.join(", "));
        }
        self.reporter.report_completed(&summary);
        info!("{}", summary.summary());
        TableRun {
            result: Ok(summary),
            loaded,
        }
    }

    fn spawn_reader(
        &self,
        plan: &TablePlan,
        raw_tx: async_channel::Sender<RawRecord>,
        counters: &Arc<Counters>,
        failure: &Arc<FailureSlot>,
        token: &CancellationToken,
    ) -> JoinHandle<()> {
        let mut stream = self.source.open_cursor(&plan.source_query, CURSOR_BUFFER);
        let counters = counters.clone();
        let failure = failure.clone();
        let token = token.clone();
        let table = plan.name.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = stream.recv() => next,
                };
                match next {
                    Some(Ok(record)) => {
                        counters.read.fetch_add(1, Ordering::Relaxed);
                        let sent = tokio::select! {
                            biased;
                            _ = token.cancelled() => false,
                            sent = raw_tx.send(record) => sent.is_ok(),
                        };
                        if !sent {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("{}: source read failed: {}", table, e);
                        failure.fail(e);
                        break;
                    }
                    None => break,
                }
            }
            debug!(
                "{}: reader done ({} records read)",
                table,
                counters.read.load(Ordering::Relaxed)
            );
        })
    }

    fn abort(
        &self,
        table: &str,
        processed: u64,
        summary: RunSummary,
        source: MigrateError,
    ) -> MigrateError {
        if source.is_cancelled() {
            warn!("{}: cancelled after {} records", table, processed);
        } else {
            error!("{}: aborted after {} records: {}", table, processed, source);
        }
        self.reporter
            .report_error(table, &source.to_string(), processed);
        MigrateError::Aborted {
            table: table.to_string(),
            processed,
            summary: Box::new(summary),
            source: Box::new(source),
        }
    }
}

#[derive(Clone)]
struct WriterContext {
    target: Arc<dyn TargetStore>,
    table: String,
    columns: Vec<String>,
    strategy: LoadStrategy,
    batch_rx: async_channel::Receiver<Batch>,
    counters: Arc<Counters>,
    failure: Arc<FailureSlot>,
    cancel: CancellationToken,
    single_transaction: bool,
    shared: Option<SharedSession>,
}

#[derive(Debug, Default)]
struct WriterReport {
    skipped: Vec<SkipRecord>,
    deferred: Vec<DeferredRef>,
    /// Records written through a shared session.
    loaded: Vec<String>,
}

impl WriterReport {
    fn skip_batch(&mut self, counters: &Counters, batch: Batch, kind: SkipKind, reason: &str) {
        counters.record_skipped(batch.len() as u64);
        self.skipped.extend(
            batch
                .records
                .into_iter()
                .map(|r| SkipRecord::new(r.record_id, kind, reason)),
        );
    }
}

/// Drain the batch queue until it closes.
///
/// After cancellation the writer keeps receiving so that blocked workers can
/// finish, turning every undelivered batch into `Cancelled` skips.
async fn run_writer(ctx: WriterContext, writer_id: usize) -> WriterReport {
    if let Some(shared) = ctx.shared.clone() {
        return run_shared_writer(ctx, writer_id, shared).await;
    }
    if ctx.single_transaction {
        return run_single_transaction_writer(ctx, writer_id).await;
    }

    let writer = BulkWriter::new(&ctx.table, ctx.columns.clone(), ctx.strategy.clone(), writer_id);
    let mut report = WriterReport::default();
    let mut session: Option<Box<dyn TargetSession>> = None;

    while let Ok(batch) = ctx.batch_rx.recv().await {
        if ctx.cancel.is_cancelled() {
            report.skip_batch(&ctx.counters, batch, SkipKind::Cancelled, "load cancelled");
            continue;
        }

        if session.is_none() {
            match ctx.target.session().await {
                Ok(s) => session = Some(s),
                Err(e) => {
                    ctx.failure.fail(MigrateError::transfer(
                        &ctx.table,
                        format!("writer {} could not open a session: {}", writer_id, e),
                    ));
                    report.skip_batch(&ctx.counters, batch, SkipKind::Cancelled, "load cancelled");
                    continue;
                }
            }
        }
        let Some(active) = session.as_mut() else {
            report.skip_batch(&ctx.counters, batch, SkipKind::Cancelled, "load cancelled");
            continue;
        };

        let outcome = writer.write(active.as_mut(), &batch).await;
        ctx.counters.batches.fetch_add(1, Ordering::Relaxed);
        match outcome.state {
            BatchState::Committed => {
                // A committed batch lands every record, including merge
                // conflicts that left the existing row untouched.
                ctx.counters
                    .records_loaded(batch.len() as u64, outcome.count.updated);
                report.deferred.extend(outcome.deferred);
            }
            _ => {
                ctx.counters.record_skipped(outcome.skipped.len() as u64);
                report.skipped.extend(outcome.skipped);
                // The connection may be in an unknown state after a failure.
                session = None;
            }
        }
    }

    debug!("{}: writer {} done", ctx.table, writer_id);
    report
}

/// Load every batch into the run's shared transaction. Records count as
/// loaded as soon as their batch is written; any failure is fatal.
async fn run_shared_writer(
    ctx: WriterContext,
    writer_id: usize,
    shared: SharedSession,
) -> WriterReport {
    let writer = BulkWriter::new(&ctx.table, ctx.columns.clone(), ctx.strategy.clone(), writer_id);
    let mut report = WriterReport::default();
    let mut session = shared.lock_owned().await;

    while let Ok(batch) = ctx.batch_rx.recv().await {
        if ctx.cancel.is_cancelled() {
            report.skip_batch(&ctx.counters, batch, SkipKind::Cancelled, "load cancelled");
            continue;
        }
        ctx.counters.batches.fetch_add(1, Ordering::Relaxed);
        match writer.load(&mut **session, &batch.records).await {
            Ok(loaded) => {
                ctx.counters.records_loaded(batch.len() as u64, loaded.updated);
                for record in batch.records {
                    report.loaded.push(record.record_id);
                    report.deferred.extend(record.deferred);
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!("{}: batch {}/{} failed: {}", ctx.table, batch.worker_id, batch.seq, message);
                report.skip_batch(
                    &ctx.counters,
                    batch,
                    SkipKind::BatchFailed,
                    &format!("batch load failed: {}", message),
                );
                ctx.failure.fail(MigrateError::transfer(&ctx.table, message));
            }
        }
    }

    debug!("{}: shared writer {} done", ctx.table, writer_id);
    report
}

/// One writer, one transaction for the whole table. Any failure is fatal and
/// rolls back every batch already loaded.
async fn run_single_transaction_writer(ctx: WriterContext, writer_id: usize) -> WriterReport {
    let writer = BulkWriter::new(&ctx.table, ctx.columns.clone(), ctx.strategy.clone(), writer_id);
    let mut report = WriterReport::default();
    let mut pending: Vec<Batch> = Vec::new();
    let mut updated = 0u64;

    let mut session = match ctx.target.session().await {
        Ok(mut s) => match s.begin().await {
            Ok(()) => Some(s),
            Err(e) => {
                ctx.failure.fail(e);
                None
            }
        },
        Err(e) => {
            ctx.failure.fail(e);
            None
        }
    };

    while let Ok(batch) = ctx.batch_rx.recv().await {
        let Some(active) = session.as_mut().filter(|_| !ctx.cancel.is_cancelled()) else {
            report.skip_batch(&ctx.counters, batch, SkipKind::Cancelled, "load cancelled");
            continue;
        };
        match writer.load(active.as_mut(), &batch.records).await {
            Ok(loaded) => {
                updated += loaded.updated;
                pending.push(batch);
            }
            Err(e) => {
                let message = e.to_string();
                warn!("{}: batch {}/{} failed: {}", ctx.table, batch.worker_id, batch.seq, message);
                report.skip_batch(
                    &ctx.counters,
                    batch,
                    SkipKind::BatchFailed,
                    &format!("batch load failed: {}", message),
                );
                ctx.failure.fail(MigrateError::transfer(&ctx.table, message));
            }
        }
    }

    let Some(mut session) = session else {
        for batch in pending {
            report.skip_batch(&ctx.counters, batch, SkipKind::Cancelled, "load cancelled");
        }
        return report;
    };

    if ctx.cancel.is_cancelled() {
        if let Err(e) = session.rollback().await {
            debug!("{}: rollback failed: {}", ctx.table, e);
        }
        for batch in pending {
            report.skip_batch(
                &ctx.counters,
                batch,
                SkipKind::BatchFailed,
                "rolled back with the table transaction",
            );
        }
        return report;
    }

    match session.commit().await {
        Ok(()) => {
            let records: u64 = pending.iter().map(|b| b.len() as u64).sum();
            ctx.counters.records_loaded(records, updated);
            for batch in pending {
                report
                    .deferred
                    .extend(batch.records.into_iter().filter_map(|r| r.deferred));
            }
            info!("{}: committed {} records in one transaction", ctx.table, records);
        }
        Err(e) => {
            let message = e.to_string();
            for batch in pending {
                report.skip_batch(
                    &ctx.counters,
                    batch,
                    SkipKind::BatchFailed,
                    &format!("commit failed: {}", message),
                );
            }
            ctx.failure.fail(e);
        }
    }
    report
}
