//! Transform workers.
//!
//! Each worker pulls raw records from the shared raw queue, applies the
//! transform, and fills a local batch. Full batches are sent to the batch
//! queue; the send is where backpressure from slow writers reaches the
//! workers. A worker's open batch is never split: it is sent whole when the
//! raw queue closes, or turned into `Cancelled` skips when the load is
//! cancelled. A transform that panics costs only the record it was given,
//! which is skipped as a `TransformFault`.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::counters::{Counters, FailureSlot};
use crate::cache::ReferenceCache;
use crate::core::{Batch, RawRecord, SkipKind, SkipRecord, TargetRecord};
use crate::error::MigrateError;
use crate::report::ProgressReporter;
use crate::transform::{Transform, TransformError};

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub struct WorkerContext {
    pub table: String,
    pub transform: Arc<dyn Transform>,
    pub caches: Arc<ReferenceCache>,
    pub raw_rx: async_channel::Receiver<RawRecord>,
    pub batch_tx: async_channel::Sender<Batch>,
    pub batch_size: usize,
    pub counters: Arc<Counters>,
    pub failure: Arc<FailureSlot>,
    pub cancel: CancellationToken,
    pub reporter: Arc<dyn ProgressReporter>,
    pub progress_interval: u64,
    pub expected: Option<u64>,
    pub started: Instant,
}

/// What one worker hands back when it exits.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub batches_sent: u64,
    pub skipped: Vec<SkipRecord>,
}

/// Spawn `worker_count` workers over the same queues.
pub fn spawn_workers(ctx: &WorkerContext, worker_count: usize) -> Vec<JoinHandle<WorkerReport>> {
    (0..worker_count.max(1))
        .map(|worker_id| {
            let ctx = ctx.clone();
            tokio::spawn(async move { run_worker(ctx, worker_id).await })
        })
        .collect()
}

async fn run_worker(ctx: WorkerContext, worker_id: usize) -> WorkerReport {
    let mut report = WorkerReport {
        worker_id,
        ..Default::default()
    };
    let mut batch: Vec<TargetRecord> = Vec::with_capacity(ctx.batch_size);

    loop {
        let raw = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            next = ctx.raw_rx.recv() => match next {
                Ok(raw) => raw,
                Err(_) => break,
            },
        };

        let processed = ctx.counters.record_taken();
        let record_id = catch_unwind(AssertUnwindSafe(|| ctx.transform.record_id(&raw)))
            .unwrap_or_else(|_| format!("#{}", processed));

        if ctx.cancel.is_cancelled() {
            skip(&ctx, &mut report, record_id, SkipKind::Cancelled, "load cancelled");
            break;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| ctx.transform.apply(&raw, &ctx.caches)))
            .unwrap_or_else(|panic| {
                Err(TransformError::Record(format!(
                    "transform panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        match outcome {
            Ok(record) => {
                batch.push(record);
                if batch.len() >= ctx.batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(ctx.batch_size));
                    send_batch(&ctx, &mut report, full).await;
                }
            }
            Err(TransformError::Skip { kind, reason }) => {
                skip(&ctx, &mut report, record_id, kind, reason);
            }
            Err(TransformError::Record(message)) => {
                skip(&ctx, &mut report, record_id, SkipKind::TransformFault, message);
            }
            Err(TransformError::Systemic(message)) => {
                skip(
                    &ctx,
                    &mut report,
                    record_id,
                    SkipKind::TransformFault,
                    message.clone(),
                );
                ctx.failure.fail(MigrateError::Transform(message));
                break;
            }
        }

        if ctx.progress_interval > 0 && processed % ctx.progress_interval == 0 {
            ctx.reporter
                .report_progress(&ctx.counters.progress(&ctx.table, ctx.expected, ctx.started));
        }
    }

    if !batch.is_empty() {
        if ctx.cancel.is_cancelled() {
            cancel_records(&ctx, &mut report, batch);
        } else {
            send_batch(&ctx, &mut report, batch).await;
        }
    }

    debug!(
        "{}: worker {} done ({} batches, {} skipped)",
        ctx.table,
        worker_id,
        report.batches_sent,
        report.skipped.len()
    );
    report
}

async fn send_batch(ctx: &WorkerContext, report: &mut WorkerReport, records: Vec<TargetRecord>) {
    let batch = Batch::new(records, report.worker_id, report.batches_sent);
    match ctx.batch_tx.send(batch).await {
        Ok(()) => report.batches_sent += 1,
        // Every writer is gone; nothing will load these records.
        Err(async_channel::SendError(batch)) => cancel_records(ctx, report, batch.records),
    }
}

fn cancel_records(ctx: &WorkerContext, report: &mut WorkerReport, records: Vec<TargetRecord>) {
    ctx.counters.record_skipped(records.len() as u64);
    report.skipped.extend(
        records
            .into_iter()
            .map(|r| SkipRecord::new(r.record_id, SkipKind::Cancelled, "load cancelled")),
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

fn skip(
    ctx: &WorkerContext,
    report: &mut WorkerReport,
    record_id: String,
    kind: SkipKind,
    reason: impl Into<String>,
) {
    let reason = reason.into();
    debug!("{}: skipping record {} ({}): {}", ctx.table, record_id, kind, reason);
    ctx.counters.record_skipped(1);
    report.skipped.push(SkipRecord::new(record_id, kind, reason));
}
