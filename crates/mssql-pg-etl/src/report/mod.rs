//! Run summaries and progress reporting.
//!
//! Reporters are synchronous and must not block: they are called from
//! transform workers and bulk writers on the hot path.

mod export;

pub use export::StatsExport;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::core::{SkipKind, SkipRecord};

/// Outcome of one table load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub table: String,
    /// Load strategy used, e.g. "binary_copy".
    pub strategy: String,
    /// Records taken from the source and handed to a worker.
    pub total: u64,
    /// Records written by committed batches (new and merged rows).
    pub inserted: u64,
    /// Subset of `inserted` that replaced an existing row.
    pub updated: u64,
    pub skipped: u64,
    pub skip_counts: BTreeMap<SkipKind, u64>,
    pub skipped_records: Vec<SkipRecord>,
    /// Deferred references the second pass could not resolve.
    pub unresolved_references: u64,
    pub duration_seconds: f64,
    pub rows_per_second: f64,
}

impl RunSummary {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            strategy: String::new(),
            total: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            skip_counts: BTreeMap::new(),
            skipped_records: Vec::new(),
            unresolved_references: 0,
            duration_seconds: 0.0,
            rows_per_second: 0.0,
        }
    }

    /// Attach itemized skips, recomputing the per-kind counts.
    pub fn with_skips(mut self, skips: Vec<SkipRecord>) -> Self {
        self.skip_counts.clear();
        for skip in &skips {
            *self.skip_counts.entry(skip.kind).or_insert(0) += 1;
        }
        self.skipped_records = skips;
        self
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.duration_seconds = elapsed.as_secs_f64();
        self.rows_per_second = if self.duration_seconds > 0.0 {
            self.inserted as f64 / self.duration_seconds
        } else {
            0.0
        };
    }

    /// Skips grouped by reason text, most frequent first.
    pub fn reason_counts(&self) -> Vec<(String, u64)> {
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for skip in &self.skipped_records {
            *counts.entry(skip.reason.as_str()).or_insert(0) += 1;
        }
        let mut out: Vec<(String, u64)> = counts
            .into_iter()
            .map(|(reason, n)| (reason.to_string(), n))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Turn loaded records into `BatchFailed` skips after the transaction
    /// that wrote them rolled back.
    pub fn roll_back(&mut self, loaded: &[String], reason: &str) {
        let n = loaded.len() as u64;
        self.inserted = self.inserted.saturating_sub(n);
        self.updated = 0;
        self.skipped += n;
        if n > 0 {
            *self.skip_counts.entry(SkipKind::BatchFailed).or_insert(0) += n;
        }
        self.skipped_records.extend(
            loaded
                .iter()
                .map(|id| SkipRecord::new(id.clone(), SkipKind::BatchFailed, reason)),
        );
        self.finish(Duration::from_secs_f64(self.duration_seconds));
    }

    /// Every record is accounted for as loaded or skipped.
    pub fn is_conserved(&self) -> bool {
        self.total == self.inserted + self.skipped
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} processed, {} inserted ({} updated), {} skipped in {:.1}s ({:.0} rows/sec)",
            self.table,
            self.total,
            self.inserted,
            self.updated,
            self.skipped,
            self.duration_seconds,
            self.rows_per_second
        )
    }
}

/// Point-in-time progress of one table load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub table: String,
    /// Records pulled from the source, including those still queued.
    #[serde(default)]
    pub read: u64,
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    /// Source row count, when known.
    pub expected: Option<u64>,
    pub percentage: Option<f64>,
    pub rows_per_second: f64,
    pub eta_seconds: Option<f64>,
    pub elapsed_seconds: f64,
}

impl Progress {
    pub fn new(
        table: &str,
        processed: u64,
        inserted: u64,
        skipped: u64,
        expected: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let elapsed_seconds = elapsed.as_secs_f64();
        let rows_per_second = if elapsed_seconds > 0.0 {
            processed as f64 / elapsed_seconds
        } else {
            0.0
        };
        let percentage = expected
            .filter(|e| *e > 0)
            .map(|e| (processed as f64 / e as f64 * 100.0).min(100.0));
        let eta_seconds = match expected {
            Some(e) if rows_per_second > 0.0 => {
                Some(e.saturating_sub(processed) as f64 / rows_per_second)
            }
            _ => None,
        };
        Self {
            table: table.to_string(),
            read: processed,
            processed,
            inserted,
            skipped,
            expected,
            percentage,
            rows_per_second,
            eta_seconds,
            elapsed_seconds,
        }
    }
}

/// Receives progress, error and completion events.
pub trait ProgressReporter: Send + Sync {
    fn report_progress(&self, progress: &Progress);

    /// A fatal error, with the number of records processed when it occurred.
    fn report_error(&self, table: &str, message: &str, at_record: u64);

    /// Called exactly once per table load that drains.
    fn report_completed(&self, summary: &RunSummary);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report_progress(&self, _progress: &Progress) {}

    fn report_error(&self, _table: &str, _message: &str, _at_record: u64) {}

    fn report_completed(&self, _summary: &RunSummary) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report_progress(&self, p: &Progress) {
        match p.percentage {
            Some(pct) => info!(
                "{}: {}/{} records ({:.1}%), {} skipped, {:.0} rows/sec",
                p.table,
                p.processed,
                p.expected.unwrap_or_default(),
                pct,
                p.skipped,
                p.rows_per_second
            ),
            None => info!(
                "{}: {} records, {} skipped, {:.0} rows/sec",
                p.table, p.processed, p.skipped, p.rows_per_second
            ),
        }
    }

    fn report_error(&self, table: &str, message: &str, at_record: u64) {
        error!("{}: failed after {} records: {}", table, at_record, message);
    }

    fn report_completed(&self, summary: &RunSummary) {
        info!("{}", summary.summary());
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ReportEvent<'a> {
    Progress(&'a Progress),
    Error {
        table: &'a str,
        message: &'a str,
        at_record: u64,
    },
    Completed(&'a RunSummary),
}

/// Writes one JSON object per event, for machine consumers.
pub struct JsonLinesReporter<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesReporter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W: Write + Send> JsonLinesReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: &ReportEvent<'_>) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{}", line);
        }
    }
}

impl<W: Write + Send> ProgressReporter for JsonLinesReporter<W> {
    fn report_progress(&self, progress: &Progress) {
        self.emit(&ReportEvent::Progress(progress));
    }

    fn report_error(&self, table: &str, message: &str, at_record: u64) {
        self.emit(&ReportEvent::Error {
            table,
            message,
            at_record,
        });
    }

    fn report_completed(&self, summary: &RunSummary) {
        self.emit(&ReportEvent::Completed(summary));
    }
}

/// Forwards at most one progress event per interval. Errors and completion
/// always pass through.
pub struct Throttled<R> {
    inner: R,
    interval_ms: u64,
    started: Instant,
    /// Milliseconds since `started` of the last forwarded event, plus one.
    last_emit: AtomicU64,
}

impl<R: ProgressReporter> Throttled<R> {
    pub fn new(inner: R, interval: Duration) -> Self {
        Self {
            inner,
            interval_ms: interval.as_millis() as u64,
            started: Instant::now(),
            last_emit: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: ProgressReporter> ProgressReporter for Throttled<R> {
    fn report_progress(&self, progress: &Progress) {
        let now = self.started.elapsed().as_millis() as u64 + 1;
        let last = self.last_emit.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < self.interval_ms {
            return;
        }
        // Only the caller that wins the exchange forwards the event.
        if self
            .last_emit
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.inner.report_progress(progress);
        }
    }

    fn report_error(&self, table: &str, message: &str, at_record: u64) {
        self.inner.report_error(table, message, at_record);
    }

    fn report_completed(&self, summary: &RunSummary) {
        self.inner.report_completed(summary);
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for std::sync::Arc<R> {
    fn report_progress(&self, progress: &Progress) {
        (**self).report_progress(progress);
    }

    fn report_error(&self, table: &str, message: &str, at_record: u64) {
        (**self).report_error(table, message, at_record);
    }

    fn report_completed(&self, summary: &RunSummary) {
        (**self).report_completed(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingReporter;

    #[test]
    fn test_progress_percentage_and_eta() {
        let p = Progress::new("users", 50, 45, 5, Some(200), Duration::from_secs(10));
        assert_eq!(p.percentage, Some(25.0));
        assert_eq!(p.rows_per_second, 5.0);
        assert_eq!(p.eta_seconds, Some(30.0));

        let unknown = Progress::new("users", 50, 50, 0, None, Duration::from_secs(10));
        assert_eq!(unknown.percentage, None);
        assert_eq!(unknown.eta_seconds, None);
    }

    #[test]
    fn test_summary_skip_aggregation() {
        let summary = RunSummary::new("events").with_skips(vec![
            SkipRecord::new("1", SkipKind::MissingReference, "owner missing"),
            SkipRecord::new("2", SkipKind::MissingReference, "owner missing"),
            SkipRecord::new("3", SkipKind::Oversized, "title too large"),
        ]);
        assert_eq!(summary.skip_counts[&SkipKind::MissingReference], 2);
        assert_eq!(summary.skip_counts[&SkipKind::Oversized], 1);
        assert_eq!(
            summary.reason_counts()[0],
            ("owner missing".to_string(), 2)
        );
    }

    #[test]
    fn test_roll_back_moves_loaded_records_to_skips() {
        let mut summary = RunSummary::new("events")
            .with_skips(vec![SkipRecord::new("9", SkipKind::Oversized, "too large")]);
        summary.total = 3;
        summary.inserted = 2;
        summary.updated = 1;
        summary.skipped = 1;

        summary.roll_back(&["1".to_string(), "2".to_string()], "rolled back");

        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.skip_counts[&SkipKind::BatchFailed], 2);
        assert!(summary.is_conserved());
    }

    #[test]
    fn test_throttle_passes_first_and_terminal_events() {
        let throttled = Throttled::new(RecordingReporter::default(), Duration::from_secs(60));
        let p = Progress::new("t", 1, 1, 0, None, Duration::from_millis(1));
        throttled.report_progress(&p);
        throttled.report_progress(&p);
        throttled.report_progress(&p);
        throttled.report_error("t", "boom", 3);
        throttled.report_completed(&RunSummary::new("t"));

        let inner = throttled.inner();
        assert_eq!(inner.progress_count(), 1);
        assert_eq!(inner.errors().len(), 1);
        assert_eq!(inner.completed().len(), 1);
    }

    #[test]
    fn test_json_lines_output() {
        let reporter = JsonLinesReporter::new(Vec::new());
        reporter.report_progress(&Progress::new("t", 2, 2, 0, Some(4), Duration::from_secs(1)));
        reporter.report_completed(&RunSummary::new("t"));
        let out = String::from_utf8(reporter.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "progress");
        assert_eq!(lines[0]["percentage"], 50.0);
        assert_eq!(lines[1]["event"], "completed");
        assert_eq!(lines[1]["table"], "t");
    }
}
