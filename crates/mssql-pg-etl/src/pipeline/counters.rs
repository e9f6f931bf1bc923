//! Shared counters and the failure slot of one table load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::MigrateError;
use crate::report::Progress;

/// Record counters updated by the reader, the workers and the writers.
///
/// `processed == inserted + skipped + in_flight` holds after every update of
/// a single stage; `in_flight` returns to zero once the pipeline drains.
#[derive(Debug, Default)]
pub struct Counters {
    pub read: AtomicU64,
    pub processed: AtomicU64,
    pub inserted: AtomicU64,
    pub updated: AtomicU64,
    pub skipped: AtomicU64,
    pub in_flight: AtomicU64,
    pub batches: AtomicU64,
}

impl Counters {
    /// A worker took a record off the raw queue. Returns the new total.
    pub fn record_taken(&self) -> u64 {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
        self.in_flight.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn records_loaded(&self, inserted: u64, updated: u64) {
        self.inserted.fetch_add(inserted, Ordering::Relaxed);
        self.updated.fetch_add(updated, Ordering::Relaxed);
        self.in_flight.fetch_sub(inserted, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn progress(&self, table: &str, expected: Option<u64>, started: Instant) -> Progress {
        let mut progress = Progress::new(
            table,
            self.processed.load(Ordering::Relaxed),
            self.inserted.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            expected,
            started.elapsed(),
        );
        progress.read = self.read.load(Ordering::Relaxed);
        progress
    }
}

/// Holds the first fatal error of a load and cancels the load when set.
#[derive(Debug)]
pub struct FailureSlot {
    error: Mutex<Option<MigrateError>>,
    cancel: CancellationToken,
}

impl FailureSlot {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            error: Mutex::new(None),
            cancel,
        }
    }

    /// Record `error` unless an earlier one is already held, then cancel.
    pub fn fail(&self, error: MigrateError) {
        if let Ok(mut slot) = self.error.lock() {
            if slot.is_none() {
                *slot = Some(error);
            } else {
                debug!("Ignoring later failure: {}", error);
            }
        }
        self.cancel.cancel();
    }

    pub fn take(&self) -> Option<MigrateError> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_balance() {
        let c = Counters::default();
        for _ in 0..5 {
            c.record_taken();
        }
        c.record_skipped(1);
        c.records_loaded(3, 1);
        assert_eq!(c.processed(), 5);
        assert_eq!(c.in_flight.load(Ordering::Relaxed), 1);
        assert_eq!(
            c.processed(),
            c.inserted.load(Ordering::Relaxed)
                + c.skipped.load(Ordering::Relaxed)
                + c.in_flight.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn test_first_failure_wins_and_cancels() {
        let token = CancellationToken::new();
        let slot = FailureSlot::new(token.clone());
        slot.fail(MigrateError::Transform("first".into()));
        slot.fail(MigrateError::Transform("second".into()));
        assert!(token.is_cancelled());
        assert_eq!(slot.take().unwrap().to_string(), "Transform failed: first");
        assert!(slot.take().is_none());
    }
}
