//! Background attachment jobs.
//!
//! Binary payload tables are migrated outside the main table run: callers
//! enqueue a job per table and follow it through status polls or a push
//! subscription scoped to a correlation id. Jobs run one at a time in FIFO
//! order. Each job streams `(key, payload)` rows from the source and
//! updates the already-migrated target rows with the `StagedUpdate`
//! strategy, in small batches. Finished jobs stay pollable until they fall
//! out of the [`JobRetention`] window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AttachmentConfig, ColumnConfig, LoadMode, TableConfig};
use crate::core::{RowSource, TargetStore};
use crate::error::{MigrateError, Result};
use crate::load::LoadStrategy;
use crate::pipeline::{Pipeline, PipelineOptions, TablePlan};
use crate::report::{Progress, ProgressReporter, RunSummary};
use crate::transform::MappingTransform;

/// Identifier handed out by [`AttachmentJobService::enqueue`].
pub type JobId = Uuid;

/// Status notifications are pushed at most every this many files.
pub const NOTIFY_EVERY_FILES: u64 = 5;

/// Buffered notifications per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1000;

/// How long finished jobs stay in the job map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRetention {
    /// Finished jobs kept, newest first.
    pub max_finished: usize,
    /// Finished jobs older than this are dropped regardless of count.
    pub max_age: Duration,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            max_finished: 100,
            max_age: Duration::hours(1),
        }
    }
}

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

/// Snapshot of a job, as returned by polls and pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub correlation_id: String,
    pub table: String,
    pub state: JobState,
    pub total_files: u64,
    pub processed_files: u64,
    pub skipped_files: u64,
    pub progress_percentage: f64,
    pub current_operation: Option<String>,
    pub error_message: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Lifecycle {
    state: JobState,
    current_operation: Option<String>,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Live state of one job. Counters are updated from pipeline workers.
#[derive(Debug)]
struct JobTracker {
    job_id: JobId,
    correlation_id: String,
    table: String,
    enqueued_at: DateTime<Utc>,
    total_files: AtomicU64,
    processed_files: AtomicU64,
    skipped_files: AtomicU64,
    last_notified: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<JobStatus>,
}

impl JobTracker {
    fn new(table: &str, correlation_id: &str, events: broadcast::Sender<JobStatus>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            correlation_id: correlation_id.to_string(),
            table: table.to_string(),
            enqueued_at: Utc::now(),
            total_files: AtomicU64::new(0),
            processed_files: AtomicU64::new(0),
            skipped_files: AtomicU64::new(0),
            last_notified: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle {
                state: JobState::Queued,
                current_operation: None,
                error_message: None,
                started_at: None,
                completed_at: None,
            }),
            events,
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> JobStatus {
        let lifecycle = self.lifecycle();
        let total = self.total_files.load(Ordering::Relaxed);
        let processed = self.processed_files.load(Ordering::Relaxed);
        let skipped = self.skipped_files.load(Ordering::Relaxed);
        let progress_percentage = if lifecycle.state == JobState::Completed {
            100.0
        } else if total > 0 {
            ((processed + skipped) as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        JobStatus {
            job_id: self.job_id,
            correlation_id: self.correlation_id.clone(),
            table: self.table.clone(),
            state: lifecycle.state,
            total_files: total,
            processed_files: processed,
            skipped_files: skipped,
            progress_percentage,
            current_operation: lifecycle.current_operation.clone(),
            error_message: lifecycle.error_message.clone(),
            enqueued_at: self.enqueued_at,
            started_at: lifecycle.started_at,
            completed_at: lifecycle.completed_at,
        }
    }

    fn notify(&self) {
        // Nobody listening is fine.
        let _ = self.events.send(self.snapshot());
    }

    /// Move to `next` and notify. Backward or repeated transitions are ignored.
    fn transition(&self, next: JobState, error_message: Option<String>) -> bool {
        {
            let mut lifecycle = self.lifecycle();
            if !lifecycle.state.can_transition_to(next) {
                warn!(
                    "job {}: ignoring transition {:?} -> {:?}",
                    self.job_id, lifecycle.state, next
                );
                return false;
            }
            let now = Utc::now();
            lifecycle.state = next;
            match next {
                JobState::Running => lifecycle.started_at = Some(now),
                JobState::Completed | JobState::Failed => {
                    lifecycle.completed_at = Some(now);
                    lifecycle.current_operation = None;
                }
                JobState::Queued => {}
            }
            if error_message.is_some() {
                lifecycle.error_message = error_message;
            }
        }
        self.notify();
        true
    }

    fn set_operation(&self, operation: impl Into<String>) {
        self.lifecycle().current_operation = Some(operation.into());
        self.notify();
    }

    fn set_counts(&self, processed: u64, skipped: u64) {
        self.processed_files.store(processed, Ordering::Relaxed);
        self.skipped_files.store(skipped, Ordering::Relaxed);
    }
}

/// Feeds pipeline progress into a job and throttles its notifications.
struct JobReporter {
    tracker: Arc<JobTracker>,
}

impl ProgressReporter for JobReporter {
    fn report_progress(&self, progress: &Progress) {
        self.tracker.set_counts(progress.inserted, progress.skipped);
        let done = progress.inserted + progress.skipped;
        let last = self.tracker.last_notified.load(Ordering::Relaxed);
        if done >= last + NOTIFY_EVERY_FILES
            && self
                .tracker
                .last_notified
                .compare_exchange(last, done, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.tracker.notify();
        }
    }

    fn report_error(&self, _table: &str, message: &str, at_record: u64) {
        warn!(
            "job {}: load failed after {} files: {}",
            self.tracker.job_id, at_record, message
        );
    }

    fn report_completed(&self, summary: &RunSummary) {
        self.tracker.set_counts(summary.inserted, summary.skipped);
    }
}

struct ServiceInner {
    source: Arc<dyn RowSource>,
    target: Arc<dyn TargetStore>,
    attachments: HashMap<String, AttachmentConfig>,
    options: PipelineOptions,
    jobs: RwLock<HashMap<JobId, Arc<JobTracker>>>,
    retention: JobRetention,
    events: broadcast::Sender<JobStatus>,
    queue: mpsc::UnboundedSender<Arc<JobTracker>>,
}

/// Queue of attachment jobs with a single background runner.
#[derive(Clone)]
pub struct AttachmentJobService {
    inner: Arc<ServiceInner>,
}

impl AttachmentJobService {
    /// Create the service and spawn its runner. The runner stops when
    /// `cancel` fires; queued jobs then fail without running.
    pub fn start(
        source: Arc<dyn RowSource>,
        target: Arc<dyn TargetStore>,
        attachments: &[AttachmentConfig],
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        Self::start_with_retention(
            source,
            target,
            attachments,
            options,
            JobRetention::default(),
            cancel,
        )
    }

    pub fn start_with_retention(
        source: Arc<dyn RowSource>,
        target: Arc<dyn TargetStore>,
        attachments: &[AttachmentConfig],
        options: PipelineOptions,
        retention: JobRetention,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let service = Self {
            inner: Arc::new(ServiceInner {
                source,
                target,
                attachments: attachments
                    .iter()
                    .map(|a| (a.table.to_lowercase(), a.clone()))
                    .collect(),
                options,
                jobs: RwLock::new(HashMap::new()),
                retention,
                events,
                queue,
            }),
        };
        let runner = tokio::spawn(run_jobs(service.inner.clone(), queue_rx, cancel));
        (service, runner)
    }

    /// Queue a job for `table`. Unknown tables are accepted here and fail
    /// when the job runs.
    pub fn enqueue(&self, table: &str, correlation_id: &str) -> Result<JobId> {
        let tracker = Arc::new(JobTracker::new(
            table,
            correlation_id,
            self.inner.events.clone(),
        ));
        let job_id = tracker.job_id;
        {
            let mut jobs = self.inner.jobs.write().unwrap_or_else(|e| e.into_inner());
            let evicted = evict_finished(&mut jobs, &self.inner.retention, Utc::now());
            if evicted > 0 {
                debug!("evicted {} finished attachment jobs", evicted);
            }
            jobs.insert(job_id, tracker.clone());
        }

        info!(
            "attachment job {} queued for {} (correlation {})",
            job_id, table, correlation_id
        );
        tracker.notify();

        if self.inner.queue.send(tracker.clone()).is_err() {
            tracker.transition(JobState::Failed, Some("job runner has stopped".into()));
            return Err(MigrateError::Job(format!(
                "cannot queue {}: job runner has stopped",
                table
            )));
        }
        Ok(job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .map(|t| t.snapshot())
    }

    /// Every job known to the service, oldest first.
    pub fn jobs(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self
            .inner
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|t| t.snapshot())
            .collect();
        jobs.sort_by_key(|j| j.enqueued_at);
        jobs
    }

    /// Push notifications for jobs enqueued with `correlation_id`.
    pub fn subscribe(&self, correlation_id: &str) -> JobSubscription {
        JobSubscription {
            correlation_id: correlation_id.to_string(),
            rx: self.inner.events.subscribe(),
        }
    }
}

/// Status stream of one correlation group.
pub struct JobSubscription {
    correlation_id: String,
    rx: broadcast::Receiver<JobStatus>,
}

impl JobSubscription {
    /// Next status of a job in the group; `None` once the service is gone.
    pub async fn recv(&mut self) -> Option<JobStatus> {
        loop {
            match self.rx.recv().await {
                Ok(status) if status.correlation_id == self.correlation_id => {
                    return Some(status)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "subscriber for {} missed {} job notifications",
                        self.correlation_id, n
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Drop finished jobs beyond the retention count or age. Returns how many
/// were dropped.
fn evict_finished(
    jobs: &mut HashMap<JobId, Arc<JobTracker>>,
    retention: &JobRetention,
    now: DateTime<Utc>,
) -> usize {
    let mut finished: Vec<(DateTime<Utc>, JobId)> = jobs
        .values()
        .filter_map(|tracker| {
            let lifecycle = tracker.lifecycle();
            lifecycle
                .state
                .is_terminal()
                .then(|| (lifecycle.completed_at.unwrap_or(tracker.enqueued_at), tracker.job_id))
        })
        .collect();
    // Oldest first.
    finished.sort_unstable();
    let excess = finished.len().saturating_sub(retention.max_finished);

    let before = jobs.len();
    for (i, (completed_at, job_id)) in finished.iter().enumerate() {
        if i < excess || now - *completed_at > retention.max_age {
            jobs.remove(job_id);
        }
    }
    before - jobs.len()
}

async fn run_jobs(
    inner: Arc<ServiceInner>,
    mut queue: mpsc::UnboundedReceiver<Arc<JobTracker>>,
    cancel: CancellationToken,
) {
    info!("attachment job runner started");
    loop {
        let tracker = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Some(tracker) => tracker,
                None => break,
            },
        };
        run_job(&inner, &tracker, &cancel).await;
    }

    queue.close();
    while let Ok(tracker) = queue.try_recv() {
        tracker.transition(
            JobState::Failed,
            Some("job runner stopped before the job started".into()),
        );
    }
    info!("attachment job runner stopped");
}

async fn run_job(inner: &ServiceInner, tracker: &Arc<JobTracker>, cancel: &CancellationToken) {
    if !tracker.transition(JobState::Running, None) {
        return;
    }
    info!("attachment job {} running for {}", tracker.job_id, tracker.table);

    match migrate_attachments(inner, tracker, cancel.child_token()).await {
        Ok(summary) => {
            tracker.set_counts(summary.inserted, summary.skipped);
            tracker.transition(JobState::Completed, None);
            info!(
                "attachment job {} completed: {} files updated, {} skipped",
                tracker.job_id, summary.inserted, summary.skipped
            );
        }
        Err(e) => {
            if let Some(summary) = e.summary() {
                tracker.set_counts(summary.inserted, summary.skipped);
            }
            error!("attachment job {} failed: {}", tracker.job_id, e);
            tracker.transition(JobState::Failed, Some(e.to_string()));
        }
    }
}

async fn migrate_attachments(
    inner: &ServiceInner,
    tracker: &Arc<JobTracker>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let config = inner
        .attachments
        .get(&tracker.table.to_lowercase())
        .ok_or_else(|| {
            MigrateError::Job(format!(
                "Table {} is not supported for binary migration",
                tracker.table
            ))
        })?;

    tracker.set_operation("counting files");
    let total = inner.source.count(&config.source_query).await?;
    tracker
        .total_files
        .store(total.max(0) as u64, Ordering::Relaxed);
    tracker.notify();
    if total <= 0 {
        info!("attachment job {}: no files to migrate", tracker.job_id);
        return Ok(RunSummary::new(&config.table));
    }

    tracker.set_operation(format!("updating {}", config.target_table()));
    let table = attachment_table(config);
    let transform = Arc::new(MappingTransform::new(&table)?);

    let mut plan = TablePlan::new(&config.table, &config.source_query, config.target_table());
    plan.strategy = Some(LoadStrategy::StagedUpdate {
        key_columns: vec![config.key_column.clone()],
        touch_column: config.touch_column.clone(),
    });
    plan.options = PipelineOptions {
        batch_size: config.batch_size.max(1),
        progress_interval: 1,
        single_transaction: false,
        ..inner.options.clone()
    };

    Pipeline::new(inner.source.clone(), inner.target.clone())
        .with_reporter(Arc::new(JobReporter {
            tracker: tracker.clone(),
        }))
        .run(&plan, transform, cancel)
        .await
}

/// Column mapping of an attachment: the key, then the payload with its limits.
fn attachment_table(config: &AttachmentConfig) -> TableConfig {
    let column = |target: &str, source: &str| ColumnConfig {
        target: target.to_string(),
        source: Some(source.to_string()),
        required: true,
        reference: None,
        lookup: None,
        default: None,
        cast: None,
        mask: None,
        max_bytes: None,
        reject_empty: false,
        deferred: false,
    };
    let mut data = column(&config.data_column, &config.source_data);
    data.max_bytes = Some(config.max_bytes);
    data.reject_empty = true;

    TableConfig {
        name: config.table.clone(),
        source_query: config.source_query.clone(),
        target_table: Some(config.target_table().to_string()),
        id_column: Some(config.source_key.clone()),
        load: LoadMode::Copy,
        key_columns: vec![config.key_column.clone()],
        sanitize_text: false,
        truncate_first: false,
        batch_size: Some(config.batch_size),
        columns: vec![column(&config.key_column, &config.source_key), data],
        forward_reference: None,
        after_load: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{SqlNullType, SqlValue};
    use crate::testing::{MemorySource, MemoryStore};

    const QUERY: &str = "SELECT AttachmentId, AttachmentData FROM dbo.PrAttachment";

    fn attachment() -> AttachmentConfig {
        AttachmentConfig {
            table: "pr_attachment".into(),
            source_query: QUERY.into(),
            target_table: None,
            source_key: "AttachmentId".into(),
            source_data: "AttachmentData".into(),
            key_column: "id".into(),
            data_column: "data".into(),
            touch_column: None,
            max_bytes: 8,
            batch_size: 20,
        }
    }

    fn payload(id: i64) -> SqlValue<'static> {
        match id {
            7 => SqlValue::bytes_owned(Vec::new()),
            9 => SqlValue::bytes_owned(vec![0; 64]),
            _ => SqlValue::bytes_owned(id.to_le_bytes()[..4].to_vec()),
        }
    }

    fn fixtures(n: i64) -> (MemorySource, MemoryStore) {
        let source = MemorySource::new().with_rows(
            QUERY,
            &["AttachmentId", "AttachmentData"],
            (1..=n).map(|i| vec![SqlValue::I64(i), payload(i)]).collect(),
        );
        let store = MemoryStore::new();
        store.create_table("pr_attachment", &["id", "name", "data"]);
        store.insert_rows(
            "pr_attachment",
            (1..=n)
                .map(|i| {
                    vec![
                        SqlValue::I64(i),
                        SqlValue::text_owned(format!("file{}.pdf", i)),
                        SqlValue::Null(SqlNullType::Bytes),
                    ]
                })
                .collect(),
        );
        (source, store)
    }

    fn service(
        source: MemorySource,
        store: &MemoryStore,
    ) -> (AttachmentJobService, JoinHandle<()>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (service, runner) = AttachmentJobService::start(
            Arc::new(source),
            Arc::new(store.clone()),
            &[attachment()],
            PipelineOptions::default(),
            cancel.clone(),
        );
        (service, runner, cancel)
    }

    async fn wait_terminal(sub: &mut JobSubscription) -> Vec<JobStatus> {
        let mut seen = Vec::new();
        while let Ok(Some(status)) = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await
        {
            let done = status.state.is_terminal();
            seen.push(status);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_transitions_only_move_forward() {
        use JobState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(Completed.is_terminal());
    }

    #[tokio::test]
    async fn test_job_updates_payloads_and_skips_invalid_files() {
        let (source, store) = fixtures(30);
        let (service, _runner, cancel) = service(source, &store);
        let mut sub = service.subscribe("run-1");

        let job_id = service.enqueue("PR_ATTACHMENT", "run-1").unwrap();
        let seen = wait_terminal(&mut sub).await;

        let status = service.status(job_id).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.total_files, 30);
        assert_eq!(status.processed_files, 28);
        assert_eq!(status.skipped_files, 2);
        assert_eq!(status.progress_percentage, 100.0);
        assert!(status.started_at.is_some() && status.completed_at.is_some());

        // States arrive in order and never go back.
        let states: Vec<JobState> = seen.iter().map(|s| s.state).collect();
        assert_eq!(states.first(), Some(&JobState::Queued));
        assert_eq!(states.last(), Some(&JobState::Completed));
        assert!(states.windows(2).all(|w| w[0] == w[1] || w[0].can_transition_to(w[1])));
        // Per-file progress is throttled.
        let running = seen.iter().filter(|s| s.state == JobState::Running).count();
        assert!(running < 30);

        let data = store.column("pr_attachment", "data");
        assert!(data[0].payload_len().is_some());
        assert!(data[6].is_null());
        assert!(data[8].is_null());
        assert!(store.batch_sizes().iter().all(|s| *s <= 20));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_table_fails_job() {
        let (source, store) = fixtures(3);
        let (service, _runner, _cancel) = service(source, &store);
        let mut sub = service.subscribe("run-2");

        let job_id = service.enqueue("invoices", "run-2").unwrap();
        wait_terminal(&mut sub).await;

        let status = service.status(job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(
            status.error_message.as_deref(),
            Some("Attachment job error: Table invoices is not supported for binary migration")
        );
    }

    #[tokio::test]
    async fn test_subscription_is_scoped_to_correlation_id() {
        let (source, store) = fixtures(3);
        let (service, _runner, _cancel) = service(source, &store);
        let mut other = service.subscribe("someone-else");
        let mut mine = service.subscribe("mine");

        service.enqueue("pr_attachment", "mine").unwrap();
        let seen = wait_terminal(&mut mine).await;
        assert!(seen.iter().all(|s| s.correlation_id == "mine"));

        let nothing = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let (source, store) = fixtures(5);
        let (service, _runner, _cancel) = service(source, &store);
        let mut sub = service.subscribe("batch");

        let first = service.enqueue("pr_attachment", "batch").unwrap();
        let second = service.enqueue("pr_attachment", "batch").unwrap();

        let mut started = Vec::new();
        let mut finished = 0;
        while finished < 2 {
            let status = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            if status.state == JobState::Running && !started.contains(&status.job_id) {
                started.push(status.job_id);
            }
            if status.state.is_terminal() {
                finished += 1;
            }
        }
        assert_eq!(started, vec![first, second]);
        assert_eq!(service.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_finished_jobs_beyond_retention_are_evicted() {
        let (source, store) = fixtures(3);
        let (service, _runner) = AttachmentJobService::start_with_retention(
            Arc::new(source),
            Arc::new(store.clone()),
            &[attachment()],
            PipelineOptions::default(),
            JobRetention {
                max_finished: 1,
                max_age: chrono::Duration::hours(1),
            },
            CancellationToken::new(),
        );
        let mut sub = service.subscribe("runs");

        let first = service.enqueue("pr_attachment", "runs").unwrap();
        wait_terminal(&mut sub).await;
        let second = service.enqueue("pr_attachment", "runs").unwrap();
        wait_terminal(&mut sub).await;
        assert_eq!(service.jobs().len(), 2);

        let third = service.enqueue("pr_attachment", "runs").unwrap();
        assert!(service.status(first).is_none());
        assert!(service.status(second).is_some());
        assert!(service.status(third).is_some());
        assert_eq!(service.jobs().len(), 2);
    }

    #[test]
    fn test_finished_jobs_older_than_max_age_are_evicted() {
        let (events, _) = broadcast::channel(4);
        let done = Arc::new(JobTracker::new("t", "c", events.clone()));
        done.transition(JobState::Running, None);
        done.transition(JobState::Completed, None);
        let queued = Arc::new(JobTracker::new("t", "c", events));
        let mut jobs: HashMap<JobId, Arc<JobTracker>> = [done.clone(), queued.clone()]
            .into_iter()
            .map(|t| (t.job_id, t))
            .collect();
        let retention = JobRetention {
            max_finished: 10,
            max_age: chrono::Duration::minutes(5),
        };

        assert_eq!(evict_finished(&mut jobs, &retention, Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::minutes(6);
        assert_eq!(evict_finished(&mut jobs, &retention, later), 1);
        assert!(jobs.contains_key(&queued.job_id));
        assert!(!jobs.contains_key(&done.job_id));
    }

    #[tokio::test]
    async fn test_stopped_runner_rejects_jobs() {
        let (source, store) = fixtures(3);
        let (service, runner, cancel) = service(source, &store);
        cancel.cancel();
        runner.await.unwrap();

        let err = service.enqueue("pr_attachment", "late").unwrap_err();
        assert!(matches!(err, MigrateError::Job(_)));
        let jobs = service.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Failed);
    }
}
