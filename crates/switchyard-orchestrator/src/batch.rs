use crate::monitor::{AutomationMetrics, WorkflowMonitor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::persistence::{BATCH_JOBS, BATCH_RESULTS};
use switchyard_core::{
    ensure_id, BatchConfig, Persistence, Priority, SwitchyardError, SwitchyardResult,
};
use switchyard_events::{types, Event, EventBus, EventLevel};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "batch_engine";

/// Kind of work a batch job performs on each item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobType {
    /// Parse source files.
    Parse,
    /// Import templates.
    Import,
    /// Export templates.
    Export,
    /// Analyze items.
    Analyze,
}

impl BatchJobType {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            BatchJobType::Parse => "parse",
            BatchJobType::Import => "import",
            BatchJobType::Export => "export",
            BatchJobType::Analyze => "analyze",
        }
    }

    /// Stage name recorded on per-item errors.
    pub fn stage_name(self) -> &'static str {
        match self {
            BatchJobType::Parse => "parsing",
            BatchJobType::Import => "import",
            BatchJobType::Export => "export",
            BatchJobType::Analyze => "analysis",
        }
    }
}

impl fmt::Display for BatchJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a batch job and its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Waiting for a worker.
    #[default]
    Queued,
    /// Picked up by a worker.
    Running,
    /// No item failed.
    Completed,
    /// Some items failed, but more succeeded.
    Partial,
    /// More items failed than succeeded, or the job never ran.
    Failed,
}

impl BatchStatus {
    /// Final status from per-item counts.
    pub fn classify(successful: usize, failed: usize) -> Self {
        if failed == 0 {
            BatchStatus::Completed
        } else if successful > failed {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        }
    }

    /// Whether the job has a final result.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Partial | BatchStatus::Failed
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Item filter applied before processing.
///
/// Supported fields are `extension` (`equals`, `not_equals`), `size` in
/// bytes (`greater_than`, `less_than`) and `path` (`contains`,
/// `not_contains`). Unknown fields or operators let the item through, as
/// does a `size` filter on a path that cannot be stat'ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFilter {
    /// `extension`, `size`, or `path`.
    pub field: String,
    /// Comparison, e.g. `equals` or `greater_than`.
    pub operator: String,
    /// Right-hand side of the comparison.
    pub value: Value,
}

impl BatchFilter {
    /// Build a filter.
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value: value.into(),
        }
    }

    /// Whether `item` passes this filter.
    pub async fn matches(&self, item: &str) -> bool {
        match self.field.as_str() {
            "extension" => {
                let Some(want) = self.value.as_str() else {
                    return true;
                };
                let want = want.trim_start_matches('.').to_ascii_lowercase();
                let ext = Path::new(item)
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                match self.operator.as_str() {
                    "not_equals" => ext != want,
                    _ => ext == want,
                }
            }
            "size" => {
                let Some(limit) = self.value.as_u64().or_else(|| self.value.as_f64().map(|f| f as u64))
                else {
                    return true;
                };
                let Ok(meta) = tokio::fs::metadata(item).await else {
                    return true;
                };
                match self.operator.as_str() {
                    "greater_than" => meta.len() > limit,
                    "less_than" => meta.len() < limit,
                    _ => true,
                }
            }
            "path" => {
                let Some(needle) = self.value.as_str() else {
                    return true;
                };
                match self.operator.as_str() {
                    "not_contains" => !item.contains(needle),
                    _ => item.contains(needle),
                }
            }
            _ => true,
        }
    }
}

/// A unit of bulk work submitted to the [`BatchEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Assigned as `job_<uuid>` when empty.
    #[serde(default)]
    pub id: String,
    /// What to do with each item.
    pub job_type: BatchJobType,
    /// Defaults to `<type> job`.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Items to process; must not be empty.
    #[serde(default)]
    pub input_paths: Vec<String>,
    /// Destination for export jobs.
    #[serde(default)]
    pub output_path: Option<String>,
    /// Passed to the item processor.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Defaults to medium.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Defaults to the configured batch size.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Items failing any filter are skipped.
    #[serde(default)]
    pub filters: Vec<BatchFilter>,
    /// Block `process_batch` until the result is ready.
    #[serde(default)]
    pub synchronous: bool,
    /// Lifecycle status.
    #[serde(default)]
    pub status: BatchStatus,
    /// Fraction of items handled, 0 to 1.
    #[serde(default)]
    pub progress: f64,
    /// Set when queued.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Set when a worker picks the job up.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the result is recorded.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker that ran the job.
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl BatchJob {
    /// New job over `input_paths`.
    pub fn new<I, S>(job_type: BatchJobType, input_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: String::new(),
            job_type,
            name: String::new(),
            description: String::new(),
            input_paths: input_paths.into_iter().map(Into::into).collect(),
            output_path: None,
            config: HashMap::new(),
            priority: None,
            batch_size: None,
            filters: Vec::new(),
            synchronous: false,
            status: BatchStatus::Queued,
            progress: 0.0,
            created_at: None,
            started_at: None,
            completed_at: None,
            worker_id: None,
        }
    }

    /// Use a fixed id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the queue tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the chunk size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the output path.
    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    /// Add one processor setting.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Add one item filter.
    pub fn with_filter(mut self, filter: BatchFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Make `process_batch` wait for the result.
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    /// Priority after defaulting.
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }
}

/// One failed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    /// Failing item; empty for job-level errors.
    pub item: String,
    /// Error text.
    pub error: String,
    /// Where it failed, e.g. `parsing` or `dispatch`.
    pub stage: String,
}

/// Outcome of a batch job.
///
/// `processed_items == successful_items + failed_items + skipped_items` and
/// never exceeds `total_items`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Job the result belongs to.
    pub job_id: String,
    /// Final or current status.
    pub status: BatchStatus,
    /// Input items.
    pub total_items: usize,
    /// Items handled, skipped ones included.
    pub processed_items: usize,
    /// Items the processor accepted.
    pub successful_items: usize,
    /// Items the processor rejected.
    pub failed_items: usize,
    /// Items filtered out.
    pub skipped_items: usize,
    /// Wall time of the run.
    pub processing_time_ms: u64,
    /// Processed items per second.
    pub throughput: f64,
    /// One entry per failure.
    #[serde(default)]
    pub error_summary: Vec<BatchError>,
    /// Manifest entries returned by the processor.
    #[serde(default)]
    pub output_manifest: Vec<String>,
    /// Per-item details returned by the processor.
    #[serde(default)]
    pub detailed_results: HashMap<String, Value>,
    /// When the result was created.
    pub created_at: DateTime<Utc>,
}

impl BatchResult {
    /// Placeholder for a job that has not finished.
    pub fn pending(job_id: impl Into<String>, total_items: usize) -> Self {
        Self {
            job_id: job_id.into(),
            status: BatchStatus::Queued,
            total_items,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            skipped_items: 0,
            processing_time_ms: 0,
            throughput: 0.0,
            error_summary: Vec::new(),
            output_manifest: Vec::new(),
            detailed_results: HashMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// What an [`ItemProcessor`] produced for one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOutput {
    /// Appended to the result's output manifest.
    pub manifest_entry: Option<String>,
    /// Stored in the result's detailed results under the item path.
    pub detail: Option<Value>,
}

/// Domain work performed on each batch item.
///
/// `config` is the job's config map; `output_path` is added to it when the
/// job has one.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Handle one item of a `job_type` job.
    async fn process(
        &self,
        job_type: BatchJobType,
        item: &str,
        config: &HashMap<String, Value>,
    ) -> SwitchyardResult<ItemOutput>;
}

/// Best-effort upsert of a serializable record.
pub(crate) async fn persist_record<T: Serialize>(
    store: &dyn Persistence,
    collection: &str,
    key: &str,
    value: &T,
) {
    let record = match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            warn!(collection, key, error = %e, "Failed to serialize record");
            return;
        }
    };
    if let Err(e) = store.upsert(collection, key, record).await {
        warn!(collection, key, error = %e, "Failed to persist record");
    }
}

struct Shared {
    config: BatchConfig,
    tiers: [Mutex<VecDeque<BatchJob>>; 4],
    processor: Arc<dyn ItemProcessor>,
    events: Arc<EventBus>,
    persistence: Option<Arc<dyn Persistence>>,
    jobs: RwLock<HashMap<String, BatchJob>>,
    results: RwLock<HashMap<String, BatchResult>>,
    monitors: RwLock<HashMap<String, WorkflowMonitor>>,
    metrics: Mutex<AutomationMetrics>,
}

impl Shared {
    fn push(&self, job: BatchJob) -> Result<(), Box<BatchJob>> {
        let mut tier = self.tiers[job.effective_priority().index()].lock();
        if tier.len() >= self.config.queue_capacity {
            return Err(Box::new(job));
        }
        tier.push_back(job);
        Ok(())
    }

    fn pop(&self) -> Option<BatchJob> {
        self.tiers.iter().find_map(|tier| tier.lock().pop_front())
    }

    async fn dispatch_loop(self: Arc<Self>, pool: mpsc::Sender<BatchJob>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.dispatch_tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_ready(&pool).await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("Batch dispatcher stopped");
    }

    /// Hand queued jobs to the pool until it is saturated.
    async fn dispatch_ready(&self, pool: &mpsc::Sender<BatchJob>) {
        while let Some(job) = self.pop() {
            match pool.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(mut job)) => {
                    let from = job.effective_priority();
                    job.priority = Some(from.demote());
                    debug!(
                        job_id = %job.id,
                        from = %from,
                        to = %from.demote(),
                        "Worker pool saturated, demoting job"
                    );
                    if let Err(job) = self.push(job) {
                        self.reject(*job, "dispatch", "batch queue full after demotion").await;
                    }
                    break;
                }
                Err(TrySendError::Closed(job)) => {
                    if let Err(job) = self.push(job) {
                        self.reject(*job, "dispatch", "worker pool closed").await;
                    }
                    break;
                }
            }
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        pool: Arc<tokio::sync::Mutex<mpsc::Receiver<BatchJob>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = tokio::select! {
                job = async { pool.lock().await.recv().await } => job,
                _ = shutdown.changed() => break,
            };
            let Some(job) = next else {
                break;
            };
            self.run_job(job, worker).await;
        }
        debug!(worker, "Batch worker stopped");
    }

    async fn run_job(&self, mut job: BatchJob, worker: usize) {
        let started_at = Utc::now();
        job.status = BatchStatus::Running;
        job.started_at = Some(started_at);
        job.worker_id = Some(format!("worker_{worker}"));
        self.jobs.write().insert(job.id.clone(), job.clone());
        if let Some(monitor) = self.monitors.write().get_mut(&job.id) {
            monitor.status = BatchStatus::Running;
            monitor.start_time = started_at;
        }
        info!(
            job_id = %job.id,
            worker,
            job_type = %job.job_type,
            items = job.input_paths.len(),
            "Batch job started"
        );

        let started = Instant::now();
        let total = job.input_paths.len();
        let batch_size = job.batch_size.unwrap_or(self.config.default_batch_size).max(1);
        let stage = job.job_type.stage_name();
        let mut config = job.config.clone();
        if let Some(out) = &job.output_path {
            config
                .entry("output_path".to_string())
                .or_insert_with(|| Value::String(out.clone()));
        }

        let mut result = BatchResult::pending(&job.id, total);
        for chunk in job.input_paths.chunks(batch_size) {
            for item in chunk {
                result.processed_items += 1;
                if !passes_filters(&job.filters, item).await {
                    result.skipped_items += 1;
                    continue;
                }
                match self.processor.process(job.job_type, item, &config).await {
                    Ok(output) => {
                        result.successful_items += 1;
                        if let Some(entry) = output.manifest_entry {
                            result.output_manifest.push(entry);
                        }
                        if let Some(detail) = output.detail {
                            result.detailed_results.insert(item.clone(), detail);
                        }
                    }
                    Err(e) => {
                        debug!(job_id = %job.id, item = %item, error = %e, "Batch item failed");
                        result.failed_items += 1;
                        result.error_summary.push(BatchError {
                            item: item.clone(),
                            error: e.to_string(),
                            stage: stage.to_string(),
                        });
                    }
                }
            }
            self.record_progress(&job.id, &result);
        }

        let elapsed = started.elapsed();
        result.processing_time_ms = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64();
        result.throughput = if secs > 0.0 {
            result.processed_items as f64 / secs
        } else {
            0.0
        };
        result.status = BatchStatus::classify(result.successful_items, result.failed_items);
        self.finish(job, result).await;
    }

    fn record_progress(&self, job_id: &str, result: &BatchResult) {
        let progress = if result.total_items == 0 {
            1.0
        } else {
            result.processed_items as f64 / result.total_items as f64
        };
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            job.progress = progress;
        }
        if let Some(monitor) = self.monitors.write().get_mut(job_id) {
            monitor.progress = progress;
            monitor.completed_tasks = result.successful_items;
            monitor.failed_tasks = result.failed_items;
        }
        debug!(job_id, progress, "Batch progress");
    }

    /// Fail a job that never reached a worker.
    async fn reject(&self, job: BatchJob, stage: &str, reason: &str) {
        error!(job_id = %job.id, stage, reason, "Batch job dropped");
        let mut result = BatchResult::pending(&job.id, job.input_paths.len());
        result.status = BatchStatus::Failed;
        result.error_summary.push(BatchError {
            item: String::new(),
            error: reason.to_string(),
            stage: stage.to_string(),
        });
        self.finish(job, result).await;
    }

    async fn finish(&self, mut job: BatchJob, result: BatchResult) {
        job.status = result.status;
        job.progress = 1.0;
        job.completed_at = Some(Utc::now());

        self.jobs.write().insert(job.id.clone(), job.clone());
        self.results.write().insert(job.id.clone(), result.clone());
        let active = {
            let mut monitors = self.monitors.write();
            if let Some(monitor) = monitors.get_mut(&job.id) {
                monitor.finish(&result);
            }
            monitors.len()
        };
        {
            let mut metrics = self.metrics.lock();
            metrics.record_result(&result);
            metrics.active_workflows = active;
        }

        if let Some(store) = &self.persistence {
            persist_record(store.as_ref(), BATCH_JOBS, &job.id, &job).await;
            persist_record(store.as_ref(), BATCH_RESULTS, &job.id, &result).await;
        }

        let (event_type, level) = match result.status {
            BatchStatus::Failed => (types::BATCH_FAILED, EventLevel::Error),
            _ => (types::BATCH_COMPLETED, EventLevel::Info),
        };
        self.events.publish(
            Event::new(event_type, SOURCE)
                .with_level(level)
                .with_data("job_id", job.id.clone())
                .with_data("job_type", job.job_type.as_str())
                .with_data("status", result.status.as_str())
                .with_data("processed_items", result.processed_items)
                .with_data("successful_items", result.successful_items)
                .with_data("failed_items", result.failed_items)
                .with_data("skipped_items", result.skipped_items),
        );

        info!(
            job_id = %job.id,
            status = result.status.as_str(),
            processed = result.processed_items,
            successful = result.successful_items,
            failed = result.failed_items,
            skipped = result.skipped_items,
            duration_ms = result.processing_time_ms,
            "Batch job finished"
        );
    }
}

async fn passes_filters(filters: &[BatchFilter], item: &str) -> bool {
    for filter in filters {
        if !filter.matches(item).await {
            return false;
        }
    }
    true
}

/// Priority-queued bulk job runner.
///
/// Jobs wait in four bounded tiers. A dispatcher ticks on
/// `dispatch_tick_ms`, moves the highest-priority job into a bounded hand-off
/// of `max_concurrent_jobs` slots read by `workers` tasks, and demotes the job
/// one tier when the hand-off is full.
pub struct BatchEngine {
    shared: Arc<Shared>,
    handoff: Mutex<Option<Arc<tokio::sync::Mutex<mpsc::Receiver<BatchJob>>>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BatchEngine {
    /// Idle engine; call [`Self::start`] to begin dispatching.
    pub fn new(config: BatchConfig, processor: Arc<dyn ItemProcessor>, events: Arc<EventBus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                tiers: Default::default(),
                processor,
                events,
                persistence: None,
                jobs: RwLock::new(HashMap::new()),
                results: RwLock::new(HashMap::new()),
                monitors: RwLock::new(HashMap::new()),
                metrics: Mutex::new(AutomationMetrics::default()),
            }),
            handoff: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Persist job and result summaries to `store`. Call before [`Self::start`].
    pub fn with_persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.persistence = Some(store);
        } else {
            warn!("Batch engine already running, persistence not attached");
        }
        self
    }

    /// Spawn the dispatcher and the worker pool. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let config = &self.shared.config;
        let (tx, rx) = mpsc::channel::<BatchJob>(config.max_concurrent_jobs.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        *self.handoff.lock() = Some(rx.clone());

        let mut tasks = self.tasks.lock();
        for worker in 0..config.workers.max(1) {
            let shared = self.shared.clone();
            let rx = rx.clone();
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(shared.worker_loop(worker, rx, shutdown)));
        }
        let shared = self.shared.clone();
        tasks.push(tokio::spawn(shared.dispatch_loop(tx, self.shutdown.subscribe())));

        info!(
            workers = config.workers.max(1),
            max_concurrent_jobs = config.max_concurrent_jobs.max(1),
            "Batch engine started"
        );
    }

    /// Validate and queue a job.
    ///
    /// Returns a queued placeholder result, or the final result when the job
    /// is synchronous.
    pub async fn process_batch(&self, mut job: BatchJob) -> SwitchyardResult<BatchResult> {
        self.validate(&mut job)?;
        job.status = BatchStatus::Queued;
        job.progress = 0.0;
        job.created_at = Some(Utc::now());

        let id = job.id.clone();
        let total = job.input_paths.len();
        let priority = job.effective_priority();
        let synchronous = job.synchronous;

        if let Some(store) = &self.shared.persistence {
            persist_record(store.as_ref(), BATCH_JOBS, &id, &job).await;
        }

        self.shared.jobs.write().insert(id.clone(), job.clone());
        self.shared
            .monitors
            .write()
            .insert(id.clone(), WorkflowMonitor::new(&id, total));

        if let Err(rejected) = self.shared.push(job) {
            self.shared.jobs.write().remove(&id);
            self.shared.monitors.write().remove(&id);
            let mut rejected = *rejected;
            rejected.status = BatchStatus::Failed;
            if let Some(store) = &self.shared.persistence {
                persist_record(store.as_ref(), BATCH_JOBS, &id, &rejected).await;
            }
            return Err(SwitchyardError::Capacity(format!(
                "{priority} batch queue is full"
            )));
        }

        {
            let active = self.shared.monitors.read().len();
            let mut metrics = self.shared.metrics.lock();
            metrics.record_submitted();
            metrics.active_workflows = active;
        }
        info!(job_id = %id, priority = %priority, items = total, synchronous, "Batch job queued");

        if synchronous {
            return self.wait_for_result(&id).await;
        }
        Ok(BatchResult::pending(id, total))
    }

    fn validate(&self, job: &mut BatchJob) -> SwitchyardResult<()> {
        if job.input_paths.is_empty() {
            return Err(SwitchyardError::Validation(
                "batch job must have at least one input path".into(),
            ));
        }
        if job.input_paths.iter().any(|p| p.trim().is_empty()) {
            return Err(SwitchyardError::Validation(
                "batch job input paths must not be empty".into(),
            ));
        }
        ensure_id(&mut job.id, "job");
        if matches!(job.batch_size, None | Some(0)) {
            job.batch_size = Some(self.shared.config.default_batch_size.max(1));
        }
        job.priority.get_or_insert(Priority::Medium);
        if job.name.is_empty() {
            job.name = format!("{} job", job.job_type);
        }
        Ok(())
    }

    /// Poll until `job_id` has a result, bounded by `sync_timeout_secs`.
    pub async fn wait_for_result(&self, job_id: &str) -> SwitchyardResult<BatchResult> {
        let poll = self.shared.config.poll_interval();
        let wait = async {
            let mut ticker = tokio::time::interval(poll);
            loop {
                ticker.tick().await;
                if let Some(result) = self.shared.results.read().get(job_id).cloned() {
                    return result;
                }
            }
        };
        tokio::time::timeout(self.shared.config.sync_timeout(), wait)
            .await
            .map_err(|_| SwitchyardError::Timeout(format!("batch job {job_id} timed out")))
    }

    /// Final result, or a placeholder carrying the current status.
    pub fn batch_result(&self, job_id: &str) -> SwitchyardResult<BatchResult> {
        if let Some(result) = self.shared.results.read().get(job_id) {
            return Ok(result.clone());
        }
        let jobs = self.shared.jobs.read();
        let job = jobs
            .get(job_id)
            .ok_or_else(|| SwitchyardError::NotFound(format!("batch job {job_id}")))?;
        let mut pending = BatchResult::pending(job_id, job.input_paths.len());
        pending.status = job.status;
        Ok(pending)
    }

    /// Job record, if known.
    pub fn job(&self, job_id: &str) -> Option<BatchJob> {
        self.shared.jobs.read().get(job_id).cloned()
    }

    /// Progress monitor for a job.
    pub fn workflow_status(&self, job_id: &str) -> SwitchyardResult<WorkflowMonitor> {
        self.shared
            .monitors
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| SwitchyardError::NotFound(format!("workflow monitor {job_id}")))
    }

    /// Aggregate batch metrics.
    pub fn metrics(&self) -> AutomationMetrics {
        let active = self.shared.monitors.read().len();
        let mut metrics = self.shared.metrics.lock().clone();
        metrics.active_workflows = active;
        metrics
    }

    /// Jobs waiting per tier, keyed by priority name.
    pub fn queue_sizes(&self) -> HashMap<String, usize> {
        Priority::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), self.shared.tiers[p.index()].lock().len()))
            .collect()
    }

    /// Queue an import of every template found under `path`.
    pub async fn import_templates(
        &self,
        path: impl Into<String>,
        config: HashMap<String, Value>,
    ) -> SwitchyardResult<BatchResult> {
        let path = path.into();
        let mut job = BatchJob::new(BatchJobType::Import, [path.clone()])
            .with_name(format!("Import templates from {path}"))
            .with_priority(Priority::High);
        job.config = config;
        self.process_batch(job).await
    }

    /// Queue an export of `template_ids` into `output_path` as `format`.
    pub async fn export_templates<I, S>(
        &self,
        template_ids: I,
        output_path: impl Into<String>,
        format: impl Into<String>,
    ) -> SwitchyardResult<BatchResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let output_path = output_path.into();
        let format: String = format.into();
        let job = BatchJob::new(BatchJobType::Export, template_ids)
            .with_name(format!("Export templates to {output_path}"))
            .with_output_path(output_path)
            .with_config("format", format)
            .with_priority(Priority::High);
        self.process_batch(job).await
    }

    /// Stop the dispatcher and workers after their current job.
    ///
    /// Jobs still queued or waiting in the hand-off get a failed result with
    /// stage `shutdown`, which also releases synchronous callers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Batch task ended abnormally");
            }
        }

        let mut stranded = Vec::new();
        let handoff = self.handoff.lock().take();
        if let Some(handoff) = handoff {
            let mut rx = handoff.lock().await;
            rx.close();
            while let Ok(job) = rx.try_recv() {
                stranded.push(job);
            }
        }
        while let Some(job) = self.shared.pop() {
            stranded.push(job);
        }
        for job in stranded {
            self.shared
                .reject(job, "shutdown", "batch engine stopped before the job ran")
                .await;
        }
        info!("Batch engine stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::EventConfig;

    struct Accept;

    #[async_trait]
    impl ItemProcessor for Accept {
        async fn process(
            &self,
            _job_type: BatchJobType,
            _item: &str,
            _config: &HashMap<String, Value>,
        ) -> SwitchyardResult<ItemOutput> {
            Ok(ItemOutput::default())
        }
    }

    fn engine(config: BatchConfig) -> BatchEngine {
        let events = Arc::new(EventBus::new(&EventConfig::default()));
        BatchEngine::new(config, Arc::new(Accept), events)
    }

    #[test]
    fn test_classify() {
        assert_eq!(BatchStatus::classify(5, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::classify(0, 0), BatchStatus::Completed);
        assert_eq!(BatchStatus::classify(3, 1), BatchStatus::Partial);
        assert_eq!(BatchStatus::classify(1, 1), BatchStatus::Failed);
        assert_eq!(BatchStatus::classify(0, 2), BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_extension_filter() {
        let filter = BatchFilter::new("extension", "equals", ".AEP");
        assert!(filter.matches("/tmp/intro.aep").await);
        assert!(!filter.matches("/tmp/intro.mov").await);
        assert!(!filter.matches("/tmp/noext").await);

        let not = BatchFilter::new("extension", "not_equals", "aep");
        assert!(not.matches("/tmp/clip.mov").await);
    }

    #[tokio::test]
    async fn test_size_filter() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.txt");
        tokio::fs::write(&small, b"abc").await.unwrap();
        let small = small.to_string_lossy().to_string();

        assert!(BatchFilter::new("size", "less_than", 10).matches(&small).await);
        assert!(!BatchFilter::new("size", "greater_than", 10).matches(&small).await);
        // Missing files pass.
        assert!(BatchFilter::new("size", "greater_than", 10).matches("/no/such/file").await);
    }

    #[tokio::test]
    async fn test_path_and_unknown_filters() {
        assert!(BatchFilter::new("path", "contains", "lower").matches("a/lower_third.aep").await);
        assert!(!BatchFilter::new("path", "not_contains", "lower").matches("a/lower.aep").await);
        assert!(BatchFilter::new("color", "equals", json!("red")).matches("x").await);
    }

    #[tokio::test]
    async fn test_validation_defaults() {
        let engine = engine(BatchConfig::default());
        let mut job = BatchJob::new(BatchJobType::Parse, ["a.aep"]).with_batch_size(0);
        engine.validate(&mut job).unwrap();
        assert!(job.id.starts_with("job_"));
        assert_eq!(job.batch_size, Some(100));
        assert_eq!(job.priority, Some(Priority::Medium));
        assert_eq!(job.name, "parse job");
    }

    #[tokio::test]
    async fn test_empty_inputs_rejected() {
        let engine = engine(BatchConfig::default());
        let err = engine
            .process_batch(BatchJob::new(BatchJobType::Analyze, Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Validation(_)));
        assert_eq!(engine.metrics().total_jobs, 0);
    }

    #[tokio::test]
    async fn test_queue_capacity() {
        let engine = engine(BatchConfig {
            queue_capacity: 2,
            ..BatchConfig::default()
        });
        for _ in 0..2 {
            engine
                .process_batch(BatchJob::new(BatchJobType::Parse, ["a"]).with_priority(Priority::Low))
                .await
                .unwrap();
        }
        let err = engine
            .process_batch(BatchJob::new(BatchJobType::Parse, ["a"]).with_priority(Priority::Low))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::Capacity(_)));
        assert_eq!(engine.queue_sizes()["low"], 2);
        assert_eq!(engine.metrics().active_workflows, 2);
    }

    #[tokio::test]
    async fn test_shutdown_fails_jobs_that_never_ran() {
        let engine = Arc::new(engine(BatchConfig {
            poll_interval_ms: 5,
            sync_timeout_secs: 30,
            ..BatchConfig::default()
        }));
        let queued = engine
            .process_batch(BatchJob::new(BatchJobType::Parse, ["a"]).with_id("job_waiting"))
            .await
            .unwrap();
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .process_batch(BatchJob::new(BatchJobType::Parse, ["b"]).with_id("job_sync").synchronous())
                    .await
            })
        };
        while engine.job("job_sync").is_none() {
            tokio::task::yield_now().await;
        }

        engine.shutdown().await;

        let result = engine.batch_result(&queued.job_id).unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(result.error_summary[0].stage, "shutdown");
        let sync = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(sync.status, BatchStatus::Failed);
        assert_eq!(engine.metrics().failed_jobs, 2);
    }

    #[tokio::test]
    async fn test_batch_result_for_queued_job() {
        let engine = engine(BatchConfig::default());
        let queued = engine
            .process_batch(BatchJob::new(BatchJobType::Parse, ["a", "b"]))
            .await
            .unwrap();
        assert_eq!(queued.status, BatchStatus::Queued);
        let looked_up = engine.batch_result(&queued.job_id).unwrap();
        assert_eq!(looked_up.total_items, 2);
        assert!(engine.batch_result("job_missing").is_err());
        assert!(engine.workflow_status(&queued.job_id).is_ok());
    }
}
