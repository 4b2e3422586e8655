use crate::batch::{BatchResult, BatchStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples kept in [`AutomationMetrics::throughput_trend`].
pub const THROUGHPUT_TREND_LEN: usize = 100;

/// Progress view of one batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMonitor {
    /// Job being monitored.
    pub workflow_id: String,
    /// Latest job status.
    pub status: BatchStatus,
    /// When monitoring began.
    pub start_time: DateTime<Utc>,
    /// Set when the job finishes.
    pub end_time: Option<DateTime<Utc>>,
    /// Items in the job.
    pub total_tasks: usize,
    /// Items processed successfully.
    pub completed_tasks: usize,
    /// Items that failed.
    pub failed_tasks: usize,
    /// Fraction of items handled, in `[0, 1]`.
    pub progress: f64,
    /// Items per second, set when the job finishes.
    pub throughput: f64,
}

impl WorkflowMonitor {
    /// Start monitoring a queued job.
    pub fn new(workflow_id: impl Into<String>, total_tasks: usize) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: BatchStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            progress: 0.0,
            throughput: 0.0,
        }
    }

    /// Fold a finished result into the monitor.
    pub fn finish(&mut self, result: &BatchResult) {
        self.status = result.status;
        self.completed_tasks = result.successful_items;
        self.failed_tasks = result.failed_items;
        self.throughput = result.throughput;
        self.progress = 1.0;
        self.end_time = Some(Utc::now());
    }
}

/// Engine-wide batch counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationMetrics {
    /// Jobs accepted.
    pub total_jobs: u64,
    /// Jobs with no failed item.
    pub completed_jobs: u64,
    /// Jobs with some failed items.
    pub partial_jobs: u64,
    /// Jobs that failed.
    pub failed_jobs: u64,
    /// Items processed across all jobs.
    pub total_items_processed: u64,
    /// Mean job duration.
    pub avg_processing_time_ms: f64,
    /// Per-job throughput, oldest first.
    pub throughput_trend: VecDeque<f64>,
    /// Monitors currently tracked.
    pub active_workflows: usize,
    /// Last time a job was submitted or finished.
    pub last_updated: Option<DateTime<Utc>>,
}

impl AutomationMetrics {
    pub(crate) fn record_submitted(&mut self) {
        self.total_jobs += 1;
        self.last_updated = Some(Utc::now());
    }

    pub(crate) fn record_result(&mut self, result: &BatchResult) {
        match result.status {
            BatchStatus::Completed => self.completed_jobs += 1,
            BatchStatus::Partial => self.partial_jobs += 1,
            BatchStatus::Failed => self.failed_jobs += 1,
            BatchStatus::Queued | BatchStatus::Running => {}
        }
        self.total_items_processed += result.processed_items as u64;

        let finished = (self.completed_jobs + self.partial_jobs + self.failed_jobs) as f64;
        self.avg_processing_time_ms +=
            (result.processing_time_ms as f64 - self.avg_processing_time_ms) / finished.max(1.0);

        self.throughput_trend.push_back(result.throughput);
        while self.throughput_trend.len() > THROUGHPUT_TREND_LEN {
            self.throughput_trend.pop_front();
        }
        self.last_updated = Some(Utc::now());
    }
}
