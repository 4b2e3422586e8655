//! Batch engine, processing pipelines, scheduler, and the orchestration
//! context for Switchyard.
//!
//! # Main types
//!
//! - [`Orchestration`]: One explicit context wiring every component.
//! - [`BatchEngine`]: Priority-queued bulk jobs over an [`ItemProcessor`].
//! - [`PipelineManager`]: Ordered stage chains with retry and dependency
//!   gating.
//! - [`WorkflowScheduler`]: Cron schedules and triggers.
//! - [`RetryPolicy`]: Fixed, linear, or exponential backoff.

/// Batch jobs, filters, and the batch engine.
pub mod batch;
/// Orchestration context.
pub mod context;
/// Workflow monitors and automation metrics.
pub mod monitor;
/// Processing pipelines and stage handlers.
pub mod pipeline;
/// Retry and backoff.
pub mod retry;
/// Cron schedules and triggers.
pub mod scheduler;

pub use batch::{
    BatchEngine, BatchError, BatchFilter, BatchJob, BatchJobType, BatchResult, BatchStatus,
    ItemOutput, ItemProcessor,
};
pub use context::{Orchestration, OrchestrationBuilder, OrchestrationMetrics};
pub use monitor::{AutomationMetrics, WorkflowMonitor, THROUGHPUT_TREND_LEN};
pub use pipeline::{
    PipelineManager, PipelineRun, PipelineStage, PipelineStatus, ProcessingPipeline,
    StageHandler, StageOutcome, StageStatus, WorkflowExecutor, DEFAULT_STAGE_TYPES,
};
pub use retry::{BackoffKind, RetryPolicy};
pub use scheduler::{
    next_fire_time, parse_cron, CronJob, Schedule, Trigger, TriggerKind, WorkflowScheduler,
};
