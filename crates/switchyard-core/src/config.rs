use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::telemetry::LogFormat;
use crate::{SwitchyardError, SwitchyardResult};

/// Top-level configuration for an orchestration context.
///
/// Every section is optional in TOML; missing keys fall back to the defaults
/// below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    /// Message bus settings.
    #[serde(default)]
    pub bus: BusConfig,
    /// Event bus settings.
    #[serde(default)]
    pub events: EventConfig,
    /// State store settings.
    #[serde(default)]
    pub state: StateConfig,
    /// Batch engine settings.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SwitchyardConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> SwitchyardResult<Self> {
        toml::from_str(raw).map_err(|e| SwitchyardError::Config(format!("Invalid config: {e}")))
    }

    /// Read and parse a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> SwitchyardResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SwitchyardError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }
}

/// Settings for the priority message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Delivery worker tasks.
    #[serde(default = "default_bus_workers")]
    pub workers: usize,
    /// Capacity of each priority tier.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Retry budget for messages that do not set one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Number of terminal messages kept in the history ledger.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Seconds between agent health checks.
    #[serde(default = "default_health_check_secs")]
    pub health_check_interval_secs: u64,
    /// Wait after the shutdown broadcast before stopping workers.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl BusConfig {
    /// Health check period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Time allowed for the shutdown broadcast to drain.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            workers: default_bus_workers(),
            queue_capacity: default_queue_capacity(),
            default_max_retries: default_max_retries(),
            history_limit: default_history_limit(),
            health_check_interval_secs: default_health_check_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Settings for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Maximum events retained in the log.
    #[serde(default = "default_event_log_capacity")]
    pub log_capacity: usize,
    /// Tasks draining the notification queue.
    #[serde(default = "default_notifier_workers")]
    pub notifier_workers: usize,
    /// Pending notifications before new ones are shed.
    #[serde(default = "default_dispatch_queue")]
    pub dispatch_queue: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_event_log_capacity(),
            notifier_workers: default_notifier_workers(),
            dispatch_queue: default_dispatch_queue(),
        }
    }
}

/// Settings for the agent state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Snapshots kept in history.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,
    /// Seconds between periodic snapshots.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl StateConfig {
    /// Period of the background snapshot loop.
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            snapshot_limit: default_snapshot_limit(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

/// Settings for the batch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Batch worker tasks.
    #[serde(default = "default_batch_workers")]
    pub workers: usize,
    /// Jobs that may wait in the worker hand-off before dispatch demotes.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Items per chunk when a job does not set one.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,
    /// Jobs per priority tier.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Milliseconds between dispatch passes.
    #[serde(default = "default_dispatch_tick_ms")]
    pub dispatch_tick_ms: u64,
    /// Milliseconds between result polls for synchronous jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a synchronous wait.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
}

impl BatchConfig {
    /// Dispatcher tick.
    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms.max(1))
    }

    /// Poll period for synchronous waits.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Wall-clock bound on synchronous waits.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: default_batch_workers(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            default_batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            dispatch_tick_ms: default_dispatch_tick_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sync_timeout_secs: default_sync_timeout_secs(),
        }
    }
}

/// Settings for the schedule evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between schedule evaluations.
    #[serde(default = "default_scheduler_tick_secs")]
    pub tick_secs: u64,
}

impl SchedulerConfig {
    /// Evaluation period.
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_scheduler_tick_secs(),
        }
    }
}

/// Settings for the tracing subscriber.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Plain or JSON output.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_bus_workers() -> usize {
    10
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_history_limit() -> usize {
    1000
}
fn default_health_check_secs() -> u64 {
    30
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_event_log_capacity() -> usize {
    1000
}
fn default_notifier_workers() -> usize {
    4
}
fn default_dispatch_queue() -> usize {
    1024
}
fn default_snapshot_limit() -> usize {
    100
}
fn default_snapshot_interval_secs() -> u64 {
    60
}
fn default_batch_workers() -> usize {
    10
}
fn default_max_concurrent_jobs() -> usize {
    5
}
fn default_batch_size() -> usize {
    100
}
fn default_dispatch_tick_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_sync_timeout_secs() -> u64 {
    3600
}
fn default_scheduler_tick_secs() -> u64 {
    60
}
