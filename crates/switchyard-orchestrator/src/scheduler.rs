use crate::pipeline::WorkflowExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use switchyard_core::{ensure_id, SchedulerConfig, SwitchyardError, SwitchyardResult};
use switchyard_events::{types, Event, EventBus, EventHandler};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const SOURCE: &str = "scheduler";

fn default_enabled() -> bool {
    true
}

/// Parse a cron expression into a [`cron::Schedule`].
///
/// Accepts 6- and 7-field expressions (seconds first, optional year). A
/// classic 5-field expression gets a leading `0` seconds field. Times are UTC.
pub fn parse_cron(cron_expr: &str) -> SwitchyardResult<cron::Schedule> {
    let trimmed = cron_expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| {
        SwitchyardError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
    })
}

/// First fire time of `cron_expr` strictly after `after`.
pub fn next_fire_time(cron_expr: &str, after: DateTime<Utc>) -> SwitchyardResult<DateTime<Utc>> {
    parse_cron(cron_expr)?.after(&after).next().ok_or_else(|| {
        SwitchyardError::Config(format!(
            "Cron expression '{cron_expr}' has no upcoming fire times"
        ))
    })
}

/// A workflow run on a cron timetable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Assigned as `sched_<uuid>` when empty.
    #[serde(default)]
    pub id: String,
    /// Defaults to `schedule for <workflow>`.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// 5, 6, or 7-field cron expression, evaluated in UTC.
    pub cron_expression: String,
    /// Workflow to run.
    pub workflow_id: String,
    /// Free-form settings.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Disabled schedules are never run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// When the latest run finished.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Next fire time.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    /// Runs finished.
    #[serde(default)]
    pub run_count: u64,
    /// Runs that succeeded.
    #[serde(default)]
    pub success_count: u64,
    /// Runs that failed.
    #[serde(default)]
    pub failure_count: u64,
    /// Set when scheduled.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Enabled schedule for `workflow_id`.
    pub fn new(workflow_id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            cron_expression: cron_expression.into(),
            workflow_id: workflow_id.into(),
            config: HashMap::new(),
            enabled: true,
            last_run: None,
            next_run: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            created_at: None,
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

    /// Store the schedule without running it.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// What fires a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Backed by a [`Schedule`].
    TimeBased {
        /// Cron expression for the backing schedule.
        cron_expression: String,
    },
    /// Fires on every event of `event_type`.
    EventBased {
        /// Event type to match.
        event_type: String,
    },
    /// Fired only through [`WorkflowScheduler::trigger_workflow`].
    Manual,
}

/// A condition that starts a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Assigned as `trig_<uuid>` when empty.
    #[serde(default)]
    pub id: String,
    /// Time, event, or manual.
    #[serde(flatten)]
    pub kind: TriggerKind,
    /// Disabled triggers are stored but never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Schedule created for a time-based trigger.
    #[serde(default)]
    pub schedule_id: Option<String>,
}

impl Trigger {
    fn with_kind(kind: TriggerKind) -> Self {
        Self {
            id: String::new(),
            kind,
            enabled: true,
            schedule_id: None,
        }
    }

    /// Fire on a cron expression.
    pub fn time_based(cron_expression: impl Into<String>) -> Self {
        Self::with_kind(TriggerKind::TimeBased {
            cron_expression: cron_expression.into(),
        })
    }

    /// Fire on every event of `event_type`.
    pub fn event_based(event_type: impl Into<String>) -> Self {
        Self::with_kind(TriggerKind::EventBased {
            event_type: event_type.into(),
        })
    }

    /// Fire only on request.
    pub fn manual() -> Self {
        Self::with_kind(TriggerKind::Manual)
    }

    /// Store the trigger without arming it.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A schedule plus its in-flight flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    /// The stored schedule.
    pub schedule: Schedule,
    /// Set while a run is in flight; due ticks are skipped meanwhile.
    pub running: bool,
}

struct Core {
    jobs: RwLock<HashMap<String, CronJob>>,
    triggers: RwLock<HashMap<String, Vec<Trigger>>>,
    executor: Arc<dyn WorkflowExecutor>,
    events: Arc<EventBus>,
}

impl Core {
    async fn run_workflow(&self, workflow_id: &str, event: Option<&Event>, via: &str) -> SwitchyardResult<()> {
        info!(workflow_id, via, "Workflow triggered");
        let mut announce = Event::new(types::WORKFLOW_TRIGGERED, SOURCE)
            .with_data("workflow_id", workflow_id)
            .with_data("via", via);
        if let Some(event) = event {
            announce = announce.with_data("event_id", event.id.clone());
        }
        self.events.publish(announce);

        let result = self.executor.execute_workflow(workflow_id, event).await;
        if let Err(e) = &result {
            warn!(workflow_id, via, error = %e, "Workflow run failed");
        }
        result
    }

    /// `due_at` is the evaluation time that launched the run; the next run
    /// is computed from whichever of it and the finish time is later.
    async fn run_scheduled(self: Arc<Self>, schedule_id: String, workflow_id: String, due_at: DateTime<Utc>) {
        let result = self.run_workflow(&workflow_id, None, "schedule").await;
        let finished = Utc::now();

        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(&schedule_id) else {
            return;
        };
        job.running = false;
        let schedule = &mut job.schedule;
        schedule.last_run = Some(finished);
        schedule.run_count += 1;
        if result.is_ok() {
            schedule.success_count += 1;
        } else {
            schedule.failure_count += 1;
        }
        schedule.next_run = match next_fire_time(&schedule.cron_expression, finished.max(due_at)) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(schedule_id = %schedule_id, error = %e, "Schedule has no next run");
                None
            }
        };
        debug!(
            schedule_id = %schedule_id,
            run_count = schedule.run_count,
            next_run = ?schedule.next_run,
            "Scheduled run finished"
        );
    }
}

/// Starts an event-based trigger's workflow in its own task.
struct TriggerHandler {
    core: Weak<Core>,
    trigger_id: String,
    workflow_id: String,
}

#[async_trait]
impl EventHandler for TriggerHandler {
    async fn handle(&self, event: &Event) -> SwitchyardResult<()> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        debug!(trigger_id = %self.trigger_id, event_id = %event.id, "Event trigger fired");
        let workflow_id = self.workflow_id.clone();
        let event = event.clone();
        tokio::spawn(async move {
            // Failures are logged by run_workflow.
            let _ = core.run_workflow(&workflow_id, Some(&event), "event").await;
        });
        Ok(())
    }
}

/// Cron schedules and triggers that run workflows through a
/// [`WorkflowExecutor`].
pub struct WorkflowScheduler {
    core: Arc<Core>,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkflowScheduler {
    /// Scheduler with no schedules; call [`Self::start`] to begin evaluating.
    pub fn new(config: SchedulerConfig, executor: Arc<dyn WorkflowExecutor>, events: Arc<EventBus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                jobs: RwLock::new(HashMap::new()),
                triggers: RwLock::new(HashMap::new()),
                executor,
                events,
            }),
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Validate a schedule, compute its first run, and store it.
    pub fn schedule_workflow(&self, mut schedule: Schedule) -> SwitchyardResult<String> {
        if schedule.cron_expression.trim().is_empty() {
            return Err(SwitchyardError::Config("cron expression is required".into()));
        }
        if schedule.workflow_id.trim().is_empty() {
            return Err(SwitchyardError::Config("workflow id is required".into()));
        }
        let now = Utc::now();
        let next = next_fire_time(&schedule.cron_expression, now)?;

        ensure_id(&mut schedule.id, "sched");
        if schedule.name.is_empty() {
            schedule.name = format!("schedule for {}", schedule.workflow_id);
        }
        schedule.next_run = Some(next);
        schedule.created_at = Some(now);

        let id = schedule.id.clone();
        info!(
            schedule_id = %id,
            workflow_id = %schedule.workflow_id,
            cron = %schedule.cron_expression,
            next_run = %next,
            "Workflow scheduled"
        );
        self.core.jobs.write().insert(
            id.clone(),
            CronJob {
                schedule,
                running: false,
            },
        );
        Ok(id)
    }

    /// Stored schedule by id.
    pub fn schedule(&self, id: &str) -> SwitchyardResult<Schedule> {
        self.core
            .jobs
            .read()
            .get(id)
            .map(|job| job.schedule.clone())
            .ok_or_else(|| SwitchyardError::NotFound(format!("schedule {id}")))
    }

    /// All schedules, sorted by id.
    pub fn schedules(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self
            .core
            .jobs
            .read()
            .values()
            .map(|job| job.schedule.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Whether a run of the schedule is in flight.
    pub fn is_running(&self, schedule_id: &str) -> bool {
        self.core
            .jobs
            .read()
            .get(schedule_id)
            .is_some_and(|job| job.running)
    }

    /// Start every enabled, idle schedule due at `now`.
    ///
    /// Runs are spawned; the returned ids are the schedules launched.
    pub fn check_schedules(&self, now: DateTime<Utc>) -> Vec<String> {
        check_due(&self.core, now)
    }

    /// Attach a trigger to `workflow_id`, returning the trigger id.
    pub fn add_trigger(&self, workflow_id: &str, mut trigger: Trigger) -> SwitchyardResult<String> {
        if workflow_id.trim().is_empty() {
            return Err(SwitchyardError::Validation("workflow id is required".into()));
        }
        ensure_id(&mut trigger.id, "trig");

        match &trigger.kind {
            TriggerKind::TimeBased { cron_expression } => {
                let mut schedule = Schedule::new(workflow_id, cron_expression.clone())
                    .with_name(format!("trigger {}", trigger.id));
                schedule.enabled = trigger.enabled;
                trigger.schedule_id = Some(self.schedule_workflow(schedule)?);
            }
            TriggerKind::EventBased { event_type } => {
                if event_type.trim().is_empty() {
                    return Err(SwitchyardError::Config(
                        "event-based trigger requires an event type".into(),
                    ));
                }
                if trigger.enabled {
                    self.core.events.subscribe(
                        [event_type.clone()],
                        Arc::new(TriggerHandler {
                            core: Arc::downgrade(&self.core),
                            trigger_id: trigger.id.clone(),
                            workflow_id: workflow_id.to_string(),
                        }),
                    );
                }
            }
            TriggerKind::Manual => {}
        }

        let id = trigger.id.clone();
        info!(trigger_id = %id, workflow_id, kind = ?trigger.kind, "Trigger added");
        self.core
            .triggers
            .write()
            .entry(workflow_id.to_string())
            .or_default()
            .push(trigger);
        Ok(id)
    }

    /// Triggers attached to a workflow.
    pub fn triggers(&self, workflow_id: &str) -> Vec<Trigger> {
        self.core
            .triggers
            .read()
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Run `workflow_id` now.
    pub async fn trigger_workflow(&self, workflow_id: &str, event: Option<&Event>) -> SwitchyardResult<()> {
        self.core.run_workflow(workflow_id, event, "manual").await
    }

    /// Spawn the evaluation loop, ticking every `tick_secs`. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let core = self.core.clone();
        let mut shutdown = self.shutdown.subscribe();
        let tick = self.config.tick();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let launched = check_due(&core, Utc::now());
                        if !launched.is_empty() {
                            debug!(count = launched.len(), "Scheduled workflows launched");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Scheduler loop stopped");
        });
        self.tasks.lock().push(handle);
        info!(tick_secs = tick.as_secs(), "Scheduler started");
    }

    /// Stop the evaluation loop. Runs already in flight finish on their own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}

/// Mark due schedules running and spawn their runs.
fn check_due(core: &Arc<Core>, now: DateTime<Utc>) -> Vec<String> {
    let due: Vec<(String, String)> = {
        let mut jobs = core.jobs.write();
        jobs.values_mut()
            .filter(|job| {
                job.schedule.enabled
                    && !job.running
                    && job.schedule.next_run.is_some_and(|next| next <= now)
            })
            .map(|job| {
                job.running = true;
                (job.schedule.id.clone(), job.schedule.workflow_id.clone())
            })
            .collect()
    };

    due.into_iter()
        .map(|(schedule_id, workflow_id)| {
            tokio::spawn(core.clone().run_scheduled(schedule_id.clone(), workflow_id, now));
            schedule_id
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_parse_valid_cron() {
        assert!(parse_cron("0 * * * * * *").is_ok());
        assert!(parse_cron("0 0 * * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        let err = parse_cron("not a cron expression").unwrap_err();
        assert!(matches!(err, SwitchyardError::Config(_)));
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_five_field_expression_fires_on_the_minute() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 30).unwrap();
        let next = next_fire_time("*/15 * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn test_next_fire_time_is_after_reference() {
        let now = Utc::now();
        let next = next_fire_time("0 * * * * * *", now).unwrap();
        assert!(next > now);
        assert!(next <= now + Duration::minutes(1));
    }

    #[test]
    fn test_trigger_serialization() {
        let trigger = Trigger::event_based("batch_completed");
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "event_based");
        assert_eq!(json["event_type"], "batch_completed");
        let back: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, trigger.kind);
    }
}
