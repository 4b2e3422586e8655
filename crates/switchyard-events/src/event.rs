use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use switchyard_core::SwitchyardResult;

/// Subscribing to this type receives every event.
pub const WILDCARD: &str = "*";
/// Target used when an event is addressed to everyone.
pub const TARGET_ALL: &str = "all";

/// Well-known event types emitted by the orchestration core.
pub mod types {
    /// An agent was registered.
    pub const AGENT_STARTED: &str = "agent_started";
    /// An agent was unregistered.
    pub const AGENT_STOPPED: &str = "agent_stopped";
    /// An agent finished a task.
    pub const TASK_COMPLETED: &str = "task_completed";
    /// An agent task failed.
    pub const TASK_FAILED: &str = "task_failed";
    /// An agent state was replaced.
    pub const STATE_CHANGED: &str = "state_changed";
    /// Something went wrong, e.g. a failed health check.
    pub const ERROR: &str = "error";
    /// Health probe result.
    pub const HEALTH_CHECK: &str = "health_check";
    /// A message outlived its TTL.
    pub const MESSAGE_EXPIRED: &str = "message_expired";
    /// A message exhausted its retries.
    pub const MESSAGE_FAILED: &str = "message_failed";
    /// A batch job completed or partially completed.
    pub const BATCH_COMPLETED: &str = "batch_completed";
    /// A batch job failed.
    pub const BATCH_FAILED: &str = "batch_failed";
    /// A pipeline run began.
    pub const PIPELINE_STARTED: &str = "pipeline_started";
    /// A pipeline run finished.
    pub const PIPELINE_COMPLETED: &str = "pipeline_completed";
    /// A pipeline run aborted.
    pub const PIPELINE_FAILED: &str = "pipeline_failed";
    /// An optional stage was skipped.
    pub const STAGE_SKIPPED: &str = "stage_skipped";
    /// A schedule or trigger started a workflow.
    pub const WORKFLOW_TRIGGERED: &str = "workflow_triggered";
}

/// Severity attached to an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Recoverable problem.
    Warning,
    /// Failed operation.
    Error,
    /// Needs immediate attention.
    Critical,
}

/// A system event recorded in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned on publish when empty.
    pub id: String,
    /// Routing key for subscribers.
    pub event_type: String,
    /// Agent or component that produced the event.
    pub source: String,
    /// `"all"` or a specific recipient.
    pub target: String,
    /// Structured details.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    /// Severity.
    #[serde(default)]
    pub level: EventLevel,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When the event was built.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// New info-level event from `source`.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            source: source.into(),
            target: TARGET_ALL.to_string(),
            data: HashMap::new(),
            level: EventLevel::Info,
            tags: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Address the event to one agent.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Add one data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Set the severity.
    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    /// Add one tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Convenience accessor for string-valued data fields.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// Callback invoked for events of the types it was subscribed to.
///
/// Errors are logged by the event bus and never reach the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// React to `event`. Errors are logged by the bus.
    async fn handle(&self, event: &Event) -> SwitchyardResult<()>;
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as an event handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&Event) -> SwitchyardResult<()> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> SwitchyardResult<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> SwitchyardResult<()> {
        (self.0)(event)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new(types::ERROR, "health_checker")
            .with_data("agent_id", "planner")
            .with_level(EventLevel::Warning)
            .with_tag("health");
        assert!(event.id.is_empty());
        assert_eq!(event.target, TARGET_ALL);
        assert_eq!(event.data_str("agent_id"), Some("planner"));
        assert_eq!(event.level, EventLevel::Warning);
        assert_eq!(event.tags, vec!["health".to_string()]);
    }

    #[test]
    fn test_level_serialization() {
        let json = serde_json::to_string(&EventLevel::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = handler_fn(|e: &Event| {
            if e.event_type == "bad" {
                Err(switchyard_core::SwitchyardError::Validation("bad".into()))
            } else {
                Ok(())
            }
        });
        assert!(handler.handle(&Event::new("ok", "t")).await.is_ok());
        assert!(handler.handle(&Event::new("bad", "t")).await.is_err());
    }
}
