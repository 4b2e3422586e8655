use crate::bus::EventBus;
use crate::event::{types, Event};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{new_id, StateConfig, SwitchyardError, SwitchyardResult};
use tracing::{debug, info};

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Ready for work.
    #[default]
    Idle,
    /// Handling a task.
    Busy,
    /// Failing; see the health checker.
    Error,
    /// Taken out of rotation.
    Maintenance,
    /// Shutting down.
    Stopping,
}

impl AgentStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
            Self::Stopping => "stopping",
        }
    }
}

/// Delivery accounting for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Messages handed to the agent.
    pub messages_received: u64,
    /// Messages handled successfully.
    pub messages_processed: u64,
    /// Messages whose handler failed.
    pub messages_failed: u64,
    /// Running mean of handler time.
    pub avg_processing_time_ms: f64,
    /// Handler time of the latest message.
    pub last_processing_time_ms: u64,
    /// Failed over received, in `[0, 1]`.
    pub error_rate: f64,
    /// Processed messages per minute since creation.
    pub throughput_per_minute: f64,
}

/// Observable state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Owning agent.
    pub agent_id: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: AgentStatus,
    /// Task in progress, if any.
    #[serde(default)]
    pub current_task: Option<String>,
    /// Fraction of the current task completed, in `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
    /// What the agent can do.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Agent-specific settings.
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    /// Delivery accounting.
    #[serde(default)]
    pub metrics: AgentMetrics,
    /// Last delivery or state change.
    pub last_activity: DateTime<Utc>,
    /// When the state was first recorded.
    pub created_at: DateTime<Utc>,
    /// Set on every write.
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    /// Idle state for `agent_id`.
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Idle,
            current_task: None,
            progress: 0.0,
            capabilities: Vec::new(),
            config: HashMap::new(),
            metrics: AgentMetrics::default(),
            last_activity: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status.
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the current task.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = Some(task.into());
        self
    }

    /// Replace the capability list.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn validate(&self) -> SwitchyardResult<()> {
        if self.agent_id.is_empty() {
            return Err(SwitchyardError::Validation(
                "agent state requires an agent_id".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.progress) || self.progress.is_nan() {
            return Err(SwitchyardError::Validation(format!(
                "progress {} for agent '{}' is outside [0, 1]",
                self.progress, self.agent_id
            )));
        }
        Ok(())
    }
}

/// Point-in-time copy of every agent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot id.
    pub id: String,
    /// Every agent state at snapshot time.
    pub states: HashMap<String, AgentState>,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied annotations.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Totals across every agent in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    /// Number of agents with state.
    pub agents: usize,
    /// Agent count per status.
    pub by_status: HashMap<String, usize>,
    /// Sum of received messages.
    pub messages_received: u64,
    /// Sum of processed messages.
    pub messages_processed: u64,
    /// Sum of failed messages.
    pub messages_failed: u64,
    /// Failed over received, or 0.
    pub error_rate: f64,
}

/// Registry of agent states with a bounded snapshot history.
///
/// The state map and the snapshot ring are guarded separately. Events are
/// published after the state lock is released.
pub struct StateStore {
    states: RwLock<HashMap<String, AgentState>>,
    snapshots: RwLock<VecDeque<StateSnapshot>>,
    snapshot_limit: usize,
    events: Arc<EventBus>,
}

impl StateStore {
    /// Empty store publishing to `events`.
    pub fn new(config: &StateConfig, events: Arc<EventBus>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(VecDeque::new()),
            snapshot_limit: config.snapshot_limit.max(1),
            events,
        }
    }

    /// Replace the state of `agent_id`.
    ///
    /// A `state_changed` event is published only when the status or current
    /// task differ from the stored state, or when there was none.
    pub fn update_agent_state(&self, agent_id: &str, mut state: AgentState) -> SwitchyardResult<()> {
        if state.agent_id.is_empty() {
            state.agent_id = agent_id.to_string();
        }
        if state.agent_id != agent_id {
            return Err(SwitchyardError::Validation(format!(
                "state for '{}' submitted under id '{agent_id}'",
                state.agent_id
            )));
        }
        state.validate()?;
        state.updated_at = Utc::now();

        let change = {
            let mut states = self.states.write();
            let previous = states.insert(agent_id.to_string(), state.clone());
            match previous {
                None => Some((None, None)),
                Some(prev)
                    if prev.status != state.status || prev.current_task != state.current_task =>
                {
                    Some((Some(prev.status), prev.current_task))
                }
                Some(_) => None,
            }
        };

        if let Some((old_status, old_task)) = change {
            debug!(agent_id, status = state.status.as_str(), "Agent state changed");
            let mut event = Event::new(types::STATE_CHANGED, agent_id)
                .with_data("agent_id", agent_id)
                .with_data("status", state.status.as_str());
            if let Some(old) = old_status {
                event = event.with_data("previous_status", old.as_str());
            }
            if let Some(task) = &state.current_task {
                event = event.with_data("current_task", task.as_str());
            }
            if let Some(task) = old_task {
                event = event.with_data("previous_task", task);
            }
            self.events.publish(event);
        }
        Ok(())
    }

    /// Insert an idle state for a newly registered agent without emitting
    /// an event. Existing entries are left alone.
    pub fn insert_initial(&self, agent_id: &str, capabilities: Vec<String>) {
        self.states
            .write()
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id).with_capabilities(capabilities));
    }

    /// Drop the state of an unregistered agent.
    pub fn remove(&self, agent_id: &str) -> Option<AgentState> {
        self.states.write().remove(agent_id)
    }

    /// Copy of the stored state.
    pub fn agent_state(&self, agent_id: &str) -> SwitchyardResult<AgentState> {
        self.states
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SwitchyardError::NotFound(format!("no state for agent '{agent_id}'")))
    }

    /// Copy of every stored state.
    pub fn system_state(&self) -> HashMap<String, AgentState> {
        self.states.read().clone()
    }

    /// Fold one delivery attempt into the agent's metrics.
    ///
    /// Does not touch status or task and never emits `state_changed`.
    /// Unknown agents are ignored.
    pub fn record_delivery(&self, agent_id: &str, success: bool, elapsed: Duration) {
        let mut states = self.states.write();
        let Some(state) = states.get_mut(agent_id) else {
            return;
        };
        let now = Utc::now();
        let elapsed_ms = elapsed.as_millis() as u64;
        let m = &mut state.metrics;

        m.messages_received += 1;
        if success {
            m.messages_processed += 1;
        } else {
            m.messages_failed += 1;
        }
        m.last_processing_time_ms = elapsed_ms;
        let n = m.messages_received as f64;
        m.avg_processing_time_ms += (elapsed_ms as f64 - m.avg_processing_time_ms) / n;
        m.error_rate = m.messages_failed as f64 / n;

        let minutes = (now - state.created_at).num_milliseconds().max(1) as f64 / 60_000.0;
        m.throughput_per_minute = m.messages_processed as f64 / minutes.max(1.0 / 60.0);

        state.last_activity = now;
    }

    /// Append a deep copy of every state to the snapshot ring.
    pub fn create_snapshot(&self) -> StateSnapshot {
        let states = self.system_state();
        let mut metadata = HashMap::new();
        metadata.insert("agent_count".to_string(), serde_json::json!(states.len()));
        let snapshot = StateSnapshot {
            id: new_id("snap"),
            states,
            timestamp: Utc::now(),
            metadata,
        };

        let mut ring = self.snapshots.write();
        ring.push_back(snapshot.clone());
        while ring.len() > self.snapshot_limit {
            ring.pop_front();
        }
        info!(snapshot_id = %snapshot.id, agents = snapshot.states.len(), "State snapshot created");
        snapshot
    }

    /// The most recent `limit` snapshots, oldest first. `0` returns all.
    pub fn state_history(&self, limit: usize) -> Vec<StateSnapshot> {
        let ring = self.snapshots.read();
        let take = if limit == 0 { ring.len() } else { limit.min(ring.len()) };
        ring.iter().skip(ring.len() - take).cloned().collect()
    }

    /// Totals across all agents.
    pub fn aggregate_metrics(&self) -> AggregateMetrics {
        let states = self.states.read();
        let mut agg = AggregateMetrics {
            agents: states.len(),
            ..AggregateMetrics::default()
        };
        for state in states.values() {
            *agg.by_status.entry(state.status.as_str().to_string()).or_default() += 1;
            agg.messages_received += state.metrics.messages_received;
            agg.messages_processed += state.metrics.messages_processed;
            agg.messages_failed += state.metrics.messages_failed;
        }
        if agg.messages_received > 0 {
            agg.error_rate = agg.messages_failed as f64 / agg.messages_received as f64;
        }
        agg
    }

    /// Handle to the event bus state changes are published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}
