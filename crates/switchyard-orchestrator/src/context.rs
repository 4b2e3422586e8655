use crate::batch::{persist_record, BatchEngine, BatchJob, BatchResult, ItemProcessor};
use crate::monitor::AutomationMetrics;
use crate::pipeline::{PipelineManager, WorkflowExecutor};
use crate::scheduler::{Schedule, Trigger, WorkflowScheduler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use switchyard_bus::{Agent, BusMetrics, Message, MessageBus, Middleware, SendReceipt};
use switchyard_core::persistence::{AGENT_STATES, EVENTS};
use switchyard_core::{Persistence, SwitchyardConfig, SwitchyardResult};
use switchyard_events::{
    AgentState, AggregateMetrics, Event, EventBus, EventHandler, StateStore, WILDCARD,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Writes every published event to the `events` collection.
struct EventRecorder {
    store: Arc<dyn Persistence>,
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &Event) -> SwitchyardResult<()> {
        persist_record(self.store.as_ref(), EVENTS, &event.id, event).await;
        Ok(())
    }
}

async fn persist_states(store: &dyn Persistence, state: &StateStore) {
    for (agent_id, agent_state) in state.system_state() {
        persist_record(store, AGENT_STATES, &agent_id, &agent_state).await;
    }
}

/// Combined view over every subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationMetrics {
    /// Message bus traffic.
    pub bus: BusMetrics,
    /// Batch engine totals.
    pub automation: AutomationMetrics,
    /// Agent state totals.
    pub agents: AggregateMetrics,
    /// Events published so far.
    pub events_published: u64,
    /// Event notifications shed.
    pub events_dropped: u64,
    /// When the view was taken.
    pub timestamp: DateTime<Utc>,
}

/// Configures an [`Orchestration`] before it is built.
pub struct OrchestrationBuilder {
    config: SwitchyardConfig,
    processor: Arc<dyn ItemProcessor>,
    persistence: Option<Arc<dyn Persistence>>,
    executor: Option<Arc<dyn WorkflowExecutor>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl OrchestrationBuilder {
    /// Persist messages, events, agent states, and batch summaries.
    pub fn persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Run schedules and triggers through `executor` instead of the
    /// pipeline manager.
    pub fn executor(mut self, executor: Arc<dyn WorkflowExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Append a layer to the send pipeline.
    pub fn middleware(mut self, layer: Arc<dyn Middleware>) -> Self {
        self.middleware.push(layer);
        self
    }

    /// Wire the components together. Must be called inside a Tokio runtime.
    pub fn build(self) -> Orchestration {
        let config = self.config;
        let events = Arc::new(EventBus::new(&config.events));
        let state = Arc::new(StateStore::new(&config.state, events.clone()));

        let mut bus = MessageBus::builder(config.bus.clone(), state.clone());
        if let Some(store) = &self.persistence {
            bus = bus.persistence(store.clone());
            events.subscribe(
                [WILDCARD],
                Arc::new(EventRecorder {
                    store: store.clone(),
                }),
            );
        }
        for layer in self.middleware {
            bus = bus.middleware(layer);
        }
        let bus = Arc::new(bus.build());

        let pipelines = Arc::new(PipelineManager::new(events.clone()));
        let mut batch = BatchEngine::new(config.batch.clone(), self.processor, events.clone());
        if let Some(store) = &self.persistence {
            batch = batch.with_persistence(store.clone());
        }
        let executor = self
            .executor
            .unwrap_or_else(|| pipelines.clone() as Arc<dyn WorkflowExecutor>);
        let scheduler = WorkflowScheduler::new(config.scheduler.clone(), executor, events.clone());

        let (shutdown, _) = watch::channel(false);
        Orchestration {
            config,
            events,
            state,
            bus,
            pipelines,
            batch: Arc::new(batch),
            scheduler: Arc::new(scheduler),
            persistence: self.persistence,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// One orchestration instance: event bus, state store, message bus, batch
/// engine, pipeline manager, and scheduler sharing one configuration.
///
/// Nothing here is global; create as many independent contexts as needed.
pub struct Orchestration {
    config: SwitchyardConfig,
    events: Arc<EventBus>,
    state: Arc<StateStore>,
    bus: Arc<MessageBus>,
    pipelines: Arc<PipelineManager>,
    batch: Arc<BatchEngine>,
    scheduler: Arc<WorkflowScheduler>,
    persistence: Option<Arc<dyn Persistence>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestration {
    /// Start configuring a context.
    pub fn builder(config: SwitchyardConfig, processor: Arc<dyn ItemProcessor>) -> OrchestrationBuilder {
        OrchestrationBuilder {
            config,
            processor,
            persistence: None,
            executor: None,
            middleware: Vec::new(),
        }
    }

    /// Context with default wiring and no persistence.
    pub fn new(config: SwitchyardConfig, processor: Arc<dyn ItemProcessor>) -> Self {
        Self::builder(config, processor).build()
    }

    /// Build from a TOML configuration file.
    pub async fn from_config_file(
        path: impl AsRef<Path>,
        processor: Arc<dyn ItemProcessor>,
    ) -> SwitchyardResult<Self> {
        let config = SwitchyardConfig::load(path).await?;
        Ok(Self::new(config, processor))
    }

    /// Start message workers, the batch engine, the scheduler, and the
    /// periodic snapshot loop.
    pub fn start(&self) {
        self.bus.start();
        self.batch.start();
        self.scheduler.start();

        let state = self.state.clone();
        let store = self.persistence.clone();
        let period = self.config.state.snapshot_interval();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = state.create_snapshot();
                        debug!(snapshot_id = %snapshot.id, "Periodic snapshot taken");
                        if let Some(store) = &store {
                            persist_states(store.as_ref(), &state).await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);
        info!("Orchestration started");
    }

    /// Stop schedules first, then batch work, then the message bus.
    pub async fn shutdown(&self) {
        info!("Orchestration shutting down");
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Snapshot task ended abnormally");
            }
        }
        self.scheduler.shutdown().await;
        self.batch.shutdown().await;
        self.bus.shutdown().await;
        if let Some(store) = &self.persistence {
            persist_states(store.as_ref(), &self.state).await;
        }
        info!("Orchestration stopped");
    }

    /// Register an agent with the message bus.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> SwitchyardResult<()> {
        self.bus.register_agent(agent)
    }

    /// Remove an agent and its state.
    pub fn unregister_agent(&self, agent_id: &str) -> SwitchyardResult<()> {
        self.bus.unregister_agent(agent_id)
    }

    /// Send a direct or broadcast message.
    pub async fn send(&self, message: Message) -> SwitchyardResult<SendReceipt> {
        self.bus.send(message).await
    }

    /// Queue a batch job.
    pub async fn process_batch(&self, job: BatchJob) -> SwitchyardResult<BatchResult> {
        self.batch.process_batch(job).await
    }

    /// Add a cron schedule.
    pub fn schedule_workflow(&self, schedule: Schedule) -> SwitchyardResult<String> {
        self.scheduler.schedule_workflow(schedule)
    }

    /// Attach a trigger to a workflow.
    pub fn add_trigger(&self, workflow_id: &str, trigger: Trigger) -> SwitchyardResult<String> {
        self.scheduler.add_trigger(workflow_id, trigger)
    }

    /// Current state of an agent.
    pub fn agent_state(&self, agent_id: &str) -> SwitchyardResult<AgentState> {
        self.state.agent_state(agent_id)
    }

    /// Replace an agent's state.
    pub fn update_agent_state(&self, agent_id: &str, state: AgentState) -> SwitchyardResult<()> {
        self.state.update_agent_state(agent_id, state)
    }

    /// Terminal messages sent or received by `agent_id`, newest first.
    pub fn message_history(&self, agent_id: &str, limit: usize) -> Vec<Message> {
        self.bus.message_history(agent_id, limit)
    }

    /// Most recent events, oldest first. `0` returns the whole log.
    pub fn event_history(&self, limit: usize) -> Vec<Event> {
        self.events.history(limit)
    }

    /// Combined metrics from every component.
    pub fn metrics(&self) -> OrchestrationMetrics {
        OrchestrationMetrics {
            bus: self.bus.metrics(),
            automation: self.batch.metrics(),
            agents: self.state.aggregate_metrics(),
            events_published: self.events.published(),
            events_dropped: self.events.dropped_notifications(),
            timestamp: Utc::now(),
        }
    }

    /// Configuration the context was built with.
    pub fn config(&self) -> &SwitchyardConfig {
        &self.config
    }

    /// The message bus.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The state store.
    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// The pipeline manager.
    pub fn pipelines(&self) -> &Arc<PipelineManager> {
        &self.pipelines
    }

    /// The batch engine.
    pub fn batch(&self) -> &Arc<BatchEngine> {
        &self.batch
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }
}
