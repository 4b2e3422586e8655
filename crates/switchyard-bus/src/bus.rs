use crate::agent::Agent;
use crate::message::{Message, MessageStatus, RecipientOutcome, SendReceipt, BROADCAST};
use crate::metrics::{BusMetrics, CommunicationMetrics};
use crate::middleware::{
    persist_message, Endpoint, LoggingMiddleware, MetricsMiddleware, Middleware, Next,
    PersistenceMiddleware,
};
use crate::queue::PriorityQueues;
use crate::registry::AgentRegistry;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::{ensure_id, BusConfig, Persistence, Priority, SwitchyardError, SwitchyardResult};
use switchyard_events::{types, AgentStatus, Event, EventBus, EventLevel, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sender id used for messages originated by the bus itself.
pub const SYSTEM_SENDER: &str = "system";

/// Shared core used by the send path, the workers, and the health checker.
struct BusCore {
    config: BusConfig,
    registry: AgentRegistry,
    queues: PriorityQueues,
    state: Arc<StateStore>,
    events: Arc<EventBus>,
    metrics: Arc<CommunicationMetrics>,
    persistence: Option<Arc<dyn Persistence>>,
    history: RwLock<VecDeque<Message>>,
}

impl BusCore {
    fn validate(&self, message: &Message, internal: bool) -> SwitchyardResult<()> {
        if message.from.is_empty() {
            return Err(SwitchyardError::Validation("message has no sender".into()));
        }
        if message.to.is_empty() {
            return Err(SwitchyardError::Validation("message has no recipient".into()));
        }
        if message.message_type.is_empty() {
            return Err(SwitchyardError::Validation("message has no type".into()));
        }
        if !internal && !self.registry.contains(&message.from) {
            return Err(SwitchyardError::Validation(format!(
                "sender '{}' is not registered",
                message.from
            )));
        }
        if !message.is_broadcast() && !self.registry.contains(&message.to) {
            return Err(SwitchyardError::Validation(format!(
                "recipient '{}' is not registered",
                message.to
            )));
        }
        Ok(())
    }

    fn enqueue(&self, message: Message) -> SwitchyardResult<()> {
        let priority = message.metadata.priority;
        self.queues.push(message).map_err(|rejected| {
            SwitchyardError::Capacity(format!(
                "{priority} queue is full ({} messages), rejected '{}'",
                self.queues.capacity(),
                rejected.id
            ))
        })
    }

    fn route(&self, message: &mut Message, internal: bool) -> SwitchyardResult<SendReceipt> {
        self.validate(message, internal)?;
        message.status = MessageStatus::Queued;
        if message.max_retries.is_none() {
            message.max_retries = Some(self.config.default_max_retries);
        }

        if !message.is_broadcast() {
            self.enqueue(message.clone())?;
            return Ok(SendReceipt {
                message_id: message.id.clone(),
                deliveries: vec![RecipientOutcome {
                    recipient: message.to.clone(),
                    message_id: message.id.clone(),
                    error: None,
                }],
            });
        }

        message.to = BROADCAST.to_string();
        let mut deliveries = Vec::new();
        for recipient in self.registry.ids() {
            if recipient == message.from || !self.registry.accepts(&recipient, &message.message_type) {
                continue;
            }
            let copy = message.copy_for(&recipient);
            let copy_id = copy.id.clone();
            let error = self.enqueue(copy).err().map(|e| e.to_string());
            if let Some(reason) = &error {
                warn!(message_id = %copy_id, recipient = %recipient, error = %reason, "Broadcast copy rejected");
            }
            deliveries.push(RecipientOutcome {
                recipient,
                message_id: copy_id,
                error,
            });
        }

        let receipt = SendReceipt {
            message_id: message.id.clone(),
            deliveries,
        };
        if receipt.queued_count() == 0 && !receipt.deliveries.is_empty() {
            return Err(SwitchyardError::Capacity(format!(
                "broadcast '{}' reached no recipient: {}",
                message.id,
                receipt.failed_recipients().join(", ")
            )));
        }
        Ok(receipt)
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Message worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(message) = self.queues.pop() {
                self.deliver(message).await;
                continue;
            }
            tokio::select! {
                _ = self.queues.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker, "Message worker stopped");
    }

    async fn deliver(&self, mut message: Message) {
        if message.is_expired_at(Utc::now()) {
            message.status = MessageStatus::Expired;
            self.metrics.record_expired();
            warn!(message_id = %message.id, to = %message.to, "Message expired before delivery");
            self.events.publish(
                Event::new(types::MESSAGE_EXPIRED, "message_bus")
                    .with_target(message.to.as_str())
                    .with_data("message_id", message.id.as_str())
                    .with_level(EventLevel::Warning),
            );
            self.settle(message).await;
            return;
        }

        let Some(agent) = self.registry.get(&message.to) else {
            message.status = MessageStatus::Failed;
            message.last_error = Some(format!("recipient '{}' is no longer registered", message.to));
            self.metrics.record_failed();
            self.settle(message).await;
            return;
        };

        message.status = MessageStatus::Processing;
        let started = Instant::now();
        let outcome = agent.handle_message(&message).await;
        self.state
            .record_delivery(&message.to, outcome.is_ok(), started.elapsed());

        match outcome {
            Ok(()) => {
                message.status = MessageStatus::Delivered;
                message.delivered_at = Some(Utc::now());
                message.last_error = None;
                self.metrics.record_delivered();
                debug!(message_id = %message.id, to = %message.to, "Message delivered");
                self.settle(message).await;
            }
            Err(e) => {
                message.last_error = Some(e.to_string());
                let budget = message.max_retries.unwrap_or(self.config.default_max_retries);
                if message.retry_count < budget {
                    message.retry_count += 1;
                    message.status = MessageStatus::Retry;
                    self.metrics.record_retried();
                    info!(
                        message_id = %message.id,
                        to = %message.to,
                        attempt = message.retry_count,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    if let Err(rejected) = self.queues.push(message) {
                        let mut message = *rejected;
                        message.last_error = Some(format!(
                            "retry rejected: {} queue is full",
                            message.metadata.priority
                        ));
                        self.fail(message).await;
                    }
                } else {
                    self.fail(message).await;
                }
            }
        }
    }

    async fn fail(&self, mut message: Message) {
        message.status = MessageStatus::Failed;
        self.metrics.record_failed();
        error!(
            message_id = %message.id,
            to = %message.to,
            retries = message.retry_count,
            error = message.last_error.as_deref().unwrap_or(""),
            "Message failed"
        );
        self.events.publish(
            Event::new(types::MESSAGE_FAILED, "message_bus")
                .with_target(message.to.as_str())
                .with_data("message_id", message.id.as_str())
                .with_data("error", message.last_error.clone().unwrap_or_default())
                .with_level(EventLevel::Error),
        );
        self.settle(message).await;
    }

    /// Record a message that reached a terminal status.
    async fn settle(&self, message: Message) {
        if message.metadata.persist {
            if let Some(store) = &self.persistence {
                persist_message(store.as_ref(), &message).await;
            }
        }
        let mut history = self.history.write();
        history.push_back(message);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    fn check_health(&self) -> Vec<String> {
        let mut unhealthy = Vec::new();
        for agent in self.registry.agents() {
            if agent.is_healthy() {
                continue;
            }
            let id = agent.id().to_string();
            warn!(agent_id = %id, "Agent failed health check");
            self.events.publish(
                Event::new(types::ERROR, "health_checker")
                    .with_target(id.as_str())
                    .with_data("agent_id", id.as_str())
                    .with_data("reason", "health check failed")
                    .with_level(EventLevel::Warning),
            );
            unhealthy.push(id);
        }
        self.metrics.sample_throughput(Utc::now());
        unhealthy
    }
}

#[async_trait]
impl Endpoint for BusCore {
    async fn dispatch(&self, message: &mut Message) -> SwitchyardResult<SendReceipt> {
        self.route(message, false)
    }
}

/// Builder for [`MessageBus`].
pub struct MessageBusBuilder {
    config: BusConfig,
    state: Arc<StateStore>,
    persistence: Option<Arc<dyn Persistence>>,
    extra: Vec<Arc<dyn Middleware>>,
}

impl MessageBusBuilder {
    /// Record `persist` messages through `store`.
    pub fn persistence(mut self, store: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(store);
        self
    }

    /// Append a layer after the built-in logging, metrics, and persistence
    /// layers.
    pub fn middleware(mut self, layer: Arc<dyn Middleware>) -> Self {
        self.extra.push(layer);
        self
    }

    /// Assemble the bus. Must be called inside a Tokio runtime.
    pub fn build(self) -> MessageBus {
        let metrics = Arc::new(CommunicationMetrics::new());
        let mut chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(LoggingMiddleware),
            Arc::new(MetricsMiddleware::new(metrics.clone())),
        ];
        if let Some(store) = &self.persistence {
            chain.push(Arc::new(PersistenceMiddleware::new(store.clone())));
        }
        chain.extend(self.extra);

        let events = self.state.events().clone();
        let (shutdown_tx, _) = watch::channel(false);
        MessageBus {
            core: Arc::new(BusCore {
                queues: PriorityQueues::new(self.config.queue_capacity),
                registry: AgentRegistry::new(),
                state: self.state,
                events,
                metrics,
                persistence: self.persistence,
                history: RwLock::new(VecDeque::new()),
                config: self.config,
            }),
            chain,
            shutdown: shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}

/// Priority message bus connecting registered agents.
///
/// Sends are validated and queued synchronously through the middleware
/// chain. A fixed pool of workers started by [`MessageBus::start`] delivers
/// queued messages, retrying failures up to each message's budget.
pub struct MessageBus {
    core: Arc<BusCore>,
    chain: Vec<Arc<dyn Middleware>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MessageBus {
    /// Bus with the default middleware chain and no persistence.
    pub fn new(config: BusConfig, state: Arc<StateStore>) -> Self {
        Self::builder(config, state).build()
    }

    /// Start configuring a bus with persistence or extra middleware.
    pub fn builder(config: BusConfig, state: Arc<StateStore>) -> MessageBusBuilder {
        MessageBusBuilder {
            config,
            state,
            persistence: None,
            extra: Vec::new(),
        }
    }

    /// Spawn the delivery workers and the health checker. Calling this
    /// again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();
        let workers = self.core.config.workers.max(1);
        for worker in 0..workers {
            let core = self.core.clone();
            let rx = self.shutdown.subscribe();
            tasks.push(tokio::spawn(core.worker_loop(worker, rx)));
        }

        let core = self.core.clone();
        let mut rx = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.health_check_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        core.check_health();
                    }
                    _ = rx.changed() => break,
                }
            }
        }));
        info!(workers, "Message bus started");
    }

    /// Add an agent, seed its state, and announce it.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) -> SwitchyardResult<()> {
        let id = agent.id().to_string();
        let kind = agent.kind().to_string();
        let capabilities = agent.capabilities();
        self.core.registry.register(agent)?;
        self.core.state.insert_initial(&id, capabilities);
        self.core.events.publish(
            Event::new(types::AGENT_STARTED, id.as_str())
                .with_data("agent_id", id.as_str())
                .with_data("kind", kind.as_str()),
        );
        info!(agent_id = %id, kind = %kind, "Agent registered");
        Ok(())
    }

    /// Remove an agent, its subscriptions, and its state.
    pub fn unregister_agent(&self, agent_id: &str) -> SwitchyardResult<()> {
        let agent = self.core.registry.unregister(agent_id)?;
        agent.set_state(AgentStatus::Stopping);
        self.core.state.remove(agent_id);
        self.core.events.publish(
            Event::new(types::AGENT_STOPPED, agent_id).with_data("agent_id", agent_id),
        );
        info!(agent_id, "Agent unregistered");
        Ok(())
    }

    /// Replace the broadcast subscriptions of `agent_id`.
    pub fn subscribe(&self, agent_id: &str, message_types: Vec<String>) -> SwitchyardResult<()> {
        self.core.registry.subscribe(agent_id, message_types)
    }

    /// Validate and queue a message through the middleware chain.
    ///
    /// Assigns an id and computes the expiry from the TTL. Broadcasts queue
    /// one copy per subscribed recipient other than the sender and fail only
    /// if no copy could be queued.
    pub async fn send(&self, mut message: Message) -> SwitchyardResult<SendReceipt> {
        ensure_id(&mut message.id, "msg");
        message.apply_ttl();
        Next::new(&self.chain, self.core.as_ref())
            .run(&mut message)
            .await
    }

    /// Registered agent ids, sorted.
    pub fn registered_agents(&self) -> Vec<String> {
        self.core.registry.ids()
    }

    /// Find a message among settled and still-queued messages.
    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.core
            .history
            .read()
            .iter()
            .rev()
            .find(|m| m.id == message_id)
            .cloned()
            .or_else(|| self.core.queues.find(message_id))
    }

    /// Settled messages sent by or to `agent_id`, newest first. `0` means no
    /// limit.
    pub fn message_history(&self, agent_id: &str, limit: usize) -> Vec<Message> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        self.core
            .history
            .read()
            .iter()
            .rev()
            .filter(|m| m.from == agent_id || m.to == agent_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Queue length per tier.
    pub fn queue_sizes(&self) -> HashMap<String, usize> {
        Priority::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), self.core.queues.len(*p)))
            .collect()
    }

    /// Traffic counters, moving averages, and agent health.
    pub fn metrics(&self) -> BusMetrics {
        let agents = self.core.registry.agents();
        let healthy = agents.iter().filter(|a| a.is_healthy()).count();
        self.core
            .metrics
            .snapshot(self.queue_sizes(), agents.len(), healthy)
    }

    /// Run one health check now. Returns the ids of unhealthy agents.
    pub fn check_health(&self) -> Vec<String> {
        self.core.check_health()
    }

    /// Event bus the message bus publishes to.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.core.events
    }

    /// State store updated on registration and delivery.
    pub fn state(&self) -> &Arc<StateStore> {
        &self.core.state
    }

    /// Take a final snapshot, broadcast an urgent shutdown command, wait the
    /// grace period, then stop workers after their in-flight delivery.
    pub async fn shutdown(&self) {
        info!("Message bus shutting down");
        self.core.state.create_snapshot();

        let mut notice = Message::new(SYSTEM_SENDER, BROADCAST, "command")
            .with_subject("shutdown")
            .with_priority(Priority::Critical)
            .urgent();
        ensure_id(&mut notice.id, "msg");
        match self.core.route(&mut notice, true) {
            Ok(receipt) => debug!(recipients = receipt.queued_count(), "Shutdown broadcast queued"),
            Err(e) => warn!(error = %e, "Shutdown broadcast failed"),
        }

        if self.started.load(Ordering::SeqCst) {
            tokio::time::sleep(self.core.config.shutdown_grace()).await;
        }
        for agent in self.core.registry.agents() {
            agent.set_state(AgentStatus::Stopping);
        }

        let _ = self.shutdown.send(true);
        self.core.queues.wake_all();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Bus task ended abnormally");
            }
        }
        info!("Message bus stopped");
    }
}
