//! Priority message bus for Switchyard agents.
//!
//! Agents implement [`Agent`] and register with a [`MessageBus`]. Messages
//! are validated and routed through an ordered [`Middleware`] chain into four
//! bounded priority queues, then delivered by a fixed worker pool with
//! expiry checks and bounded retries.
//!
//! # Main types
//!
//! - [`MessageBus`]: Registration, sending, delivery workers, shutdown.
//! - [`Message`]: The routed unit, with [`MessageStatus`] tracking.
//! - [`Middleware`]: A layer of the send pipeline.
//! - [`BusMetrics`]: Traffic counters and moving averages.

/// Agent capability trait.
pub mod agent;
/// The message bus and its delivery workers.
pub mod bus;
/// Message model and send receipts.
pub mod message;
/// Traffic counters.
pub mod metrics;
/// Send pipeline layers.
pub mod middleware;
/// Per-tier bounded queues.
pub mod queue;
/// Agent and subscription registry.
pub mod registry;

pub use agent::Agent;
pub use bus::{MessageBus, MessageBusBuilder, SYSTEM_SENDER};
pub use message::{
    Message, MessageMetadata, MessageStatus, RecipientOutcome, SendReceipt, BROADCAST,
    BROADCAST_ALIAS,
};
pub use metrics::{BusMetrics, CommunicationMetrics};
pub use middleware::{
    Endpoint, LoggingMiddleware, MetricsMiddleware, Middleware, Next, PersistenceMiddleware,
};
pub use queue::PriorityQueues;
pub use registry::{AgentRegistry, ALL_TYPES};
