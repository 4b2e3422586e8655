//! Event bus and agent state store for Switchyard.
//!
//! The [`EventBus`] keeps a bounded log of system events and fans them out to
//! subscribers on a fixed pool of notifier tasks. The [`StateStore`] owns the
//! observable state of every agent, publishes `state_changed` events when an
//! agent's status or task changes, and keeps a bounded ring of snapshots.

/// Bounded event log and subscriber fan-out.
pub mod bus;
/// Event model and handler trait.
pub mod event;
/// Agent state registry and snapshots.
pub mod state;

pub use bus::EventBus;
pub use event::{handler_fn, types, Event, EventHandler, EventLevel, FnHandler, TARGET_ALL, WILDCARD};
pub use state::{AgentMetrics, AgentState, AgentStatus, AggregateMetrics, StateSnapshot, StateStore};
