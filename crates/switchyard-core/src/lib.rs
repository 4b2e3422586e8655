//! Core types and error definitions for the Switchyard orchestration substrate.
//!
//! This crate provides the foundational pieces shared by every Switchyard
//! crate: the error taxonomy, the priority tiers used by both the message bus
//! and the batch engine, the opaque persistence seam, and runtime
//! configuration.
//!
//! # Main types
//!
//! - [`SwitchyardError`]: Unified error enum for all Switchyard subsystems.
//! - [`SwitchyardResult`]: Convenience alias for `Result<T, SwitchyardError>`.
//! - [`Priority`]: The four delivery tiers (critical, high, medium, low).
//! - [`Persistence`]: Best-effort record store collaborator.
//! - [`SwitchyardConfig`]: TOML-backed runtime configuration.

/// Runtime configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Persistence collaborator seam.
pub mod persistence;
/// Priority tiers.
pub mod priority;
/// Tracing subscriber setup.
pub mod telemetry;

pub use config::{
    BatchConfig, BusConfig, EventConfig, LoggingConfig, SchedulerConfig, StateConfig,
    SwitchyardConfig,
};
pub use error::{SwitchyardError, SwitchyardResult};
pub use persistence::Persistence;
pub use priority::Priority;
pub use telemetry::{init_tracing, LogFormat};

use uuid::Uuid;

/// Generate a prefixed identifier such as `msg_6f1c...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Fill `id` with a fresh prefixed identifier when it is empty.
pub fn ensure_id(id: &mut String, prefix: &str) {
    if id.is_empty() {
        *id = new_id(prefix);
    }
}
