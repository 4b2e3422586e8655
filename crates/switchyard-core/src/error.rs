use thiserror::Error;

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

/// Top-level error type for the Switchyard orchestration substrate.
///
/// Validation, registration, capacity, and configuration errors are returned
/// synchronously to the caller. Delivery errors stay inside the bus retry
/// machinery and surface through message status instead.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// A message, job, or state update failed validation before queuing.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate registration or an operation on an unknown agent.
    #[error("Registration error: {0}")]
    Registration(String),

    /// The target queue is at capacity.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// An agent's message handler rejected a delivery.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Invalid pipeline, schedule, or runtime configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A mandatory pipeline stage failed after exhausting its retries.
    #[error("Stage '{stage}' failed: {reason}")]
    Stage {
        /// Id of the failing stage.
        stage: String,
        /// The last error observed from the stage handler.
        reason: String,
    },

    /// A lookup by id found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The persistence collaborator failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchyardError {
    /// Whether the error was raised before anything was queued.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SwitchyardError::Validation(_)
                | SwitchyardError::Registration(_)
                | SwitchyardError::Capacity(_)
                | SwitchyardError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_names_stage() {
        let err = SwitchyardError::Stage {
            stage: "verify".into(),
            reason: "boom".into(),
        };
        assert_eq!(err.to_string(), "Stage 'verify' failed: boom");
    }

    #[test]
    fn test_rejection_classification() {
        assert!(SwitchyardError::Capacity("full".into()).is_rejection());
        assert!(SwitchyardError::Validation("x".into()).is_rejection());
        assert!(!SwitchyardError::Delivery("x".into()).is_rejection());
        assert!(!SwitchyardError::Timeout("x".into()).is_rejection());
    }
}
