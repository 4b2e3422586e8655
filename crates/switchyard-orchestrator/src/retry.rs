use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use tracing::{info, warn};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Retry behaviour for a pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay growth between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based), capped at
    /// `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay_ms as f64;
        let ms = match self.backoff {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base * f64::from(attempt),
            BackoffKind::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * self.multiplier.powi(exp)
            }
        };
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds or the attempts are spent.
    ///
    /// `op` receives the 1-based attempt number. Sleeps [`Self::delay`]
    /// between attempts and returns the last error on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> SwitchyardResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SwitchyardResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err: Option<SwitchyardError> = None;

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt < attempts {
                        let delay = self.delay(attempt);
                        info!(
                            label,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(label, attempt, error = %e, "Attempts exhausted");
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            SwitchyardError::Delivery(format!("'{label}' made no attempts"))
        }))
    }
}
