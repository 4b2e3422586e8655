use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SwitchyardError;

/// Delivery priority shared by the message bus and the batch engine.
///
/// Tiers are drained strictly in declaration order: a non-empty `Critical`
/// queue always wins over `High`, and so on down to `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Drained before everything else.
    Critical,
    /// Second tier.
    High,
    /// Default tier.
    #[default]
    Medium,
    /// Drained last.
    Low,
}

impl Priority {
    /// All tiers in drain order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Position of this tier in [`Priority::ALL`].
    pub fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    /// One tier lower, saturating at `Low`.
    pub fn demote(self) -> Priority {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Medium,
            Priority::Medium | Priority::Low => Priority::Low,
        }
    }

    /// Lowercase name used in logs and metrics keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(SwitchyardError::Validation(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}
