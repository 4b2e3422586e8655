use async_trait::async_trait;

use crate::SwitchyardResult;

/// Collection holding serialized messages keyed by message id.
pub const MESSAGES: &str = "messages";
/// Collection holding agent states keyed by agent id.
pub const AGENT_STATES: &str = "agent_states";
/// Collection holding events keyed by event id.
pub const EVENTS: &str = "events";
/// Collection holding batch job summaries keyed by job id.
pub const BATCH_JOBS: &str = "batch_jobs";
/// Collection holding batch results keyed by job id.
pub const BATCH_RESULTS: &str = "batch_results";

/// Opaque record store used for best-effort persistence.
///
/// Callers in the orchestration core log and continue when any of these
/// methods fail; nothing in the core requires the store to be reachable.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert or replace `record` under `key` in `collection`.
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        record: serde_json::Value,
    ) -> SwitchyardResult<()>;

    /// Fetch one record.
    async fn fetch(&self, collection: &str, key: &str)
        -> SwitchyardResult<Option<serde_json::Value>>;

    /// Most recently written records first, at most `limit`.
    async fn list(&self, collection: &str, limit: usize)
        -> SwitchyardResult<Vec<serde_json::Value>>;
}
