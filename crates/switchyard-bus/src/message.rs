use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use switchyard_core::Priority;

/// Recipient that fans a message out to every subscribed agent.
pub const BROADCAST: &str = "broadcast";
/// Accepted alias for [`BROADCAST`].
pub const BROADCAST_ALIAS: &str = "all";

/// Delivery status of a [`Message`].
///
/// Transitions only move forward:
/// `queued -> processing -> {delivered | retry -> queued | failed | expired}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting in a priority queue.
    #[default]
    Queued,
    /// Picked up by a worker.
    Processing,
    /// Handler failed; re-enqueued with budget left.
    Retry,
    /// Handler succeeded.
    Delivered,
    /// Retry budget spent or re-enqueue impossible.
    Failed,
    /// TTL elapsed before pickup.
    Expired,
}

impl MessageStatus {
    /// Whether the message will never be queued again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Expired)
    }
}

/// Routing and handling hints attached to a [`Message`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Queue tier the message is placed in.
    #[serde(default)]
    pub priority: Priority,
    /// Placed at the head of its tier instead of the tail.
    #[serde(default)]
    pub urgent: bool,
    /// Record the message through the persistence collaborator.
    #[serde(default)]
    pub persist: bool,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// String headers carried alongside the payload.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Links a reply to the message it answers.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Time-to-live in milliseconds, measured from `created_at`.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// A unit of communication between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned on send when empty.
    #[serde(default)]
    pub id: String,
    /// Routing kind, e.g. `task` or `command`.
    pub message_type: String,
    /// Sender agent id.
    pub from: String,
    /// Agent id, or [`BROADCAST`].
    pub to: String,
    /// Short human-readable summary.
    #[serde(default)]
    pub subject: String,
    /// Structured body.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// Priority, TTL, retry budget, and tags.
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// Lifecycle status.
    #[serde(default)]
    pub status: MessageStatus,
    /// Delivery attempts that failed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Falls back to the bus default when unset.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// When the message was built.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Set once the recipient handled the message.
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Derived from the TTL on send.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Most recent handler error.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Message {
    /// Create a medium-priority message with no payload.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            message_type: message_type.into(),
            from: from.into(),
            to: to.into(),
            subject: String::new(),
            payload: HashMap::new(),
            metadata: MessageMetadata::default(),
            status: MessageStatus::Queued,
            retry_count: 0,
            max_retries: None,
            created_at: Utc::now(),
            delivered_at: None,
            expires_at: None,
            last_error: None,
        }
    }

    /// Set the subject line.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Add one payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set the delivery tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Jump ahead of non-urgent messages in the same tier.
    pub fn urgent(mut self) -> Self {
        self.metadata.urgent = true;
        self
    }

    /// Record the message through the persistence layer.
    pub fn persistent(mut self) -> Self {
        self.metadata.persist = true;
        self
    }

    /// Expire the message if it is not delivered within `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.metadata.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Override the configured retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    /// Add one header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.headers.insert(key.into(), value.into());
        self
    }

    /// Add one tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    /// Whether the recipient is the broadcast address (or its alias).
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST || self.to == BROADCAST_ALIAS
    }

    /// Derive `expires_at` from the TTL when it has not been set.
    ///
    /// A TTL too large to represent as a timestamp means no expiry.
    pub fn apply_ttl(&mut self) {
        if self.expires_at.is_none() {
            if let Some(ttl) = self.metadata.ttl_ms {
                self.expires_at = i64::try_from(ttl)
                    .ok()
                    .and_then(chrono::TimeDelta::try_milliseconds)
                    .and_then(|ttl| self.created_at.checked_add_signed(ttl));
            }
        }
    }

    /// Whether the message has outlived its TTL at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Copy addressed to a single broadcast recipient.
    pub fn copy_for(&self, recipient: &str) -> Self {
        let mut copy = self.clone();
        copy.id = format!("{}.{recipient}", self.id);
        copy.to = recipient.to_string();
        copy
    }
}

/// Per-recipient result of a send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    /// Agent the copy was addressed to.
    pub recipient: String,
    /// Id of the queued copy (equal to the original id for direct sends).
    pub message_id: String,
    /// Why the copy was not queued, if it was not.
    pub error: Option<String>,
}

impl RecipientOutcome {
    /// Whether this copy entered a queue.
    pub fn queued(&self) -> bool {
        self.error.is_none()
    }
}

/// What [`MessageBus::send`](crate::MessageBus::send) did with a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Id assigned to the sent message.
    pub message_id: String,
    /// One entry per recipient; a single entry for direct sends.
    pub deliveries: Vec<RecipientOutcome>,
}

impl SendReceipt {
    /// Number of recipients whose copy was queued.
    pub fn queued_count(&self) -> usize {
        self.deliveries.iter().filter(|d| d.queued()).count()
    }

    /// Recipients whose copy was rejected.
    pub fn failed_recipients(&self) -> Vec<&str> {
        self.deliveries
            .iter()
            .filter(|d| !d.queued())
            .map(|d| d.recipient.as_str())
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let msg = Message::new("planner", "verifier", "task");
        assert_eq!(msg.metadata.priority, Priority::Medium);
        assert_eq!(msg.status, MessageStatus::Queued);
        assert!(msg.max_retries.is_none());
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn test_broadcast_alias() {
        assert!(Message::new("a", "all", "note").is_broadcast());
        assert!(Message::new("a", BROADCAST, "note").is_broadcast());
    }

    #[test]
    fn test_ttl_sets_expiry() {
        let mut msg = Message::new("a", "b", "t").with_ttl(Duration::from_millis(5));
        msg.apply_ttl();
        let expires = msg.expires_at.unwrap();
        assert_eq!((expires - msg.created_at).num_milliseconds(), 5);
        assert!(!msg.is_expired_at(msg.created_at));
        assert!(msg.is_expired_at(expires));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        for ttl_ms in [u64::MAX, i64::MAX as u64] {
            let mut msg = Message::new("a", "b", "t");
            msg.metadata.ttl_ms = Some(ttl_ms);
            msg.apply_ttl();
            assert_eq!(msg.expires_at, None);
            assert!(!msg.is_expired_at(msg.created_at));
        }
    }

    #[test]
    fn test_copy_for_recipient() {
        let mut msg = Message::new("a", BROADCAST, "note");
        msg.id = "msg_1".into();
        let copy = msg.copy_for("b");
        assert_eq!(copy.id, "msg_1.b");
        assert_eq!(copy.to, "b");
        assert_eq!(copy.from, "a");
    }

    #[test]
    fn test_status_terminal() {
        assert!(MessageStatus::Expired.is_terminal());
        assert!(!MessageStatus::Retry.is_terminal());
    }

    #[test]
    fn test_deserialize_minimal() {
        let raw = r#"{"message_type":"task","from":"a","to":"b","metadata":{"priority":"high"}}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.metadata.priority, Priority::High);
        assert!(msg.id.is_empty());
    }
}
