use crate::message::{Message, MessageStatus, SendReceipt};
use crate::metrics::CommunicationMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use switchyard_core::persistence::MESSAGES;
use switchyard_core::{Persistence, SwitchyardResult};
use tracing::{debug, info, warn};

/// One layer of the send pipeline.
///
/// A layer may inspect or modify the message, must call [`Next::run`] to
/// continue, and may observe the outcome afterwards.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Process `message`, usually by calling `next.run(message)`.
    async fn handle(&self, message: &mut Message, next: Next<'_>) -> SwitchyardResult<SendReceipt>;
}

/// Terminal step of the chain: validation and routing.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Route the message after every layer has run.
    async fn dispatch(&self, message: &mut Message) -> SwitchyardResult<SendReceipt>;
}

/// The remainder of a middleware chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Start of a chain ending in `endpoint`.
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn Endpoint) -> Self {
        Self { chain, endpoint }
    }

    /// Run the next layer, or the endpoint once the chain is exhausted.
    pub async fn run(self, message: &mut Message) -> SwitchyardResult<SendReceipt> {
        match self.chain.split_first() {
            Some((layer, rest)) => {
                layer
                    .handle(message, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.dispatch(message).await,
        }
    }
}

/// Structured log line per send.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, message: &mut Message, next: Next<'_>) -> SwitchyardResult<SendReceipt> {
        debug!(
            message_id = %message.id,
            from = %message.from,
            to = %message.to,
            message_type = %message.message_type,
            priority = %message.metadata.priority,
            "Sending message"
        );
        let result = next.run(message).await;
        match &result {
            Ok(receipt) => info!(
                message_id = %message.id,
                from = %message.from,
                to = %message.to,
                queued = receipt.queued_count(),
                "Message queued"
            ),
            Err(e) => warn!(
                message_id = %message.id,
                from = %message.from,
                to = %message.to,
                error = %e,
                "Message rejected"
            ),
        }
        result
    }
}

/// Feeds send latency and outcome into [`CommunicationMetrics`].
pub struct MetricsMiddleware {
    metrics: Arc<CommunicationMetrics>,
}

impl MetricsMiddleware {
    /// Record send latency and errors into `metrics`.
    pub fn new(metrics: Arc<CommunicationMetrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn handle(&self, message: &mut Message, next: Next<'_>) -> SwitchyardResult<SendReceipt> {
        let started = Instant::now();
        let result = next.run(message).await;
        self.metrics.observe_send(started.elapsed(), result.is_ok());
        result
    }
}

/// Records `persist` messages, and again as failed if routing rejects them.
///
/// Store failures are logged and never fail the send.
pub struct PersistenceMiddleware {
    store: Arc<dyn Persistence>,
}

impl PersistenceMiddleware {
    /// Upsert persistent messages into `store`.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for PersistenceMiddleware {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn handle(&self, message: &mut Message, next: Next<'_>) -> SwitchyardResult<SendReceipt> {
        if !message.metadata.persist {
            return next.run(message).await;
        }
        // Recorded before routing; workers overwrite it with the terminal status.
        persist_message(self.store.as_ref(), message).await;
        let result = next.run(message).await;
        if let Err(e) = &result {
            message.status = MessageStatus::Failed;
            message.last_error = Some(e.to_string());
            persist_message(self.store.as_ref(), message).await;
        }
        result
    }
}

/// Best-effort upsert of a message into the `messages` collection.
pub(crate) async fn persist_message(store: &dyn Persistence, message: &Message) {
    let record = match serde_json::to_value(message) {
        Ok(v) => v,
        Err(e) => {
            warn!(message_id = %message.id, error = %e, "Failed to serialize message");
            return;
        }
    };
    if let Err(e) = store.upsert(MESSAGES, &message.id, record).await {
        warn!(message_id = %message.id, error = %e, "Failed to persist message");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::message::RecipientOutcome;
    use parking_lot::Mutex;
    use switchyard_core::SwitchyardError;

    struct Echo;

    #[async_trait]
    impl Endpoint for Echo {
        async fn dispatch(&self, message: &mut Message) -> SwitchyardResult<SendReceipt> {
            if message.to == "nobody" {
                return Err(SwitchyardError::Validation("not registered".into()));
            }
            Ok(SendReceipt {
                message_id: message.id.clone(),
                deliveries: vec![RecipientOutcome {
                    recipient: message.to.clone(),
                    message_id: message.id.clone(),
                    error: None,
                }],
            })
        }
    }

    struct Tagger(&'static str, Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Tagger {
        fn name(&self) -> &str {
            self.0
        }
        async fn handle(&self, message: &mut Message, next: Next<'_>) -> SwitchyardResult<SendReceipt> {
            self.1.lock().push(format!("before:{}", self.0));
            message.metadata.tags.push(self.0.to_string());
            let result = next.run(message).await;
            self.1.lock().push(format!("after:{}", self.0));
            result
        }
    }

    #[tokio::test]
    async fn test_chain_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Tagger("outer", trace.clone())),
            Arc::new(Tagger("inner", trace.clone())),
        ];
        let mut msg = Message::new("a", "b", "t");
        msg.id = "m1".into();
        let receipt = Next::new(&chain, &Echo).run(&mut msg).await.unwrap();

        assert_eq!(receipt.queued_count(), 1);
        assert_eq!(msg.metadata.tags, vec!["outer", "inner"]);
        assert_eq!(
            *trace.lock(),
            vec!["before:outer", "before:inner", "after:inner", "after:outer"]
        );
    }

    #[tokio::test]
    async fn test_metrics_middleware_counts_rejections() {
        let metrics = Arc::new(CommunicationMetrics::new());
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(MetricsMiddleware::new(metrics.clone()))];

        let mut ok = Message::new("a", "b", "t");
        Next::new(&chain, &Echo).run(&mut ok).await.unwrap();
        let mut bad = Message::new("a", "nobody", "t");
        assert!(Next::new(&chain, &Echo).run(&mut bad).await.is_err());

        let snap = metrics.snapshot(Default::default(), 0, 0);
        assert_eq!(snap.total_messages, 1);
        assert_eq!(snap.rejected, 1);
    }

    #[tokio::test]
    async fn test_empty_chain_hits_endpoint() {
        let mut msg = Message::new("a", "nobody", "t");
        let err = Next::new(&[], &Echo).run(&mut msg).await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[derive(Default)]
    struct Recording {
        fail: bool,
        writes: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl Persistence for Recording {
        async fn upsert(&self, _c: &str, _k: &str, record: serde_json::Value) -> SwitchyardResult<()> {
            if self.fail {
                return Err(SwitchyardError::Persistence("disk on fire".into()));
            }
            self.writes.lock().push(record);
            Ok(())
        }
        async fn fetch(&self, _c: &str, _k: &str) -> SwitchyardResult<Option<serde_json::Value>> {
            Ok(None)
        }
        async fn list(&self, _c: &str, _l: usize) -> SwitchyardResult<Vec<serde_json::Value>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persistence_records_rejection_as_failed() {
        let store = Arc::new(Recording::default());
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(PersistenceMiddleware::new(store.clone()))];

        let mut skipped = Message::new("a", "b", "t");
        Next::new(&chain, &Echo).run(&mut skipped).await.unwrap();
        assert!(store.writes.lock().is_empty());

        let mut bad = Message::new("a", "nobody", "t").persistent();
        assert!(Next::new(&chain, &Echo).run(&mut bad).await.is_err());
        let writes = store.writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0]["status"], "queued");
        assert_eq!(writes[1]["status"], "failed");
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_send() {
        let store = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(PersistenceMiddleware::new(store))];
        let mut msg = Message::new("a", "b", "t").persistent();
        assert!(Next::new(&chain, &Echo).run(&mut msg).await.is_ok());
    }
}
