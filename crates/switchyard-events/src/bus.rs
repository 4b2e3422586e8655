use crate::event::{Event, EventHandler, WILDCARD};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchyard_core::{ensure_id, EventConfig};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

struct Dispatch {
    event: Arc<Event>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

/// Bounded, append-only event log with type-keyed subscribers.
///
/// Handlers run on a fixed pool of notifier tasks fed by a bounded queue.
/// Each call runs in its own task, so a panicking handler is logged and the
/// notifier keeps going. When the queue is full the notification is shed and counted; the event is
/// still recorded in the log.
pub struct EventBus {
    log: RwLock<VecDeque<Event>>,
    capacity: usize,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    dispatch: mpsc::Sender<Dispatch>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create an event bus and spawn its notifier tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &EventConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Dispatch>(config.dispatch_queue.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..config.notifier_workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(Dispatch { event, handlers }) = next else {
                        break;
                    };
                    for handler in handlers {
                        let target = event.clone();
                        let call = tokio::spawn(async move { handler.handle(&target).await });
                        match call.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(
                                worker,
                                event_id = %event.id,
                                event_type = %event.event_type,
                                error = %e,
                                "Event handler failed"
                            ),
                            Err(e) => error!(
                                worker,
                                event_id = %event.id,
                                event_type = %event.event_type,
                                error = %e,
                                "Event handler panicked"
                            ),
                        }
                    }
                }
                debug!(worker, "Event notifier stopped");
            });
        }

        Self {
            log: RwLock::new(VecDeque::with_capacity(config.log_capacity.min(1024))),
            capacity: config.log_capacity.max(1),
            subscribers: RwLock::new(HashMap::new()),
            dispatch: tx,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Record an event and schedule its subscribers.
    ///
    /// Returns the stored copy with its id assigned. Never fails: subscriber
    /// errors and shed notifications are only logged.
    pub fn publish(&self, mut event: Event) -> Event {
        ensure_id(&mut event.id, "evt");

        {
            let mut log = self.log.write();
            log.push_back(event.clone());
            while log.len() > self.capacity {
                log.pop_front();
            }
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscribers = self.subscribers.read();
            let exact = subscribers.get(&event.event_type).into_iter().flatten();
            let wildcard = subscribers.get(WILDCARD).into_iter().flatten();
            exact.chain(wildcard).cloned().collect()
        };

        if !handlers.is_empty() {
            let dispatch = Dispatch {
                event: Arc::new(event.clone()),
                handlers,
            };
            if let Err(e) = self.dispatch.try_send(dispatch) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %e,
                    "Event notification shed"
                );
            }
        }

        event
    }

    /// Register `handler` for each of `event_types` (use `"*"` for all).
    pub fn subscribe<I, S>(&self, event_types: I, handler: Arc<dyn EventHandler>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subscribers = self.subscribers.write();
        for event_type in event_types {
            subscribers
                .entry(event_type.into())
                .or_default()
                .push(handler.clone());
        }
    }

    /// The most recent `limit` events, oldest first. `0` returns everything.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let log = self.log.read();
        let take = if limit == 0 || limit > log.len() {
            log.len()
        } else {
            limit
        };
        log.iter().skip(log.len() - take).cloned().collect()
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.log.read().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.log.read().is_empty()
    }

    /// Number of handlers registered for `event_type` (wildcard excluded).
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Total events ever published.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Notifications shed because the dispatch queue was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::handler_fn;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use switchyard_core::SwitchyardError;

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        Arc::new(handler_fn(move |_e: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_publish_assigns_id() {
        let bus = EventBus::new(&EventConfig::default());
        let stored = bus.publish(Event::new("custom", "test"));
        assert!(stored.id.starts_with("evt_"));
        assert_eq!(bus.history(0)[0].id, stored.id);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_handlers() {
        let bus = EventBus::new(&EventConfig::default());
        let exact = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        bus.subscribe(["task_completed"], counting(exact.clone()));
        bus.subscribe([WILDCARD], counting(wildcard.clone()));

        bus.publish(Event::new("task_completed", "a"));
        bus.publish(Event::new("other", "a"));

        wait_for(&wildcard, 2).await;
        wait_for(&exact, 1).await;
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_reach_publisher() {
        let bus = EventBus::new(&EventConfig::default());
        let after = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            ["boom"],
            Arc::new(handler_fn(|_e: &Event| {
                Err(SwitchyardError::Delivery("handler exploded".into()))
            })),
        );
        bus.subscribe(["boom"], counting(after.clone()));

        let stored = bus.publish(Event::new("boom", "a"));
        assert!(!stored.id.is_empty());
        wait_for(&after, 1).await;
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_notifiers_alive() {
        let config = EventConfig {
            notifier_workers: 2,
            ..EventConfig::default()
        };
        let bus = EventBus::new(&config);
        bus.subscribe(
            ["boom"],
            Arc::new(handler_fn(|_e: &Event| -> switchyard_core::SwitchyardResult<()> {
                panic!("handler bug")
            })),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(["ping"], counting(seen.clone()));

        for _ in 0..6 {
            bus.publish(Event::new("boom", "t"));
        }
        bus.publish(Event::new("ping", "t"));

        wait_for(&seen, 1).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.dropped_notifications(), 0);
    }

    #[tokio::test]
    async fn test_log_is_bounded_fifo() {
        let config = EventConfig {
            log_capacity: 1000,
            ..EventConfig::default()
        };
        let bus = EventBus::new(&config);
        for i in 0..1500 {
            bus.publish(Event::new("tick", "t").with_data("n", i));
        }
        assert_eq!(bus.len(), 1000);
        let history = bus.history(0);
        assert_eq!(history.first().unwrap().data["n"], 500);
        assert_eq!(history.last().unwrap().data["n"], 1499);
    }

    #[tokio::test]
    async fn test_history_limit_returns_newest() {
        let bus = EventBus::new(&EventConfig::default());
        for i in 0..10 {
            bus.publish(Event::new("tick", "t").with_data("n", i));
        }
        let last3 = bus.history(3);
        assert_eq!(last3.len(), 3);
        assert_eq!(last3[0].data["n"], 7);
        assert_eq!(last3[2].data["n"], 9);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_dispatch_queue_sheds() {
        let config = EventConfig {
            dispatch_queue: 1,
            notifier_workers: 1,
            ..EventConfig::default()
        };
        let bus = EventBus::new(&config);
        let seen = Arc::new(AtomicUsize::new(0));
        bus.subscribe(["burst"], counting(seen.clone()));

        // Notifier cannot run until we yield, so only one dispatch fits.
        for _ in 0..5 {
            bus.publish(Event::new("burst", "t"));
        }
        assert_eq!(bus.dropped_notifications(), 4);
        assert_eq!(bus.len(), 5);

        wait_for(&seen, 1).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
