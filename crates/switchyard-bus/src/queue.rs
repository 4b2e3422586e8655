use crate::message::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use switchyard_core::Priority;
use tokio::sync::{futures::Notified, Notify};

/// Four bounded FIFO queues, one per priority tier.
///
/// Each tier has its own lock. Consumers always take from the highest
/// non-empty tier, so sustained high-priority load can starve lower tiers.
pub struct PriorityQueues {
    tiers: [Mutex<VecDeque<Message>>; 4],
    capacity: usize,
    notify: Notify,
}

impl PriorityQueues {
    /// Four empty lanes of `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue on the message's tier: urgent at the head, otherwise at the
    /// tail. A full tier hands the message back untouched.
    pub fn push(&self, message: Message) -> Result<(), Box<Message>> {
        {
            let mut tier = self.tiers[message.metadata.priority.index()].lock();
            if tier.len() >= self.capacity {
                return Err(Box::new(message));
            }
            if message.metadata.urgent {
                tier.push_front(message);
            } else {
                tier.push_back(message);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the head of the highest non-empty tier.
    pub fn pop(&self) -> Option<Message> {
        self.tiers.iter().find_map(|tier| tier.lock().pop_front())
    }

    /// Resolves after a push, or immediately if a push happened while no
    /// consumer was waiting.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake every waiting consumer.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Messages waiting in one lane.
    pub fn len(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].lock().len()
    }

    /// Sum of all tiers.
    pub fn total(&self) -> usize {
        self.tiers.iter().map(|tier| tier.lock().len()).sum()
    }

    /// Whether every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Per-lane capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of a queued message.
    pub fn find(&self, message_id: &str) -> Option<Message> {
        self.tiers.iter().find_map(|tier| {
            tier.lock()
                .iter()
                .find(|m| m.id == message_id)
                .cloned()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn msg(id: &str, priority: Priority) -> Message {
        let mut m = Message::new("a", "b", "t").with_priority(priority);
        m.id = id.into();
        m
    }

    #[test]
    fn test_highest_tier_first() {
        let queues = PriorityQueues::new(10);
        queues.push(msg("low", Priority::Low)).unwrap();
        queues.push(msg("crit", Priority::Critical)).unwrap();
        queues.push(msg("med", Priority::Medium)).unwrap();

        assert_eq!(queues.pop().unwrap().id, "crit");
        assert_eq!(queues.pop().unwrap().id, "med");
        assert_eq!(queues.pop().unwrap().id, "low");
        assert!(queues.pop().is_none());
    }

    #[test]
    fn test_urgent_jumps_its_tier() {
        let queues = PriorityQueues::new(10);
        queues.push(msg("n1", Priority::High)).unwrap();
        queues.push(msg("n2", Priority::High)).unwrap();
        queues.push(msg("u", Priority::High).urgent()).unwrap();

        assert_eq!(queues.pop().unwrap().id, "u");
        assert_eq!(queues.pop().unwrap().id, "n1");
    }

    #[test]
    fn test_full_tier_returns_message() {
        let queues = PriorityQueues::new(2);
        queues.push(msg("1", Priority::Low)).unwrap();
        queues.push(msg("2", Priority::Low)).unwrap();
        let rejected = queues.push(msg("3", Priority::Low)).unwrap_err();
        assert_eq!(rejected.id, "3");
        assert_eq!(queues.len(Priority::Low), 2);
        // Other tiers are independent.
        queues.push(msg("4", Priority::High)).unwrap();
        assert_eq!(queues.total(), 3);
    }

    #[test]
    fn test_find() {
        let queues = PriorityQueues::new(4);
        queues.push(msg("x", Priority::Medium)).unwrap();
        assert!(queues.find("x").is_some());
        assert!(queues.find("y").is_none());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queues = std::sync::Arc::new(PriorityQueues::new(4));
        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move {
                queues.notified().await;
                queues.pop()
            })
        };
        tokio::task::yield_now().await;
        queues.push(msg("w", Priority::Low)).unwrap();
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().id, "w");
    }
}
