//! Prioritized dispatch queues.
//!
//! Every subsystem dispatcher drains a [`Queue`]: three channels, one per
//! priority class, serviced strictly high before medium before low and
//! FIFO within a class. The bus fans published events into each
//! subscribed dispatcher's queue at the event's own priority.

use std::time::Duration;

use crossbeam_channel as chan;

use mlag_core::fsm::event::{Event, Priority, Subsystem};

/// Something a dispatcher can pull from its queue.
pub trait QueueItem: Send + 'static {
    /// The class the item is queued at.
    fn priority(&self) -> Priority;
}

/// The sending half of a dispatcher queue.
pub struct QueueSender<T> {
    high: chan::Sender<T>,
    medium: chan::Sender<T>,
    low: chan::Sender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            high: self.high.clone(),
            medium: self.medium.clone(),
            low: self.low.clone(),
        }
    }
}

impl<T: QueueItem> QueueSender<T> {
    /// Enqueue an item at its own priority. A send to a dispatcher that
    /// has already shut down is dropped; the queues are unbounded, so
    /// enqueueing cannot otherwise fail.
    pub fn send(&self, item: T) {
        let queue = match item.priority() {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        };
        queue.send(item).ok();
    }
}

/// The receiving half of a dispatcher queue.
pub struct Queue<T> {
    high: chan::Receiver<T>,
    medium: chan::Receiver<T>,
    low: chan::Receiver<T>,
    sender: QueueSender<T>,
}

impl<T: QueueItem> Queue<T> {
    /// Create a queue and its sender.
    pub fn new() -> Self {
        let (high_tx, high) = chan::unbounded();
        let (medium_tx, medium) = chan::unbounded();
        let (low_tx, low) = chan::unbounded();

        Self {
            high,
            medium,
            low,
            sender: QueueSender {
                high: high_tx,
                medium: medium_tx,
                low: low_tx,
            },
        }
    }

    /// A handle for enqueueing.
    pub fn sender(&self) -> QueueSender<T> {
        self.sender.clone()
    }

    /// Pull the highest-priority pending item, if any.
    pub fn try_recv(&self) -> Option<T> {
        self.high
            .try_recv()
            .or_else(|_| self.medium.try_recv())
            .or_else(|_| self.low.try_recv())
            .ok()
    }

    /// Pull the next item, waiting up to `timeout`. Pending items are
    /// always served in priority order; the wait only happens on an empty
    /// queue.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.try_recv() {
            return Some(item);
        }

        chan::select! {
            recv(self.high) -> item => item.ok(),
            recv(self.medium) -> item => item.ok(),
            recv(self.low) -> item => item.ok(),
            default(timeout) => None,
        }
    }
}

impl<T: QueueItem> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fans published events into every other subsystem's queue. Events never
/// loop back to their publisher: a machine has already reacted to its own
/// output by the time it is drained.
#[derive(Clone)]
pub struct Router {
    health: QueueSender<crate::HealthItem>,
    manager: QueueSender<crate::ManagerItem>,
    mac: QueueSender<crate::MacItem>,
}

impl Router {
    /// Build the router from the three dispatcher queues.
    pub fn new(
        health: QueueSender<crate::HealthItem>,
        manager: QueueSender<crate::ManagerItem>,
        mac: QueueSender<crate::MacItem>,
    ) -> Self {
        Self {
            health,
            manager,
            mac,
        }
    }

    /// Publish an event on behalf of `origin`.
    pub fn publish(&self, origin: Subsystem, event: Event) {
        if origin != Subsystem::Health {
            self.health.send(crate::HealthItem::Event(event.clone()));
        }
        if origin != Subsystem::Manager {
            self.manager.send(crate::ManagerItem::Event(event.clone()));
        }
        if origin != Subsystem::MacSync {
            self.mac.send(crate::MacItem::Event(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Item {
        High(u32),
        Medium(u32),
        Low(u32),
    }

    impl QueueItem for Item {
        fn priority(&self) -> Priority {
            match self {
                Item::High(_) => Priority::High,
                Item::Medium(_) => Priority::Medium,
                Item::Low(_) => Priority::Low,
            }
        }
    }

    #[test]
    fn test_strict_priority_order() {
        let queue: Queue<Item> = Queue::new();
        let sender = queue.sender();

        sender.send(Item::Low(1));
        sender.send(Item::Medium(2));
        sender.send(Item::Low(3));
        sender.send(Item::High(4));
        sender.send(Item::Medium(5));

        let drained: Vec<Item> = std::iter::from_fn(|| queue.try_recv()).collect();
        assert_eq!(
            drained,
            vec![
                Item::High(4),
                Item::Medium(2),
                Item::Medium(5),
                Item::Low(1),
                Item::Low(3),
            ]
        );
    }

    #[test]
    fn test_recv_timeout_on_empty() {
        let queue: Queue<Item> = Queue::new();
        assert_eq!(queue.recv_timeout(Duration::from_millis(5)), None);

        queue.sender().send(Item::Medium(1));
        assert_eq!(
            queue.recv_timeout(Duration::from_millis(5)),
            Some(Item::Medium(1))
        );
    }
}
