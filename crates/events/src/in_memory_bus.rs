//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

/// In-memory pub/sub bus.
///
/// No IO, best-effort fan-out. Subscribers whose receiver was dropped are
/// pruned on the next publish.
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<mpsc::Sender<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| InMemoryBusError::Poisoned)?;
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        // A poisoned lock yields a subscription that never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus = InMemoryEventBus::<u32>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::<u32>::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.drain(), vec![1]);
    }
}
