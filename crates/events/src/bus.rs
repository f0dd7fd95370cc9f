//! Publish/subscribe abstraction (mechanics only).
//!
//! The bus distributes messages to every subscriber (broadcast). It makes no
//! persistence or ordering promises; anything that must survive a crash is
//! written to the database before it is published.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, TryRecvError};

/// Receiving end of a bus: a copy of every message published after it was
/// created. Polled by the gateway that forwards events to sockets.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Everything buffered so far, oldest first.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic pub/sub bus.
///
/// `publish` may fail (lock poisoned, broker down); callers decide whether
/// that matters. Real-time delivery treats it as best effort.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
