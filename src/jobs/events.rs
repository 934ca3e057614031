//! Multicast event source with latest-value replay.
//!
//! Every job publishes its status, progress and rate through one of these.
//! Publishing and subscribing are serialized by a mutex, so a subscriber
//! sees the current value exactly once and then every later value in order.
//! Slow subscribers may miss intermediate values (broadcast lag) but never
//! see them reordered.

use std::sync::Mutex;

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// A "broadcast + latest-value cache" channel.
pub struct EventSource<T: Clone> {
    latest: Mutex<T>,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> EventSource<T> {
    pub fn new(initial: T) -> Self {
        Self::with_capacity(initial, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(initial: T, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            latest: Mutex::new(initial),
            tx,
        }
    }

    /// Store `value` as the latest and fan it out to every subscriber.
    pub fn publish(&self, value: T) {
        let mut latest = match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *latest = value.clone();
        // Ok if nobody is listening.
        let _ = self.tx.send(value);
    }

    /// The most recently published value.
    pub fn latest(&self) -> T {
        match self.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Subscribe; the first value received is the current one.
    pub fn subscribe(&self) -> Subscription<T> {
        let latest = match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Subscription {
            pending: Some(latest.clone()),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of an [`EventSource`].
pub struct Subscription<T: Clone> {
    pending: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next value, or `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping to newer values");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping to newer values");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Wait until a value satisfying `pred` arrives and return it.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        while let Some(value) = self.recv().await {
            if pred(&value) {
                return Some(value);
            }
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let next = sub.recv().await?;
            Some((next, sub))
        })
    }
}
