//! Cross-context forwarding for event buses.
//!
//! A [`BroadcastBridge`] connects buses that live in different contexts (for
//! example one per window or worker). A bus built with a bridge posts every
//! `emit_sync` to it; [`BroadcastBridge::attach`] feeds what other contexts
//! posted back into a local bus.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss envelopes
//! - **No echo**: a bus never re-dispatches its own envelopes
//! - **No re-posting**: envelopes received from the bridge are dispatched
//!   locally with `emit`, which never posts

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::EventBus;

/// Default channel capacity for a bridge.
const DEFAULT_CAPACITY: usize = 1024;

/// One event travelling between contexts.
#[derive(Debug, Clone)]
pub struct Envelope<K, D> {
    /// Origin id of the bus that posted the envelope.
    pub origin: Uuid,
    pub event: K,
    pub data: D,
}

/// A broadcast channel shared by buses in different contexts.
pub struct BroadcastBridge<K, D> {
    sender: broadcast::Sender<Envelope<K, D>>,
}

impl<K, D> Clone for BroadcastBridge<K, D> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<K, D> BroadcastBridge<K, D>
where
    K: Clone + Send + 'static,
    D: Clone + Send + 'static,
{
    /// Create a bridge with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bridge with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Post an envelope to every attached context.
    ///
    /// Returns the number of receivers that got it.
    pub fn post(&self, origin: Uuid, event: K, data: D) -> usize {
        self.sender
            .send(Envelope {
                origin,
                event,
                data,
            })
            .unwrap_or(0)
    }

    /// Receive raw envelopes posted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<K, D>> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Dispatch envelopes posted by other contexts into `bus`.
    ///
    /// Spawns a task on the current tokio runtime that runs until the bridge
    /// closes or the task is aborted.
    pub fn attach<R>(&self, bus: &EventBus<K, D, R>) -> JoinHandle<()>
    where
        K: Eq + std::hash::Hash + std::fmt::Debug + Sync,
        D: Sync,
        R: Send + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let bus = bus.clone();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if envelope.origin == bus.origin() {
                            continue;
                        }
                        bus.emit(&envelope.event, envelope.data).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(bus = %bus.name(), missed = n, "bridge receiver lagged, missed envelopes");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(bus = %bus.name(), "bridge closed, detaching");
                        break;
                    }
                }
            }
        })
    }
}

impl<K, D> Default for BroadcastBridge<K, D>
where
    K: Clone + Send + 'static,
    D: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, D> std::fmt::Debug for BroadcastBridge<K, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastBridge")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_post_reaches_subscribers() {
        let bridge: BroadcastBridge<&str, i32> = BroadcastBridge::new();
        let mut receiver = bridge.subscribe();
        let origin = Uuid::new_v4();

        assert_eq!(bridge.post(origin, "tick", 3), 1);

        let envelope = receiver.recv().await.unwrap();
        assert_eq!(envelope.origin, origin);
        assert_eq!(envelope.event, "tick");
        assert_eq!(envelope.data, 3);
    }

    #[test]
    fn test_post_without_receivers_returns_zero() {
        let bridge: BroadcastBridge<&str, i32> = BroadcastBridge::with_capacity(4);
        assert_eq!(bridge.post(Uuid::new_v4(), "tick", 1), 0);
        assert_eq!(bridge.receiver_count(), 0);
    }

    #[test]
    fn test_clone_shares_channel() {
        let bridge: BroadcastBridge<&str, i32> = BroadcastBridge::new();
        let other = bridge.clone();
        let _receiver = other.subscribe();
        assert_eq!(bridge.receiver_count(), 1);
        let debug = format!("{bridge:?}");
        assert!(debug.contains("receiver_count"));
    }
}
