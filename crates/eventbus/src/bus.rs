//! `tokio::sync::broadcast`-backed event bus (§4.2).
//!
//! Broadcast channels already implement exactly the bounded-inbox-with-lag
//! semantics the constellation core needs: a subscriber that falls behind
//! the channel capacity gets `RecvError::Lagged(n)` on its next `recv`
//! rather than blocking the publisher or growing unbounded. We surface
//! that as a dropped-event counter instead of a hard error.

use async_trait::async_trait;
use galaxy_common::error::Result;
use galaxy_common::metrics::{DefaultMetricsCollector, MetricsCollector};
use galaxy_core::event::{Event, EventBus, Subscription};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
    metrics: Box<dyn MetricsCollector>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            metrics: Box::new(DefaultMetricsCollector),
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.metrics.record_event_published(event.kind());
        // No receivers is not an error: the bus may be published to before
        // the first subscriber attaches.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self, kind_filter: Option<&[&str]>) -> Box<dyn Subscription> {
        Box::new(BroadcastSubscription {
            receiver: self.sender.subscribe(),
            dropped: 0,
            kind_filter: kind_filter.map(|kinds| kinds.iter().map(|k| k.to_string()).collect()),
        })
    }

    fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

struct BroadcastSubscription {
    receiver: broadcast::Receiver<Event>,
    dropped: u64,
    kind_filter: Option<Vec<String>>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn recv(&mut self) -> Result<Option<Event>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(kinds) = &self.kind_filter {
                        if !kinds.iter().any(|k| k == event.kind()) {
                            continue;
                        }
                    }
                    return Ok(Some(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, total_dropped = self.dropped, "subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped
    }
}
