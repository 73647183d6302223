//! Event bus trait contract and event taxonomy (§4.2).

use async_trait::async_trait;
use galaxy_common::error::Result;
use galaxy_common::types::{DeviceId, TaskFailure, TaskStarId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    TaskCreated { id: TaskStarId, step: u32 },
    TaskReady { id: TaskStarId },
    TaskDispatched { id: TaskStarId, device_id: DeviceId },
    TaskCompleted { id: TaskStarId, result: serde_json::Value },
    TaskFailed { id: TaskStarId, failure: TaskFailure },
    TaskCancelled { id: TaskStarId },
    DeviceConnected { device_id: DeviceId },
    DeviceLost { device_id: DeviceId },
    RevisionCommitted { step: u32, edits: usize },
    BatchRejected { reason: String },
    ReplanRequested { reason: String },
    ConstellationCompleted,
    ConstellationFailed { reason: String },
}

impl Event {
    /// Stable label used for metrics and log correlation.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "task_created",
            Event::TaskReady { .. } => "task_ready",
            Event::TaskDispatched { .. } => "task_dispatched",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskCancelled { .. } => "task_cancelled",
            Event::DeviceConnected { .. } => "device_connected",
            Event::DeviceLost { .. } => "device_lost",
            Event::RevisionCommitted { .. } => "revision_committed",
            Event::BatchRejected { .. } => "batch_rejected",
            Event::ReplanRequested { .. } => "replan_requested",
            Event::ConstellationCompleted => "constellation_completed",
            Event::ConstellationFailed { .. } => "constellation_failed",
        }
    }
}

/// A live handle to a bounded per-subscriber inbox. Implementations may
/// surface lag (dropped events due to a slow subscriber) via `recv`
/// returning `Ok(None)` paired with an internal drop-count increment,
/// rather than silently skipping ahead.
#[async_trait]
pub trait Subscription: Send {
    /// Awaits the next event, or `None` once the bus has been closed.
    async fn recv(&mut self) -> Result<Option<Event>>;

    /// Total events dropped for this subscriber due to lag since creation.
    fn dropped_count(&self) -> u64;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;

    /// Creates a new subscription. Each subscriber receives its own
    /// bounded inbox; a subscriber that falls behind starts dropping the
    /// oldest buffered events rather than stalling the publisher.
    ///
    /// `kind_filter`: when `Some`, only events whose `Event::kind()` is in
    /// the list are delivered to this subscriber (others are skipped
    /// without counting against `dropped_count`); `None` subscribes to
    /// every kind.
    fn subscribe(&self, kind_filter: Option<&[&str]>) -> Box<dyn Subscription>;

    fn subscriber_count(&self) -> usize;
}
