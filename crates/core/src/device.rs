//! Device manager trait contract and session-level data model (§4.3, §6.1).

use async_trait::async_trait;
use galaxy_common::error::Result;
use galaxy_common::types::{DeviceId, DeviceStatus, TaskFailure};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub endpoint: String,
    pub status: DeviceStatus,
    pub capabilities: HashSet<String>,
    pub os: Option<String>,
    pub dispatched_count: u64,
    pub last_heartbeat_ms: Option<i64>,
    /// Set while `status == Busy`; the task currently bound to this device (I4).
    pub current_task_id: Option<String>,
    pub reconnect_attempts: u32,
    pub max_retries: u32,
}

impl DeviceRecord {
    pub fn matches(&self, required: &HashSet<String>, os: &Option<String>) -> bool {
        required.is_subset(&self.capabilities)
            && os.as_ref().map_or(true, |want| self.os.as_deref() == Some(want.as_str()))
    }
}

/// AIP envelope header shared by every message exchanged with a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub message_id: String,
    pub timestamp: i64,
}

/// Agent Interaction Protocol: JSON-over-persistent-session wire format
/// exchanged between the orchestrator and a device (§6.1). Variant names
/// track the wire `type` field via `#[serde(tag = "type")]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AipMessage {
    /// device -> orch, first frame on a new session.
    Register {
        #[serde(flatten)]
        header: MessageHeader,
        device_id: String,
        capabilities: Vec<String>,
        os: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    /// orch -> device, response to `register`.
    RegisterAck {
        #[serde(flatten)]
        header: MessageHeader,
        accepted: bool,
        reason: Option<String>,
    },
    /// orch -> device: execute this task.
    #[serde(rename = "task_dispatch")]
    Dispatch {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
        goal: String,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    },
    /// device -> orch: work on `task_id` has begun.
    TaskAccept {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
    },
    /// device -> orch: optional telemetry, not a status transition.
    TaskProgress {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
        progress: serde_json::Value,
    },
    /// device -> orch: terminal success.
    #[serde(rename = "task_completed")]
    Result {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
        result: serde_json::Value,
    },
    /// device -> orch: terminal failure.
    #[serde(rename = "task_failed")]
    Failure {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
        error: TaskFailure,
    },
    /// orch -> device: request cancellation.
    #[serde(rename = "task_cancel")]
    Cancel {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
    },
    /// device -> orch: acknowledges cancellation.
    #[serde(rename = "task_cancelled")]
    Cancelled {
        #[serde(flatten)]
        header: MessageHeader,
        task_id: String,
    },
    Heartbeat {
        #[serde(flatten)]
        header: MessageHeader,
        load: Option<f64>,
    },
    HeartbeatAck {
        #[serde(flatten)]
        header: MessageHeader,
    },
    /// protocol-level error, either direction.
    Error {
        #[serde(flatten)]
        header: MessageHeader,
        code: String,
        message: String,
    },
}

#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Registers a device endpoint and begins dialing it; returns once the
    /// connection attempt has been scheduled (not necessarily connected).
    async fn register(&self, record: DeviceRecord) -> Result<()>;

    /// Sends a task to a connected device's persistent session.
    async fn dispatch(
        &self,
        device_id: &DeviceId,
        task_id: &str,
        goal: &str,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Result<()>;

    /// Requests cancellation of an in-flight task on a device.
    async fn cancel(&self, device_id: &DeviceId, task_id: &str) -> Result<()>;

    async fn get(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>>;

    /// Devices whose capability set and OS (if specified) satisfy the
    /// requirement, ordered by ascending `dispatched_count` for
    /// least-loaded tie-break.
    async fn candidates(&self, required: &HashSet<String>, os: &Option<String>) -> Result<Vec<DeviceRecord>>;

    fn connected_count(&self) -> usize;
}
