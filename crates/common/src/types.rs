//! Wire-level and cross-crate shared types for the constellation core.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Generic metadata bag attached to tasks, devices, and planner payloads.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Stable identifier for a TaskStar, unique within a constellation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskStarId(pub String);

impl TaskStarId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskStarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskStarId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskStarId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User-supplied identifier for a registered device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of a TaskStar node (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Task,
    Diagnostic,
    Sentinel,
}

/// TaskStar status lattice (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    /// Terminal statuses never regress (I3).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }
}

/// Edge condition governing readiness release (§3.1, §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    OnSuccess,
    OnFailure,
}

/// Device binding: either a concrete device or a capability predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceBinding {
    Explicit { device_id: DeviceId },
    Capability {
        required: HashSet<String>,
        os: Option<String>,
    },
}

impl DeviceBinding {
    /// `create_node` rejects an `Explicit` binding with an unset device id
    /// as `InvalidSpec` (§4.1). A `Capability` predicate with an empty
    /// required set is a deliberate "any connected device" binding, not
    /// an empty one.
    pub fn is_empty(&self) -> bool {
        match self {
            DeviceBinding::Explicit { device_id } => device_id.as_str().is_empty(),
            DeviceBinding::Capability { .. } => false,
        }
    }
}

/// Structured failure reason carried by a `task_failed` event or TaskStar.error (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    DeviceLost,
    DeviceRejected,
    ExecutionError,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }
}

/// Overall constellation lifecycle state (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstellationState {
    Draft,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// Device session status (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Registered,
    Connecting,
    Connected,
    Busy,
    Disconnected,
    Failed,
}
