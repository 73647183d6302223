//! Trait contract and plain data model for the constellation graph (§3, §4.1).

use async_trait::async_trait;
use galaxy_common::error::Result;
use galaxy_common::types::{
    ConstellationState, DeviceBinding, DeviceId, EdgeCondition, Metadata, TaskFailure, TaskKind,
    TaskStarId, TaskStatus,
};
use serde::{Deserialize, Serialize};

/// A single node in the constellation DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStar {
    pub id: TaskStarId,
    pub kind: TaskKind,
    pub goal: String,
    pub status: TaskStatus,
    pub device_binding: DeviceBinding,
    pub assigned_device: Option<DeviceId>,
    pub depends_on: Vec<TaskStarLine>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub metadata: Metadata,
    pub step_created: u32,
    /// Monotonically increasing retry counter, starts at 0 (§3.1).
    pub attempt: u32,
    /// Upper bound on `attempt`, from the planner; default 1 (no retry).
    pub max_attempts: u32,
    /// Per-node override of the scheduler's timeout (§4.4 step 5).
    pub timeout_ms: Option<u64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TaskStar {
    /// `status_of` reports the current terminal status of a predecessor, or
    /// `None` if it hasn't reached one yet. Per the readiness predicate
    /// (§4.1): `always` releases on `{completed, failed, skipped}`,
    /// `on_success` only on `completed`, `on_failure` only on `failed` —
    /// `cancelled` releases neither, so a cancelled predecessor leaves a
    /// dependent permanently pending rather than silently unblocking it.
    pub fn is_ready(&self, status_of: impl Fn(&TaskStarId) -> Option<TaskStatus>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.depends_on.iter().all(|line| match status_of(&line.from) {
            Some(status) => match line.condition {
                EdgeCondition::Always => matches!(
                    status,
                    TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
                ),
                EdgeCondition::OnSuccess => status == TaskStatus::Completed,
                EdgeCondition::OnFailure => status == TaskStatus::Failed,
            },
            None => false,
        })
    }
}

/// A dependency edge: this TaskStar depends on `from` under `condition`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStarLine {
    pub from: TaskStarId,
    pub condition: EdgeCondition,
}

/// Declarative spec for creating a new TaskStar within a batch edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStarSpec {
    pub id: TaskStarId,
    pub kind: TaskKind,
    pub goal: String,
    pub device_binding: DeviceBinding,
    pub depends_on: Vec<TaskStarLine>,
    pub metadata: Metadata,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    1
}

/// A single mutation against the graph. `batch` applies a list of these
/// transactionally: all invariants (I1-I5) hold after every edit in the
/// batch or none of them are committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GraphEdit {
    AddTask(TaskStarSpec),
    RemoveTask(TaskStarId),
    SetStatus {
        id: TaskStarId,
        status: TaskStatus,
    },
    SetResult {
        id: TaskStarId,
        result: serde_json::Value,
    },
    SetFailure {
        id: TaskStarId,
        failure: TaskFailure,
    },
    AssignDevice {
        id: TaskStarId,
        device_id: DeviceId,
    },
    /// Clears a prior `AssignDevice`, used when a dispatch attempt fails
    /// and the node is rolled back to `pending` without ever having
    /// actually started on that device (§4.4 step 4).
    ClearAssignment {
        id: TaskStarId,
    },
    AddEdge {
        to: TaskStarId,
        edge: TaskStarLine,
    },
    SetState {
        state: ConstellationState,
    },
    /// Re-opens a `failed` task for another attempt: bumps `attempt`,
    /// resets status to `pending`, and clears the prior error/result/
    /// assignment. The only edit allowed to move a terminal `failed`
    /// task backwards in the lattice (§4.1).
    Retry {
        id: TaskStarId,
    },
    /// Marks a task `skipped` because an `on_success` predecessor it
    /// depended on will never complete (§4.4 failure handling).
    Skip {
        id: TaskStarId,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditBatch {
    pub edits: Vec<GraphEdit>,
}

impl EditBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, edit: GraphEdit) -> Self {
        self.edits.push(edit);
        self
    }
}

/// A lock-released point-in-time copy of the full graph, produced by
/// `Constellation::snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstellationSnapshot {
    pub constellation_id: String,
    pub state: ConstellationState,
    pub step: u32,
    pub tasks: Vec<TaskStar>,
}

#[async_trait]
pub trait Constellation: Send + Sync {
    /// Applies a batch of edits transactionally: staged against a working
    /// copy, invariants re-checked, committed atomically or rejected
    /// wholesale with no partial mutation visible to readers (I4).
    async fn batch(&self, batch: EditBatch) -> Result<()>;

    /// Point-in-time, lock-released copy of the full graph (I5).
    async fn snapshot(&self) -> Result<ConstellationSnapshot>;

    /// TaskStars whose dependency edges are all satisfied and are still
    /// `Pending`.
    async fn ready_tasks(&self) -> Result<Vec<TaskStar>>;

    async fn get_task(&self, id: &TaskStarId) -> Result<Option<TaskStar>>;

    fn state(&self) -> ConstellationState;

    fn current_step(&self) -> u32;

    fn advance_step(&self) -> u32;
}
