//! External planner boundary trait contract (§4.6).

use crate::constellation::{EditBatch, TaskStarSpec};
use async_trait::async_trait;
use galaxy_common::error::Result;
use galaxy_common::types::TaskFailure;
use serde::{Deserialize, Serialize};

/// Initial decomposition of a natural-language request into a DAG spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSpec {
    pub tasks: Vec<TaskStarSpec>,
}

/// Context handed to the planner when asking it to re-plan in response to
/// new results or failures (§4.6, §8 re-planning property).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanContext {
    pub goal: String,
    pub step: u32,
    pub completed: Vec<(String, serde_json::Value)>,
    pub failed: Vec<(String, TaskFailure)>,
}

#[async_trait]
pub trait PlannerAdapter: Send + Sync {
    /// Decomposes a natural-language request into an initial DAG.
    async fn create(&self, goal: &str) -> Result<DagSpec>;

    /// Given the current progress, proposes an edit batch: new tasks,
    /// status corrections, or additional edges. Returning an empty batch
    /// signals the planner has no further changes to make.
    async fn edit(&self, context: ReplanContext) -> Result<EditBatch>;
}
