//! Top-level run loop: decomposes a request, dispatches ready work, and
//! re-plans as results and failures arrive (§4.5).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use galaxy_common::error::Result;
use galaxy_common::types::{ConstellationState, EdgeCondition, FailureKind, TaskFailure, TaskStarId, TaskStatus};
use galaxy_core::constellation::{Constellation, ConstellationSnapshot, EditBatch, GraphEdit, TaskStar};
use galaxy_core::device::DeviceManager;
use galaxy_core::event::{Event, EventBus};
use galaxy_core::planner::{PlannerAdapter, ReplanContext};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::scheduler::ExecutionScheduler;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_tasks: usize,
    pub max_step: u32,
    pub max_planner_retries: u32,
    /// How often the run loop checks running tasks against their
    /// per-node `timeout_ms` (§4.4 step 5, §5 timers).
    pub timeout_check_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 6,
            max_step: 15,
            max_planner_retries: 3,
            timeout_check_interval_ms: 1_000,
        }
    }
}

/// A persistable record of a constellation run, suitable for audit or
/// resuming a session later (§6.3).
#[derive(Debug, Clone, Serialize)]
pub struct SessionDump {
    pub constellation_id: String,
    pub state: ConstellationState,
    pub step: u32,
    pub tasks: Vec<TaskStar>,
}

enum ReplanOutcome {
    Continue(u32),
    Deadlocked(SessionDump),
}

pub struct ConstellationOrchestrator {
    constellation: Arc<dyn Constellation>,
    event_bus: Arc<dyn EventBus>,
    device_manager: Arc<dyn DeviceManager>,
    planner: Arc<dyn PlannerAdapter>,
    scheduler: ExecutionScheduler,
    config: OrchestratorConfig,
    terminal_seen: DashMap<TaskStarId, ()>,
}

impl ConstellationOrchestrator {
    pub fn new(
        constellation: Arc<dyn Constellation>,
        event_bus: Arc<dyn EventBus>,
        device_manager: Arc<dyn DeviceManager>,
        planner: Arc<dyn PlannerAdapter>,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = ExecutionScheduler::new(
            constellation.clone(),
            device_manager.clone(),
            event_bus.clone(),
            config.max_concurrent_tasks,
        );
        Self {
            constellation,
            event_bus,
            device_manager,
            planner,
            scheduler,
            config,
            terminal_seen: DashMap::new(),
        }
    }

    /// Decomposes `goal` into an initial DAG and drives it to completion,
    /// dispatching ready work as it becomes available and consulting the
    /// planner again whenever progress stalls with unfinished tasks.
    #[instrument(skip(self, goal))]
    pub async fn run(&self, goal: &str) -> Result<SessionDump> {
        // Subscribe before the first commit so no completion/failure event
        // published as a side effect of the initial dispatch is missed.
        // The run loop reacts to every kind (completion, failure, device
        // connect, revision commit), so it subscribes unfiltered.
        let mut subscription = self.event_bus.subscribe(None);

        let dag = self.planner.create(goal).await?;
        let initial = dag
            .tasks
            .into_iter()
            .fold(EditBatch::new(), |batch, spec| batch.push(GraphEdit::AddTask(spec)))
            .push(GraphEdit::SetState {
                state: ConstellationState::Executing,
            });
        self.commit(initial).await?;

        let mut planner_retries = 0u32;

        loop {
            if self.constellation.current_step() > self.config.max_step {
                warn!(step = self.constellation.current_step(), "max_step exceeded");
                self.constellation
                    .batch(EditBatch::new().push(GraphEdit::SetState {
                        state: ConstellationState::Failed,
                    }))
                    .await?;
                self.event_bus
                    .publish(Event::ConstellationFailed {
                        reason: "max_step exceeded".to_string(),
                    })
                    .await?;
                return self.dump_session().await;
            }

            let snapshot = self.constellation.snapshot().await?;
            if snapshot.tasks.iter().all(|t| t.status.is_terminal()) {
                info!("all tasks reached a terminal status");
                self.constellation
                    .batch(EditBatch::new().push(GraphEdit::SetState {
                        state: ConstellationState::Completed,
                    }))
                    .await?;
                self.event_bus.publish(Event::ConstellationCompleted).await?;
                return self.dump_session().await;
            }

            let event = tokio::select! {
                biased;
                recv = subscription.recv() => match recv? {
                    Some(event) => event,
                    None => return self.dump_session().await,
                },
                _ = tokio::time::sleep(Duration::from_millis(self.config.timeout_check_interval_ms)) => {
                    self.check_timeouts().await?;
                    continue;
                }
            };

            match &event {
                Event::TaskCompleted { id, result } => {
                    self.handle_completion(id, result.clone()).await?;
                }
                Event::TaskFailed { id, failure } => {
                    self.handle_failure(id, failure.clone()).await?;
                }
                Event::DeviceConnected { .. } | Event::RevisionCommitted { .. } => {
                    self.scheduler.dispatch_ready().await?;
                }
                _ => {}
            }

            if matches!(event, Event::TaskCompleted { .. } | Event::TaskFailed { .. }) {
                match self.maybe_replan(goal, planner_retries).await? {
                    ReplanOutcome::Continue(retries) => planner_retries = retries,
                    ReplanOutcome::Deadlocked(dump) => return Ok(dump),
                }
            }
        }
    }

    /// Cancels and fails any `running` task whose `timeout_ms` has elapsed
    /// (§4.4 step 5). Timeout is measured against `started_at`, stamped by
    /// `ConstellationEngine` when a node transitions to `running`.
    async fn check_timeouts(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let snapshot = self.constellation.snapshot().await?;
        for task in snapshot.tasks {
            if task.status != TaskStatus::Running {
                continue;
            }
            let (Some(timeout_ms), Some(started_at)) = (task.timeout_ms, task.started_at) else {
                continue;
            };
            if now - started_at < timeout_ms as i64 {
                continue;
            }
            warn!(task = %task.id, "task exceeded its timeout_ms");
            if let Some(device_id) = &task.assigned_device {
                let _ = self.device_manager.cancel(device_id, task.id.as_str()).await;
            }
            self.handle_failure(
                &task.id,
                TaskFailure::new(FailureKind::Timeout, "task exceeded timeout_ms"),
            )
            .await?;
        }
        Ok(())
    }


    async fn commit(&self, batch: EditBatch) -> Result<()> {
        let edits = batch.edits.len();
        self.constellation.batch(batch).await?;
        let step = self.constellation.current_step();
        self.event_bus
            .publish(Event::RevisionCommitted { step, edits })
            .await?;
        self.scheduler.dispatch_ready().await?;
        Ok(())
    }

    async fn handle_completion(&self, id: &TaskStarId, result: serde_json::Value) -> Result<()> {
        if self.terminal_seen.contains_key(id) {
            return Ok(());
        }
        self.terminal_seen.insert(id.clone(), ());
        self.scheduler.release(id);
        self.constellation
            .batch(EditBatch::new().push(GraphEdit::SetResult {
                id: id.clone(),
                result,
            }))
            .await?;
        self.cascade_dead_edges().await?;
        self.scheduler.dispatch_ready().await?;
        Ok(())
    }

    /// Terminal failure policy (§4.4 failure handling): retry while
    /// `attempt+1 <= max_attempts`; otherwise leave the node `failed` and
    /// cascade `skipped` down every `on_success` dependent (its
    /// `on_failure` dependents become ready on their own via the
    /// readiness predicate once this node's status is `failed`).
    async fn handle_failure(&self, id: &TaskStarId, failure: TaskFailure) -> Result<()> {
        if self.terminal_seen.contains_key(id) {
            return Ok(());
        }
        self.terminal_seen.insert(id.clone(), ());
        self.scheduler.release(id);

        let task = self.constellation.get_task(id).await?;
        let can_retry = task
            .as_ref()
            .map(|t| t.attempt + 1 <= t.max_attempts)
            .unwrap_or(false);

        // Always commit the failure first so it is observable on the bus
        // and in any dump taken mid-retry (§8 scenario 3: failed is a real
        // transition the task passes through, not skipped).
        self.constellation
            .batch(EditBatch::new().push(GraphEdit::SetFailure {
                id: id.clone(),
                failure,
            }))
            .await?;

        if can_retry {
            self.constellation
                .batch(EditBatch::new().push(GraphEdit::Retry { id: id.clone() }))
                .await?;
            // A retried task must be observable as failed again later.
            self.terminal_seen.remove(id);
        } else {
            self.cascade_dead_edges().await?;
        }
        self.scheduler.dispatch_ready().await?;
        Ok(())
    }

    /// Marks `skipped` every still-`pending` task with a dependency edge
    /// that can now never be satisfied: an `on_success` edge to a
    /// failed/cancelled/skipped predecessor, or an `on_failure` edge to a
    /// completed one (§4.4). Iterates to a fixed point since skipping one
    /// task can in turn starve its own dependents, in either direction.
    async fn cascade_dead_edges(&self) -> Result<()> {
        loop {
            let snapshot = self.constellation.snapshot().await?;
            let outcome = |id: &TaskStarId| {
                snapshot.tasks.iter().find(|t| &t.id == id).and_then(|t| match t.status {
                    TaskStatus::Completed => Some(true),
                    TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped => Some(false),
                    _ => None,
                })
            };

            let dead: Vec<TaskStarId> = snapshot
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending)
                .filter(|t| {
                    t.depends_on.iter().any(|line| match outcome(&line.from) {
                        Some(succeeded) => match line.condition {
                            EdgeCondition::Always => false,
                            EdgeCondition::OnSuccess => !succeeded,
                            EdgeCondition::OnFailure => succeeded,
                        },
                        None => false,
                    })
                })
                .map(|t| t.id.clone())
                .collect();

            if dead.is_empty() {
                return Ok(());
            }
            let batch = dead
                .into_iter()
                .fold(EditBatch::new(), |batch, id| batch.push(GraphEdit::Skip { id }));
            self.commit(batch).await?;
        }
    }

    /// Asks the planner for more work when no task is ready but the
    /// constellation is not yet finished. Bounded by `max_planner_retries`
    /// so a planner that never produces useful edits cannot stall forever;
    /// once exhausted with nothing ready or running, the constellation is
    /// declared deadlocked (§4.4 termination detection).
    async fn maybe_replan(&self, goal: &str, planner_retries: u32) -> Result<ReplanOutcome> {
        let snapshot = self.constellation.snapshot().await?;
        if snapshot.tasks.iter().all(|t| t.status.is_terminal()) {
            return Ok(ReplanOutcome::Continue(planner_retries));
        }
        let ready = self.constellation.ready_tasks().await?;
        let running = snapshot.tasks.iter().any(|t| t.status == TaskStatus::Running);
        if !ready.is_empty() || running {
            return Ok(ReplanOutcome::Continue(planner_retries));
        }

        if planner_retries >= self.config.max_planner_retries {
            warn!("no task ready or running and planner exhausted; constellation deadlocked");
            self.constellation
                .batch(EditBatch::new().push(GraphEdit::SetState {
                    state: ConstellationState::Failed,
                }))
                .await?;
            self.event_bus
                .publish(Event::ConstellationFailed {
                    reason: "deadlock".to_string(),
                })
                .await?;
            return Ok(ReplanOutcome::Deadlocked(self.dump_session().await?));
        }

        let context = ReplanContext {
            goal: goal.to_string(),
            step: snapshot.step,
            completed: snapshot
                .tasks
                .iter()
                .filter_map(|t| t.result.clone().map(|r| (t.id.to_string(), r)))
                .collect(),
            failed: snapshot
                .tasks
                .iter()
                .filter_map(|t| t.error.clone().map(|f| (t.id.to_string(), f)))
                .collect(),
        };

        let batch = self.planner.edit(context).await?;
        if batch.edits.is_empty() {
            return Ok(ReplanOutcome::Continue(planner_retries + 1));
        }

        self.event_bus
            .publish(Event::ReplanRequested {
                reason: "no ready tasks remain with work still outstanding".to_string(),
            })
            .await?;
        self.commit(batch).await?;
        Ok(ReplanOutcome::Continue(planner_retries + 1))
    }

    pub async fn dump_session(&self) -> Result<SessionDump> {
        let snapshot: ConstellationSnapshot = self.constellation.snapshot().await?;
        Ok(SessionDump {
            constellation_id: snapshot.constellation_id,
            state: snapshot.state,
            step: snapshot.step,
            tasks: snapshot.tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use galaxy_common::types::{DeviceBinding, DeviceId, DeviceStatus, Metadata, TaskKind};
    use galaxy_constellation::ConstellationEngine;
    use galaxy_core::constellation::TaskStarSpec;
    use galaxy_core::device::DeviceRecord;
    use galaxy_core::planner::DagSpec;
    use galaxy_eventbus::InMemoryEventBus;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A device manager with a single always-connected device that "runs"
    /// a task by immediately publishing a completion event back.
    struct InstantDeviceManager {
        event_bus: Arc<dyn EventBus>,
        device: DeviceRecord,
    }

    #[async_trait]
    impl DeviceManager for InstantDeviceManager {
        async fn register(&self, _record: DeviceRecord) -> Result<()> {
            Ok(())
        }

        async fn dispatch(
            &self,
            _device_id: &DeviceId,
            task_id: &str,
            _goal: &str,
            _payload: serde_json::Value,
            _timeout_ms: Option<u64>,
        ) -> Result<()> {
            self.event_bus
                .publish(Event::TaskCompleted {
                    id: TaskStarId::new(task_id),
                    result: serde_json::json!({"ok": true}),
                })
                .await
        }

        async fn cancel(&self, _device_id: &DeviceId, _task_id: &str) -> Result<()> {
            Ok(())
        }

        async fn get(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>> {
            if device_id == &self.device.id {
                Ok(Some(self.device.clone()))
            } else {
                Ok(None)
            }
        }

        async fn candidates(
            &self,
            _required: &HashSet<String>,
            _os: &Option<String>,
        ) -> Result<Vec<DeviceRecord>> {
            Ok(vec![self.device.clone()])
        }

        fn connected_count(&self) -> usize {
            1
        }
    }

    /// A planner that hands back a fixed two-task DAG once and never has
    /// further edits to offer.
    struct FixedPlanner {
        created: AtomicBool,
    }

    #[async_trait]
    impl PlannerAdapter for FixedPlanner {
        async fn create(&self, _goal: &str) -> Result<DagSpec> {
            self.created.store(true, Ordering::SeqCst);
            Ok(DagSpec {
                tasks: vec![
                    TaskStarSpec {
                        id: TaskStarId::new("a"),
                        kind: TaskKind::Task,
                        goal: "step a".to_string(),
                        device_binding: DeviceBinding::Capability {
                            required: HashSet::new(),
                            os: None,
                        },
                        depends_on: vec![],
                        metadata: Metadata::new(),
                        max_attempts: 1,
                        timeout_ms: None,
                    },
                    TaskStarSpec {
                        id: TaskStarId::new("b"),
                        kind: TaskKind::Task,
                        goal: "step b".to_string(),
                        device_binding: DeviceBinding::Capability {
                            required: HashSet::new(),
                            os: None,
                        },
                        depends_on: vec![],
                        metadata: Metadata::new(),
                        max_attempts: 1,
                        timeout_ms: None,
                    },
                ],
            })
        }

        async fn edit(&self, _context: ReplanContext) -> Result<EditBatch> {
            Ok(EditBatch::new())
        }
    }

    #[tokio::test]
    async fn drives_independent_tasks_to_completion() {
        let constellation: Arc<dyn Constellation> = Arc::new(ConstellationEngine::new("t1"));
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let device_manager: Arc<dyn DeviceManager> = Arc::new(InstantDeviceManager {
            event_bus: event_bus.clone(),
            device: DeviceRecord {
                id: DeviceId::new("dev1"),
                endpoint: "ws://localhost/dev1".to_string(),
                status: DeviceStatus::Connected,
                capabilities: HashSet::new(),
                os: None,
                dispatched_count: 0,
                last_heartbeat_ms: None,
                current_task_id: None,
                reconnect_attempts: 0,
                max_retries: 5,
            },
        });
        let planner: Arc<dyn PlannerAdapter> = Arc::new(FixedPlanner {
            created: AtomicBool::new(false),
        });

        let orchestrator = ConstellationOrchestrator::new(
            constellation,
            event_bus,
            device_manager,
            planner,
            OrchestratorConfig::default(),
        );

        let dump = orchestrator.run("do the thing").await.unwrap();
        assert_eq!(dump.state, ConstellationState::Completed);
        assert_eq!(dump.tasks.len(), 2);
        assert!(dump.tasks.iter().all(|t| t.status.is_terminal()));
    }

    fn test_device() -> DeviceRecord {
        DeviceRecord {
            id: DeviceId::new("dev1"),
            endpoint: "ws://localhost/dev1".to_string(),
            status: DeviceStatus::Connected,
            capabilities: HashSet::new(),
            os: None,
            dispatched_count: 0,
            last_heartbeat_ms: None,
            current_task_id: None,
            reconnect_attempts: 0,
            max_retries: 5,
        }
    }

    fn single_task_spec(id: &str, max_attempts: u32) -> TaskStarSpec {
        TaskStarSpec {
            id: TaskStarId::new(id),
            kind: TaskKind::Task,
            goal: format!("do {id}"),
            device_binding: DeviceBinding::Capability {
                required: HashSet::new(),
                os: None,
            },
            depends_on: vec![],
            metadata: Metadata::new(),
            max_attempts,
            timeout_ms: None,
        }
    }

    /// Fails task "a"'s first dispatch and succeeds on every dispatch
    /// thereafter, driven by an attempt counter keyed on the task id.
    struct FlakyOnceDeviceManager {
        event_bus: Arc<dyn EventBus>,
        device: DeviceRecord,
        attempts: DashMap<String, u32>,
    }

    #[async_trait]
    impl DeviceManager for FlakyOnceDeviceManager {
        async fn register(&self, _record: DeviceRecord) -> Result<()> {
            Ok(())
        }

        async fn dispatch(
            &self,
            _device_id: &DeviceId,
            task_id: &str,
            _goal: &str,
            _payload: serde_json::Value,
            _timeout_ms: Option<u64>,
        ) -> Result<()> {
            let attempt = {
                let mut entry = self.attempts.entry(task_id.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            if attempt == 1 {
                self.event_bus
                    .publish(Event::TaskFailed {
                        id: TaskStarId::new(task_id),
                        failure: galaxy_common::types::TaskFailure::new(
                            galaxy_common::types::FailureKind::ExecutionError,
                            "flaky failure",
                        ),
                    })
                    .await
            } else {
                self.event_bus
                    .publish(Event::TaskCompleted {
                        id: TaskStarId::new(task_id),
                        result: serde_json::json!({"ok": true}),
                    })
                    .await
            }
        }

        async fn cancel(&self, _device_id: &DeviceId, _task_id: &str) -> Result<()> {
            Ok(())
        }

        async fn get(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>> {
            if device_id == &self.device.id {
                Ok(Some(self.device.clone()))
            } else {
                Ok(None)
            }
        }

        async fn candidates(
            &self,
            _required: &HashSet<String>,
            _os: &Option<String>,
        ) -> Result<Vec<DeviceRecord>> {
            Ok(vec![self.device.clone()])
        }

        fn connected_count(&self) -> usize {
            1
        }
    }

    /// Fails every dispatched task, unconditionally.
    struct AlwaysFailsDeviceManager {
        event_bus: Arc<dyn EventBus>,
        device: DeviceRecord,
    }

    #[async_trait]
    impl DeviceManager for AlwaysFailsDeviceManager {
        async fn register(&self, _record: DeviceRecord) -> Result<()> {
            Ok(())
        }

        async fn dispatch(
            &self,
            _device_id: &DeviceId,
            task_id: &str,
            _goal: &str,
            _payload: serde_json::Value,
            _timeout_ms: Option<u64>,
        ) -> Result<()> {
            self.event_bus
                .publish(Event::TaskFailed {
                    id: TaskStarId::new(task_id),
                    failure: galaxy_common::types::TaskFailure::new(
                        galaxy_common::types::FailureKind::ExecutionError,
                        "permanent failure",
                    ),
                })
                .await
        }

        async fn cancel(&self, _device_id: &DeviceId, _task_id: &str) -> Result<()> {
            Ok(())
        }

        async fn get(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>> {
            if device_id == &self.device.id {
                Ok(Some(self.device.clone()))
            } else {
                Ok(None)
            }
        }

        async fn candidates(
            &self,
            _required: &HashSet<String>,
            _os: &Option<String>,
        ) -> Result<Vec<DeviceRecord>> {
            Ok(vec![self.device.clone()])
        }

        fn connected_count(&self) -> usize {
            1
        }
    }

    /// A planner whose `edit` is never observed to matter because `create`
    /// hands back a DAG whose second task has an `on_failure` edge to a
    /// first task that's always going to succeed/fail as scripted by the
    /// device manager under test.
    struct TwoTaskPlanner {
        first_condition: galaxy_common::types::EdgeCondition,
    }

    #[async_trait]
    impl PlannerAdapter for TwoTaskPlanner {
        async fn create(&self, _goal: &str) -> Result<DagSpec> {
            let mut b = single_task_spec("b", 1);
            b.depends_on = vec![galaxy_core::constellation::TaskStarLine {
                from: TaskStarId::new("a"),
                condition: self.first_condition,
            }];
            Ok(DagSpec {
                tasks: vec![single_task_spec("a", 2), b],
            })
        }

        async fn edit(&self, _context: ReplanContext) -> Result<EditBatch> {
            Ok(EditBatch::new())
        }
    }

    #[tokio::test]
    async fn retries_a_failed_task_until_it_succeeds() {
        let constellation: Arc<dyn Constellation> = Arc::new(ConstellationEngine::new("t1"));
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let device_manager: Arc<dyn DeviceManager> = Arc::new(FlakyOnceDeviceManager {
            event_bus: event_bus.clone(),
            device: test_device(),
            attempts: DashMap::new(),
        });
        let planner: Arc<dyn PlannerAdapter> = Arc::new(TwoTaskPlanner {
            first_condition: galaxy_common::types::EdgeCondition::OnSuccess,
        });

        let orchestrator = ConstellationOrchestrator::new(
            constellation,
            event_bus,
            device_manager,
            planner,
            OrchestratorConfig::default(),
        );

        let dump = orchestrator.run("do the thing").await.unwrap();
        assert_eq!(dump.state, ConstellationState::Completed);
        let a = dump.tasks.iter().find(|t| t.id == TaskStarId::new("a")).unwrap();
        assert_eq!(a.status, TaskStatus::Completed);
        assert_eq!(a.attempt, 1);
        let b = dump.tasks.iter().find(|t| t.id == TaskStarId::new("b")).unwrap();
        assert_eq!(b.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn permanent_failure_cascades_a_skip_to_its_on_success_dependent() {
        let constellation: Arc<dyn Constellation> = Arc::new(ConstellationEngine::new("t1"));
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let device_manager: Arc<dyn DeviceManager> = Arc::new(AlwaysFailsDeviceManager {
            event_bus: event_bus.clone(),
            device: test_device(),
        });
        let planner: Arc<dyn PlannerAdapter> = Arc::new(TwoTaskPlanner {
            first_condition: galaxy_common::types::EdgeCondition::OnSuccess,
        });

        let orchestrator = ConstellationOrchestrator::new(
            constellation,
            event_bus,
            device_manager,
            planner,
            OrchestratorConfig::default(),
        );

        let dump = orchestrator.run("do the thing").await.unwrap();
        let a = dump.tasks.iter().find(|t| t.id == TaskStarId::new("a")).unwrap();
        assert_eq!(a.status, TaskStatus::Failed);
        let b = dump.tasks.iter().find(|t| t.id == TaskStarId::new("b")).unwrap();
        assert_eq!(b.status, TaskStatus::Skipped);
        assert_eq!(dump.state, ConstellationState::Completed);
    }

    #[tokio::test]
    async fn an_untaken_on_failure_branch_is_skipped_so_the_run_completes() {
        // `b` only runs if `a` fails; `a` always succeeds here, so `b`'s
        // branch is permanently dead and must be skipped rather than
        // leaving the constellation stuck forever.
        struct AlwaysSucceedsDeviceManager {
            event_bus: Arc<dyn EventBus>,
            device: DeviceRecord,
        }

        #[async_trait]
        impl DeviceManager for AlwaysSucceedsDeviceManager {
            async fn register(&self, _record: DeviceRecord) -> Result<()> {
                Ok(())
            }
            async fn dispatch(
                &self,
                _device_id: &DeviceId,
                task_id: &str,
                _goal: &str,
                _payload: serde_json::Value,
                _timeout_ms: Option<u64>,
            ) -> Result<()> {
                self.event_bus
                    .publish(Event::TaskCompleted {
                        id: TaskStarId::new(task_id),
                        result: serde_json::json!({"ok": true}),
                    })
                    .await
            }
            async fn cancel(&self, _device_id: &DeviceId, _task_id: &str) -> Result<()> {
                Ok(())
            }
            async fn get(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>> {
                if device_id == &self.device.id {
                    Ok(Some(self.device.clone()))
                } else {
                    Ok(None)
                }
            }
            async fn candidates(
                &self,
                _required: &HashSet<String>,
                _os: &Option<String>,
            ) -> Result<Vec<DeviceRecord>> {
                Ok(vec![self.device.clone()])
            }
            fn connected_count(&self) -> usize {
                1
            }
        }

        let constellation: Arc<dyn Constellation> = Arc::new(ConstellationEngine::new("t1"));
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let device_manager: Arc<dyn DeviceManager> = Arc::new(AlwaysSucceedsDeviceManager {
            event_bus: event_bus.clone(),
            device: test_device(),
        });
        let planner: Arc<dyn PlannerAdapter> = Arc::new(TwoTaskPlanner {
            first_condition: galaxy_common::types::EdgeCondition::OnFailure,
        });

        let orchestrator = ConstellationOrchestrator::new(
            constellation,
            event_bus,
            device_manager,
            planner,
            OrchestratorConfig::default(),
        );

        let dump = orchestrator.run("do the thing").await.unwrap();
        let a = dump.tasks.iter().find(|t| t.id == TaskStarId::new("a")).unwrap();
        assert_eq!(a.status, TaskStatus::Completed);
        let b = dump.tasks.iter().find(|t| t.id == TaskStarId::new("b")).unwrap();
        assert_eq!(b.status, TaskStatus::Skipped);
        assert_eq!(dump.state, ConstellationState::Completed);
    }

    #[tokio::test]
    async fn declares_deadlock_when_a_dependency_can_never_resolve_and_planner_is_exhausted() {
        struct NoDeviceManager;

        #[async_trait]
        impl DeviceManager for NoDeviceManager {
            async fn register(&self, _record: DeviceRecord) -> Result<()> {
                Ok(())
            }
            async fn dispatch(
                &self,
                _device_id: &DeviceId,
                _task_id: &str,
                _goal: &str,
                _payload: serde_json::Value,
                _timeout_ms: Option<u64>,
            ) -> Result<()> {
                unreachable!("no candidate device is ever offered")
            }
            async fn cancel(&self, _device_id: &DeviceId, _task_id: &str) -> Result<()> {
                Ok(())
            }
            async fn get(&self, _device_id: &DeviceId) -> Result<Option<DeviceRecord>> {
                Ok(None)
            }
            async fn candidates(
                &self,
                _required: &HashSet<String>,
                _os: &Option<String>,
            ) -> Result<Vec<DeviceRecord>> {
                Ok(vec![])
            }
            fn connected_count(&self) -> usize {
                0
            }
        }

        struct EmptyEditPlanner;

        #[async_trait]
        impl PlannerAdapter for EmptyEditPlanner {
            async fn create(&self, _goal: &str) -> Result<DagSpec> {
                // "b" depends on a predecessor that is never added to the
                // constellation, so it can never become ready: there is no
                // id for `is_ready`'s completion lookup to resolve, ever.
                let mut b = single_task_spec("b", 1);
                b.depends_on = vec![galaxy_core::constellation::TaskStarLine {
                    from: TaskStarId::new("ghost"),
                    condition: galaxy_common::types::EdgeCondition::OnSuccess,
                }];
                Ok(DagSpec { tasks: vec![b] })
            }

            async fn edit(&self, _context: ReplanContext) -> Result<EditBatch> {
                Ok(EditBatch::new())
            }
        }

        let constellation: Arc<dyn Constellation> = Arc::new(ConstellationEngine::new("t1"));
        let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let device_manager: Arc<dyn DeviceManager> = Arc::new(NoDeviceManager);
        let planner: Arc<dyn PlannerAdapter> = Arc::new(EmptyEditPlanner);

        let orchestrator = ConstellationOrchestrator::new(
            constellation.clone(),
            event_bus,
            device_manager,
            planner,
            OrchestratorConfig::default(),
        );

        let dag = orchestrator.planner.create("do the thing").await.unwrap();
        let initial = dag
            .tasks
            .into_iter()
            .fold(EditBatch::new(), |batch, spec| batch.push(GraphEdit::AddTask(spec)))
            .push(GraphEdit::SetState {
                state: ConstellationState::Executing,
            });
        constellation.batch(initial).await.unwrap();

        // "b" never becomes ready and nothing is running, so `maybe_replan`
        // must exhaust the planner's retry budget and declare deadlock
        // rather than spin forever.
        let mut retries = 0;
        loop {
            match orchestrator.maybe_replan("do the thing", retries).await.unwrap() {
                ReplanOutcome::Continue(next) => {
                    assert!(next > retries, "replan must make progress toward the retry budget");
                    retries = next;
                }
                ReplanOutcome::Deadlocked(dump) => {
                    assert_eq!(dump.state, ConstellationState::Failed);
                    return;
                }
            }
        }
    }
}
