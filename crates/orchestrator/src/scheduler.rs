//! Event-driven dispatch of ready TaskStars onto devices (§4.4).

use std::sync::Arc;

use dashmap::DashMap;
use galaxy_common::error::Result;
use galaxy_common::types::{DeviceBinding, TaskStarId, TaskStatus};
use galaxy_core::constellation::{Constellation, EditBatch, GraphEdit, TaskStar};
use galaxy_core::device::{DeviceManager, DeviceRecord};
use galaxy_core::event::{Event, EventBus};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

pub struct ExecutionScheduler {
    constellation: Arc<dyn Constellation>,
    device_manager: Arc<dyn DeviceManager>,
    event_bus: Arc<dyn EventBus>,
    semaphore: Arc<Semaphore>,
    dispatched: DashMap<TaskStarId, ()>,
    permits: DashMap<TaskStarId, OwnedSemaphorePermit>,
}

impl ExecutionScheduler {
    pub fn new(
        constellation: Arc<dyn Constellation>,
        device_manager: Arc<dyn DeviceManager>,
        event_bus: Arc<dyn EventBus>,
        max_concurrent_tasks: usize,
    ) -> Self {
        Self {
            constellation,
            device_manager,
            event_bus,
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks)),
            dispatched: DashMap::new(),
            permits: DashMap::new(),
        }
    }

    /// Scans for ready TaskStars not yet dispatched and assigns each to a
    /// device, bounded by the available concurrency permits. Tasks with no
    /// currently-matching device are left ready and retried on the next
    /// trigger (e.g. a future `device_connected` event).
    #[instrument(skip(self))]
    pub async fn dispatch_ready(&self) -> Result<()> {
        let ready = self.constellation.ready_tasks().await?;
        for task in ready {
            if self.dispatched.contains_key(&task.id) {
                continue;
            }
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("at max concurrency, deferring remaining ready tasks");
                    break;
                }
            };

            let device = match self.select_device(&task).await? {
                Some(device) => device,
                None => {
                    drop(permit);
                    continue;
                }
            };

            self.dispatched.insert(task.id.clone(), ());
            self.permits.insert(task.id.clone(), permit);

            self.constellation
                .batch(
                    EditBatch::new()
                        .push(GraphEdit::AssignDevice {
                            id: task.id.clone(),
                            device_id: device.id.clone(),
                        })
                        .push(GraphEdit::SetStatus {
                            id: task.id.clone(),
                            status: TaskStatus::Running,
                        }),
                )
                .await?;

            if let Err(e) = self
                .device_manager
                .dispatch(
                    &device.id,
                    task.id.as_str(),
                    &task.goal,
                    serde_json::to_value(&task.metadata).unwrap_or(serde_json::Value::Null),
                    task.timeout_ms,
                )
                .await
            {
                warn!(task = %task.id, device = %device.id, error = %e, "dispatch failed, rolling back to pending");
                self.release(&task.id);
                // DeviceBusy/DeviceNotConnected: undo the running transition
                // so the node is re-offered by `ready_tasks()` on the next
                // wake instead of being stranded `running` with no device
                // actually executing it (§4.4 step 4).
                let _ = self
                    .constellation
                    .batch(
                        EditBatch::new()
                            .push(GraphEdit::SetStatus {
                                id: task.id.clone(),
                                status: TaskStatus::Pending,
                            })
                            .push(GraphEdit::ClearAssignment { id: task.id.clone() }),
                    )
                    .await;
                continue;
            }

            self.event_bus
                .publish(Event::TaskDispatched {
                    id: task.id.clone(),
                    device_id: device.id.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Releases the concurrency permit held for a task once it reaches a
    /// terminal status, freeing a slot for the next ready task.
    pub fn release(&self, task_id: &TaskStarId) {
        self.dispatched.remove(task_id);
        self.permits.remove(task_id);
    }

    /// Device tie-break: an explicit binding is authoritative; a capability
    /// binding picks the least-loaded match, falling back to lexicographic
    /// device id order for a stable choice among equally-loaded devices.
    async fn select_device(&self, task: &TaskStar) -> Result<Option<DeviceRecord>> {
        match &task.device_binding {
            DeviceBinding::Explicit { device_id } => {
                match self.device_manager.get(device_id).await? {
                    Some(record)
                        if record.status == galaxy_common::types::DeviceStatus::Connected =>
                    {
                        Ok(Some(record))
                    }
                    _ => Ok(None),
                }
            }
            DeviceBinding::Capability { required, os } => {
                let mut candidates = self.device_manager.candidates(required, os).await?;
                candidates.sort_by(|a, b| {
                    a.dispatched_count
                        .cmp(&b.dispatched_count)
                        .then_with(|| a.id.as_str().cmp(b.id.as_str()))
                });
                Ok(candidates.into_iter().next())
            }
        }
    }
}
