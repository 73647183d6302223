//! `DeviceManager` implementation: one persistent session per device,
//! tracked in an independently-locked concurrent map (§4.3).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::instrument;

use galaxy_common::error::{Error, Result};
use galaxy_common::types::DeviceId;
use galaxy_core::device::{AipMessage, DeviceManager, DeviceRecord};
use galaxy_core::event::EventBus;

use crate::protocol::cancel_message;
use crate::session::{self, SessionConfig};

struct DeviceHandle {
    outbound: mpsc::UnboundedSender<AipMessage>,
    record: Arc<Mutex<DeviceRecord>>,
}

pub struct DeviceManagerImpl {
    devices: DashMap<DeviceId, DeviceHandle>,
    event_bus: Arc<dyn EventBus>,
    heartbeat_interval_ms: u64,
    reconnect_delay_ms: u64,
    heartbeat_expiry_multiplier: u32,
}

impl DeviceManagerImpl {
    pub fn new(
        event_bus: Arc<dyn EventBus>,
        heartbeat_interval_ms: u64,
        reconnect_delay_ms: u64,
        heartbeat_expiry_multiplier: u32,
    ) -> Self {
        Self {
            devices: DashMap::new(),
            event_bus,
            heartbeat_interval_ms,
            reconnect_delay_ms,
            heartbeat_expiry_multiplier,
        }
    }
}

#[async_trait]
impl DeviceManager for DeviceManagerImpl {
    #[instrument(skip(self, record), fields(device_id = %record.id))]
    async fn register(&self, record: DeviceRecord) -> Result<()> {
        let device_id = record.id.clone();
        let endpoint = record.endpoint.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared_record = Arc::new(Mutex::new(record));

        self.devices.insert(
            device_id.clone(),
            DeviceHandle {
                outbound: tx,
                record: shared_record.clone(),
            },
        );

        let config = SessionConfig {
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            reconnect_delay_ms: self.reconnect_delay_ms,
            heartbeat_expiry_multiplier: self.heartbeat_expiry_multiplier,
        };
        let event_bus = self.event_bus.clone();
        tokio::spawn(session::run(
            device_id,
            endpoint,
            config,
            rx,
            event_bus,
            shared_record,
        ));

        Ok(())
    }

    async fn dispatch(
        &self,
        device_id: &DeviceId,
        task_id: &str,
        goal: &str,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let handle = self
            .devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;

        // Assignment lock (I4): at most one task may be bound to a device
        // at a time. Checked and set atomically under the device's own
        // lock so a racing completion can't leave current_task_id
        // inconsistent with what was actually dispatched.
        {
            let mut record = handle.record.lock();
            if record.status != galaxy_common::types::DeviceStatus::Connected {
                return Err(Error::DeviceNotConnected(device_id.to_string()));
            }
            if record.current_task_id.is_some() {
                return Err(Error::DeviceBusy(device_id.to_string()));
            }
            record.current_task_id = Some(task_id.to_string());
            record.status = galaxy_common::types::DeviceStatus::Busy;
            record.dispatched_count += 1;
        }

        handle
            .outbound
            .send(crate::protocol::dispatch_message_with_timeout(
                task_id, goal, payload, timeout_ms,
            ))
            .map_err(|_| Error::DeviceLost(device_id.to_string()))
    }

    async fn cancel(&self, device_id: &DeviceId, task_id: &str) -> Result<()> {
        let handle = self
            .devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        handle
            .outbound
            .send(cancel_message(task_id))
            .map_err(|_| Error::DeviceLost(device_id.to_string()))
    }

    async fn get(&self, device_id: &DeviceId) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.get(device_id).map(|h| h.record.lock().clone()))
    }

    async fn candidates(
        &self,
        required: &HashSet<String>,
        os: &Option<String>,
    ) -> Result<Vec<DeviceRecord>> {
        let mut candidates: Vec<DeviceRecord> = self
            .devices
            .iter()
            .map(|entry| entry.record.lock().clone())
            .filter(|record| {
                record.status == galaxy_common::types::DeviceStatus::Connected
                    && record.matches(required, os)
            })
            .collect();
        candidates.sort_by_key(|r| r.dispatched_count);
        Ok(candidates)
    }

    fn connected_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|entry| entry.record.lock().status == galaxy_common::types::DeviceStatus::Connected)
            .count()
    }
}
