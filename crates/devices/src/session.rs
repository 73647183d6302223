//! Per-device persistent session: connect, heartbeat, read, write, and
//! reconnect with a fixed backoff on loss (§4.3).

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

use galaxy_common::types::{DeviceId, DeviceStatus, FailureKind, TaskFailure};
use galaxy_core::device::{AipMessage, DeviceRecord};
use galaxy_core::event::{Event, EventBus};

use crate::protocol::{decode, encode, heartbeat_message};

pub struct SessionConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Session is considered expired after this many missed heartbeat
    /// intervals with no inbound frame of any kind (§4.3).
    pub heartbeat_expiry_multiplier: u32,
}

/// Runs for the lifetime of a registered device: dials `endpoint`,
/// multiplexes heartbeats, outbound dispatch/cancel traffic, and inbound
/// results, and on disconnect reconnects with backoff up to the device's
/// `max_retries`. Returns once `outbound` is closed (manager dropped) or
/// the retry budget is exhausted and the device is marked `failed`.
pub async fn run(
    device_id: DeviceId,
    endpoint: String,
    config: SessionConfig,
    mut outbound: mpsc::UnboundedReceiver<AipMessage>,
    event_bus: Arc<dyn EventBus>,
    record: Arc<Mutex<DeviceRecord>>,
) {
    let expiry = Duration::from_millis(
        config.heartbeat_interval_ms * config.heartbeat_expiry_multiplier as u64,
    );
    let mut surfaced_loss = true;

    loop {
        record.lock().status = DeviceStatus::Connecting;
        match connect_async(&endpoint).await {
            Ok((ws_stream, _response)) => {
                record.lock().reconnect_attempts = 0;
                record.lock().status = DeviceStatus::Connected;
                surfaced_loss = false;
                info!(device = %device_id, "device session established");
                let _ = event_bus
                    .publish(Event::DeviceConnected {
                        device_id: device_id.clone(),
                    })
                    .await;

                let (mut sink, mut stream) = ws_stream.split();
                let mut heartbeat =
                    tokio::time::interval(Duration::from_millis(config.heartbeat_interval_ms));
                let mut last_inbound = Instant::now();

                loop {
                    if last_inbound.elapsed() > expiry {
                        warn!(device = %device_id, "heartbeat expired, tearing down session");
                        break;
                    }
                    tokio::select! {
                        _ = heartbeat.tick() => {
                            if let Ok(msg) = encode(&heartbeat_message()) {
                                if sink.send(msg).await.is_err() {
                                    break;
                                }
                            }
                        }
                        outgoing = outbound.recv() => {
                            match outgoing {
                                Some(msg) => match encode(&msg) {
                                    Ok(ws_msg) => {
                                        if sink.send(ws_msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "failed to encode outbound message"),
                                },
                                None => return,
                            }
                        }
                        incoming = stream.next() => {
                            match incoming {
                                Some(Ok(ws_msg)) => match decode(ws_msg) {
                                    Ok(Some(parsed)) => {
                                        last_inbound = Instant::now();
                                        handle_incoming(&device_id, parsed, &event_bus, &record).await;
                                    }
                                    Ok(None) => {}
                                    Err(e) => warn!(device = %device_id, error = %e, "failed to decode device message"),
                                },
                                Some(Err(e)) => {
                                    warn!(device = %device_id, error = %e, "device session error");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "failed to connect to device");
            }
        }

        let bound_task = record.lock().current_task_id.clone();
        record.lock().status = DeviceStatus::Disconnected;
        let _ = event_bus
            .publish(Event::DeviceLost {
                device_id: device_id.clone(),
            })
            .await;

        let attempts = {
            let mut r = record.lock();
            r.reconnect_attempts += 1;
            r.reconnect_attempts
        };

        // The first loss gets a clean reconnect_delay grace window before a
        // bound task is declared lost (§4.3 "reconnects inside the window,
        // session resumes"); every loss thereafter is already past that
        // window, so surface the failure immediately (idempotent: only
        // surfaced once per binding via `surfaced_loss`).
        if attempts > 1 && !surfaced_loss {
            if let Some(task_id) = bound_task {
                record.lock().current_task_id = None;
                let _ = event_bus
                    .publish(Event::TaskFailed {
                        id: task_id.into(),
                        failure: TaskFailure::new(FailureKind::DeviceLost, "device session lost"),
                    })
                    .await;
            }
            surfaced_loss = true;
        }

        let max_retries = record.lock().max_retries;
        if attempts > max_retries {
            warn!(device = %device_id, attempts, "exceeded max_retries, giving up");
            record.lock().status = DeviceStatus::Failed;
            if let Some(task_id) = record.lock().current_task_id.take() {
                let _ = event_bus
                    .publish(Event::TaskFailed {
                        id: task_id.into(),
                        failure: TaskFailure::new(
                            FailureKind::DeviceLost,
                            "device exceeded reconnect budget",
                        ),
                    })
                    .await;
            }
            return;
        }

        let backoff = config.reconnect_delay_ms.saturating_mul(attempts as u64).min(60_000);
        tokio::time::sleep(Duration::from_millis(backoff)).await;
    }
}

async fn handle_incoming(
    device_id: &DeviceId,
    message: AipMessage,
    event_bus: &Arc<dyn EventBus>,
    record: &Arc<Mutex<DeviceRecord>>,
) {
    let event = match message {
        AipMessage::Register { device_id: reported, capabilities, .. } => {
            info!(device = %device_id, reported, ?capabilities, "device (re)announced registration");
            None
        }
        AipMessage::Error { code, message, .. } => {
            warn!(device = %device_id, code, message, "protocol error from device");
            None
        }
        AipMessage::TaskAccept { task_id, .. } => {
            info!(device = %device_id, task = %task_id, "device accepted task");
            None
        }
        AipMessage::TaskProgress { task_id, progress, .. } => {
            info!(device = %device_id, task = %task_id, ?progress, "task progress");
            None
        }
        AipMessage::Result { task_id, result, .. } => {
            clear_binding(record, &task_id);
            Some(Event::TaskCompleted {
                id: task_id.into(),
                result,
            })
        }
        AipMessage::Failure { task_id, error, .. } => {
            clear_binding(record, &task_id);
            Some(Event::TaskFailed {
                id: task_id.into(),
                failure: error,
            })
        }
        AipMessage::Cancelled { task_id, .. } => {
            clear_binding(record, &task_id);
            Some(Event::TaskCancelled { id: task_id.into() })
        }
        AipMessage::Heartbeat { .. } | AipMessage::HeartbeatAck { .. } => {
            record.lock().last_heartbeat_ms = Some(chrono::Utc::now().timestamp_millis());
            None
        }
        other => {
            warn!(device = %device_id, ?other, "unexpected message from device");
            None
        }
    };
    if let Some(event) = event {
        let _ = event_bus.publish(event).await;
    }
}

/// Unbinds a device's `current_task_id` on a terminal inbound event,
/// returning it to `connected` (I4). Guarded by the same per-device lock
/// `dispatch` uses, and only clears when the ids match so a stale/duplicate
/// terminal frame for an already-superseded task can't race a fresh
/// assignment (§8 idempotence).
fn clear_binding(record: &Arc<Mutex<DeviceRecord>>, task_id: &str) {
    let mut r = record.lock();
    if r.current_task_id.as_deref() == Some(task_id) {
        r.current_task_id = None;
        if r.status == DeviceStatus::Busy {
            r.status = DeviceStatus::Connected;
        }
    }
}
