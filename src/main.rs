//! Galaxy daemon entry point: loads configuration, wires the constellation
//! core to its concrete implementations, and either runs a single goal to
//! completion or idles ready to accept work via future external collaborators
//! (a server API is out of scope for this core; see `galaxy-cli` for the
//! thin interactive shell).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use galaxy_common::Config;
use galaxy_common::types::{DeviceId, DeviceStatus};
use galaxy_constellation::ConstellationEngine;
use galaxy_core::constellation::Constellation;
use galaxy_core::device::{DeviceManager, DeviceRecord};
use galaxy_core::event::EventBus;
use galaxy_core::planner::PlannerAdapter;
use galaxy_devices::DeviceManagerImpl;
use galaxy_eventbus::InMemoryEventBus;
use galaxy_orchestrator::{ConstellationOrchestrator, OrchestratorConfig};
use galaxy_planner::HttpPlannerAdapter;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("galaxy")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Galaxy Team")
        .about("Constellation orchestration core for the Galaxy cross-device agent framework")
        .arg(
            Arg::new("goal")
                .long("goal")
                .help("Decompose and run this goal to completion, then exit"),
        )
        .get_matches();

    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    galaxy_common::telemetry::init_telemetry(
        &config.observability.log_level,
        config.observability.log_format,
    )
    .context("failed to initialize telemetry")?;

    info!(constellation_id = %config.constellation_id, "galaxy core initialized");

    let event_bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let constellation: Arc<dyn Constellation> =
        Arc::new(ConstellationEngine::new(config.constellation_id.clone()));
    let device_manager: Arc<dyn DeviceManager> = Arc::new(DeviceManagerImpl::new(
        event_bus.clone(),
        config.heartbeat_interval_ms,
        config.reconnect_delay_ms,
        config.heartbeat_expiry_multiplier,
    ));

    for device in &config.devices {
        if !device.auto_connect {
            continue;
        }
        device_manager
            .register(DeviceRecord {
                id: DeviceId::new(device.id.clone()),
                endpoint: device.endpoint.clone(),
                status: DeviceStatus::Registered,
                capabilities: device.capabilities.iter().cloned().collect(),
                os: device.os.clone(),
                dispatched_count: 0,
                last_heartbeat_ms: None,
                current_task_id: None,
                reconnect_attempts: 0,
                max_retries: device.max_retries,
            })
            .await?;
    }

    let planner: Arc<dyn PlannerAdapter> = Arc::new(HttpPlannerAdapter::new(
        config.planner.endpoint.clone(),
        config.planner.model.clone(),
        config.planner.api_key.clone(),
    ));

    let orchestrator = ConstellationOrchestrator::new(
        constellation,
        event_bus,
        device_manager,
        planner,
        OrchestratorConfig {
            max_concurrent_tasks: config.max_concurrent_tasks,
            max_step: config.max_step,
            max_planner_retries: config.max_planner_retries,
            ..OrchestratorConfig::default()
        },
    );

    match matches.get_one::<String>("goal") {
        Some(goal) => {
            let dump = orchestrator.run(goal).await?;
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
        None => {
            info!("no --goal given; idling until interrupted");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
        }
    }

    Ok(())
}
