//! Galaxy CLI: submit a request to a fresh constellation and print the
//! resulting session dump, or inspect a previously dumped session.

use std::fs;
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
use galaxy_orchestrator::{ConstellationOrchestrator, OrchestratorConfig, SessionDump};
use galaxy_planner::HttpPlannerAdapter;

#[tokio::main]
async fn main() -> Result<()> {
    let app = Command::new("galaxy-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Galaxy Team")
        .about("Galaxy constellation orchestration CLI")
        .subcommand(Command::new("status").about("Show the loaded configuration"))
        .subcommand(
            Command::new("submit")
                .about("Decompose a request into a constellation and run it to completion")
                .arg(
                    Arg::new("goal")
                        .required(true)
                        .help("Natural-language request to decompose and execute"),
                ),
        )
        .subcommand(
            Command::new("tasks")
                .about("List task statuses from a previously dumped session")
                .arg(
                    Arg::new("dump_file")
                        .required(true)
                        .help("Path to a session dump JSON file"),
                ),
        );

    let matches = app.get_matches();
    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    galaxy_common::telemetry::init_telemetry(
        &config.observability.log_level,
        config.observability.log_format,
    )
    .context("failed to initialize telemetry")?;

    match matches.subcommand() {
        Some(("status", _)) => {
            println!("constellation_id: {}", config.constellation_id);
            println!("devices configured: {}", config.devices.len());
            println!("max_concurrent_tasks: {}", config.max_concurrent_tasks);
            println!("max_step: {}", config.max_step);
        }
        Some(("submit", sub)) => {
            let goal = sub.get_one::<String>("goal").expect("required");
            let dump = run_constellation(&config, goal).await?;
            println!("{}", serde_json::to_string_pretty(&dump)?);
        }
        Some(("tasks", sub)) => {
            let path = sub.get_one::<String>("dump_file").expect("required");
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read dump file {path}"))?;
            let dump: SessionDump = serde_json::from_str(&contents)?;
            for task in dump.tasks {
                println!("{:<24} {:?}", task.id, task.status);
            }
        }
        _ => {
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

async fn run_constellation(config: &Config, goal: &str) -> Result<SessionDump> {
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

    Ok(orchestrator.run(goal).await?)
}
