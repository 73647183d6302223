//! Layered configuration for the constellation core (§6.2).

use crate::error::{Error, Result};
use secrecy::Secret;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceSpec {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,
    #[serde(default = "default_device_max_retries")]
    pub max_retries: u32,
}

fn default_auto_connect() -> bool {
    true
}

fn default_device_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannerSpec {
    pub endpoint: String,
    #[serde(default = "default_planner_model")]
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<Secret<String>>,
}

fn default_planner_model() -> String {
    "planner-default".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_constellation_id")]
    pub constellation_id: String,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_expiry_multiplier")]
    pub heartbeat_expiry_multiplier: u32,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_max_step")]
    pub max_step: u32,

    #[serde(default = "default_max_planner_retries")]
    pub max_planner_retries: u32,

    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    pub planner: PlannerSpec,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_constellation_id() -> String {
    "default".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_expiry_multiplier() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_concurrent_tasks() -> usize {
    6
}

fn default_max_step() -> u32 {
    15
}

fn default_max_planner_retries() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            constellation_id: default_constellation_id(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_expiry_multiplier: default_heartbeat_expiry_multiplier(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_step: default_max_step(),
            max_planner_retries: default_max_planner_retries(),
            devices: Vec::new(),
            planner: PlannerSpec {
                endpoint: String::new(),
                model: default_planner_model(),
                api_key: None,
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration by layering defaults, an optional `config.toml`
    /// in the working directory, and `GALAXY_`-prefixed environment overrides.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("GALAXY")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw = builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.constellation_id.is_empty() {
            return Err(Error::Config("constellation_id must not be empty".into()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(Error::Config("max_concurrent_tasks must be >= 1".into()));
        }
        if self.max_step == 0 {
            return Err(Error::Config("max_step must be >= 1".into()));
        }
        if self.planner.endpoint.is_empty() {
            return Err(Error::Config("planner.endpoint must be set".into()));
        }
        for device in &self.devices {
            if device.id.is_empty() || device.endpoint.is_empty() {
                return Err(Error::Config(
                    "device entries require both id and endpoint".into(),
                ));
            }
        }
        Ok(())
    }
}
