//! Shared types, error taxonomy, configuration, telemetry, and metrics for
//! the constellation core.

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use error::{Error, Result, Severity};
pub use metrics::{DefaultMetricsCollector, MetricsCollector};
