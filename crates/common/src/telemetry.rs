//! Structured logging setup.
//!
//! The teacher's telemetry module layers an OpenTelemetry OTLP exporter under
//! tracing-subscriber; the constellation core has no collector to export to,
//! so this keeps the tracing-subscriber fmt + EnvFilter layer only.

use crate::config::LogFormat;
use crate::error::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_telemetry(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    let result = match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Pretty => subscriber.try_init(),
    };

    result.map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}

/// Emits a structured span-scoped event; mirrors the teacher's `log_event!` helper.
#[macro_export]
macro_rules! log_event {
    ($level:expr, $msg:expr $(, $key:ident = $value:expr)*) => {
        tracing::event!($level, $($key = ?$value,)* $msg);
    };
}

/// Emits a structured error event carrying the error's Display and severity.
#[macro_export]
macro_rules! log_error {
    ($err:expr $(, $key:ident = $value:expr)*) => {
        tracing::error!(error = %$err, severity = ?$err.severity(), $($key = ?$value,)*);
    };
}
