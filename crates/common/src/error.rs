//! Shared error taxonomy for the constellation core (§7).

use thiserror::Error;

/// Severity classification used by logging and metrics to triage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("task star not found: {0}")]
    TaskNotFound(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device {device_id} rejected task: {reason}")]
    DeviceRejected { device_id: String, reason: String },

    #[error("device {0} lost (heartbeat expired or connection closed)")]
    DeviceLost(String),

    #[error("device {0} is busy with another task")]
    DeviceBusy(String),

    #[error("device {0} is not connected")]
    DeviceNotConnected(String),

    #[error("task {0} timed out")]
    TaskTimeout(String),

    #[error("planner request failed: {0}")]
    Planner(String),

    #[error("planner returned a malformed or cyclic dag: {0}")]
    PlannerDag(String),

    #[error("protocol error decoding AIP message: {0}")]
    Protocol(String),

    #[error("cycle detected in constellation graph")]
    CycleDetected,

    #[error("batch edit rejected: {0}")]
    BatchRejected(String),

    #[error("subscriber lagged, {0} events dropped")]
    SubscriberLagged(u64),

    #[error("timeout waiting on {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry of the originating operation is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DeviceLost(_)
                | Error::DeviceNotConnected(_)
                | Error::TaskTimeout(_)
                | Error::Timeout(_)
                | Error::Network(_)
                | Error::Planner(_)
        )
    }

    pub fn severity(&self) -> Severity {
        match self {
            Error::CycleDetected | Error::Invariant(_) | Error::BatchRejected(_) => {
                Severity::Critical
            }
            Error::DeviceLost(_)
                | Error::DeviceRejected { .. }
                | Error::DeviceBusy(_)
                | Error::DeviceNotConnected(_)
                | Error::TaskTimeout(_)
                | Error::Timeout(_)
                | Error::PlannerDag(_) => Severity::Error,
            Error::SubscriberLagged(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
