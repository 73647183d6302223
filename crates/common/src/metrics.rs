//! Prometheus metrics for the constellation core.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

pub static EVENTS_PUBLISHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "galaxy_events_published_total",
        "Number of events published on the event bus, by event kind",
        &["kind"]
    )
    .expect("metric registration")
});

pub static SUBSCRIBER_LAG: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "galaxy_subscriber_lag_total",
        "Number of events dropped for a lagging subscriber",
        &["subscriber"]
    )
    .expect("metric registration")
});

pub static REVISIONS_COMMITTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "galaxy_revisions_committed_total",
        "Number of batch edits committed to a constellation graph",
        &["constellation_id"]
    )
    .expect("metric registration")
});

pub static BATCH_REJECTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "galaxy_batch_rejected_total",
        "Number of batch edits rejected for invariant violation",
        &["constellation_id"]
    )
    .expect("metric registration")
});

pub static TASKS_DISPATCHED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "galaxy_tasks_dispatched_total",
        "Number of tasks dispatched to a device",
        &["device_id"]
    )
    .expect("metric registration")
});

pub static TASK_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "galaxy_task_duration_seconds",
        "Wall-clock duration of a task from dispatch to terminal status",
        &["status"]
    )
    .expect("metric registration")
});

pub static DEVICES_CONNECTED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "galaxy_devices_connected",
        "Current number of connected devices",
        &["constellation_id"]
    )
    .expect("metric registration")
});

pub static ACTIVE_TASKS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "galaxy_active_tasks",
        "Current number of running tasks",
        &["constellation_id"]
    )
    .expect("metric registration")
});

/// Thin facade so callers don't reach directly into the static registry;
/// mirrors the teacher's `MetricsCollector` trait/impl split.
pub trait MetricsCollector: Send + Sync {
    fn record_event_published(&self, kind: &str);
    fn record_subscriber_lag(&self, subscriber: &str, dropped: u64);
    fn record_revision_committed(&self, constellation_id: &str);
    fn record_batch_rejected(&self, constellation_id: &str);
    fn record_task_dispatched(&self, device_id: &str);
    fn record_task_duration(&self, status: &str, seconds: f64);
    fn set_devices_connected(&self, constellation_id: &str, count: i64);
    fn set_active_tasks(&self, constellation_id: &str, count: i64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMetricsCollector;

impl MetricsCollector for DefaultMetricsCollector {
    fn record_event_published(&self, kind: &str) {
        EVENTS_PUBLISHED.with_label_values(&[kind]).inc();
    }

    fn record_subscriber_lag(&self, subscriber: &str, dropped: u64) {
        SUBSCRIBER_LAG
            .with_label_values(&[subscriber])
            .inc_by(dropped as f64);
    }

    fn record_revision_committed(&self, constellation_id: &str) {
        REVISIONS_COMMITTED
            .with_label_values(&[constellation_id])
            .inc();
    }

    fn record_batch_rejected(&self, constellation_id: &str) {
        BATCH_REJECTED.with_label_values(&[constellation_id]).inc();
    }

    fn record_task_dispatched(&self, device_id: &str) {
        TASKS_DISPATCHED.with_label_values(&[device_id]).inc();
    }

    fn record_task_duration(&self, status: &str, seconds: f64) {
        TASK_DURATION_SECONDS
            .with_label_values(&[status])
            .observe(seconds);
    }

    fn set_devices_connected(&self, constellation_id: &str, count: i64) {
        DEVICES_CONNECTED
            .with_label_values(&[constellation_id])
            .set(count as f64);
    }

    fn set_active_tasks(&self, constellation_id: &str, count: i64) {
        ACTIVE_TASKS
            .with_label_values(&[constellation_id])
            .set(count as f64);
    }
}
