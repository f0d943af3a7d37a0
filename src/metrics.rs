//metrics.rs
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
};

lazy_static! {
    // Hub
    pub static ref ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(Opts::new(
        "hub_active_connections",
        "Number of authenticated device sockets"
    ))
    .unwrap();

    pub static ref FRAMES_SENT: IntCounter = register_int_counter!(Opts::new(
        "hub_frames_sent_total",
        "Total number of frames pushed to device sockets"
    ))
    .unwrap();

    pub static ref SLOW_CONSUMER_DROPS: IntCounter = register_int_counter!(Opts::new(
        "hub_slow_consumer_drops_total",
        "Connections dropped because their outbound buffer overflowed"
    ))
    .unwrap();

    pub static ref AUTH_FAILURES: IntCounter = register_int_counter!(Opts::new(
        "hub_auth_failures_total",
        "Socket authentication failures"
    ))
    .unwrap();

    // Bus and offline queue
    pub static ref EVENTS_PUBLISHED: IntCounter = register_int_counter!(Opts::new(
        "bus_events_published_total",
        "Total number of sync events published"
    ))
    .unwrap();

    pub static ref OFFLINE_ENQUEUED: IntCounter = register_int_counter!(Opts::new(
        "offline_messages_enqueued_total",
        "Total number of events queued for offline devices"
    ))
    .unwrap();

    pub static ref OFFLINE_DRAINED: IntCounter = register_int_counter!(Opts::new(
        "offline_messages_drained_total",
        "Total number of queued events delivered on reconnect"
    ))
    .unwrap();

    // Processor
    pub static ref ACTIONS_APPLIED: IntCounterVec = register_int_counter_vec!(
        Opts::new("actions_applied_total", "Notification actions applied"),
        &["action"]
    )
    .unwrap();

    pub static ref ACTIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        Opts::new("actions_rejected_total", "Notification actions rejected"),
        &["reason"]
    )
    .unwrap();

    pub static ref NOTIFICATIONS_CREATED: IntCounter = register_int_counter!(Opts::new(
        "notifications_created_total",
        "Total number of notifications created"
    ))
    .unwrap();

    pub static ref EDIT_CONFLICTS: IntCounter = register_int_counter!(Opts::new(
        "notification_edit_conflicts_total",
        "Edits answered with conflict = true"
    ))
    .unwrap();

    pub static ref ACTION_PROCESSING_TIME: Histogram = register_histogram!(
        HistogramOpts::new(
            "action_processing_time_seconds",
            "Time taken to apply a notification action"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])
    )
    .unwrap();

    // Maintenance
    pub static ref EXPIRED_DELETED: IntCounter = register_int_counter!(Opts::new(
        "expired_notifications_deleted_total",
        "Notifications hard-deleted after expiry"
    ))
    .unwrap();
}

pub fn metrics_handler() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return format!("Error encoding metrics: {}", e);
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(e) => format!("Error converting metrics to string: {}", e),
    }
}
