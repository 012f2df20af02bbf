//! Prometheus metrics for the realtime client.
//!
//! - Link metrics (opens, connect failures, reconnect attempts)
//! - Frame metrics (received, dropped by reason)
//! - Subscription metrics (wire subscribes/unsubscribes, active topics)

mod helpers;

pub use helpers::{encode_metrics, FrameMetrics, LinkMetrics, SubscriptionMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "realtime";

lazy_static! {
    // ============================================================================
    // Link Metrics
    // ============================================================================

    pub static ref LINKS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_links_opened_total", METRIC_PREFIX),
        "Connections successfully established"
    ).unwrap();

    pub static ref CONNECT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connect_failures_total", METRIC_PREFIX),
        "Connect attempts that failed or links that dropped unexpectedly"
    ).unwrap();

    pub static ref RECONNECT_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnect_attempts_total", METRIC_PREFIX),
        "Scheduled reconnect attempts"
    ).unwrap();

    pub static ref CONNECTION_REFERENCES: IntGauge = register_int_gauge!(
        format!("{}_connection_references", METRIC_PREFIX),
        "Consumers currently holding the connection open"
    ).unwrap();

    // ============================================================================
    // Frame Metrics
    // ============================================================================

    pub static ref FRAMES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_frames_received_total", METRIC_PREFIX),
        "MESSAGE frames received from the server"
    ).unwrap();

    pub static ref FRAMES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_dropped_total", METRIC_PREFIX),
        "MESSAGE frames dropped before fan-out",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Subscription Metrics
    // ============================================================================

    pub static ref WIRE_SUBSCRIPTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_wire_subscriptions_total", METRIC_PREFIX),
        "SUBSCRIBE/UNSUBSCRIBE frames sent",
        &["op"]
    ).unwrap();

    pub static ref TOPICS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_topics_active", METRIC_PREFIX),
        "Topics with a live fan-out emitter"
    ).unwrap();
}
