//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CONNECTION_REFERENCES, CONNECT_FAILURES_TOTAL, FRAMES_DROPPED_TOTAL, FRAMES_RECEIVED_TOTAL,
    LINKS_OPENED_TOTAL, RECONNECT_ATTEMPTS_TOTAL, TOPICS_ACTIVE, WIRE_SUBSCRIPTIONS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording link lifecycle metrics
pub struct LinkMetrics;

impl LinkMetrics {
    pub fn record_opened() {
        LINKS_OPENED_TOTAL.inc();
    }

    pub fn record_failure() {
        CONNECT_FAILURES_TOTAL.inc();
    }

    pub fn record_reconnect_scheduled() {
        RECONNECT_ATTEMPTS_TOTAL.inc();
    }

    pub fn set_references(count: u32) {
        CONNECTION_REFERENCES.set(count as i64);
    }
}

/// Helper struct for recording inbound frame metrics
pub struct FrameMetrics;

impl FrameMetrics {
    pub fn record_received() {
        FRAMES_RECEIVED_TOTAL.inc();
    }

    /// Payload was not valid JSON
    pub fn record_decode_failure() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["decode"]).inc();
    }

    /// Subscription id did not match the topic's current handle
    pub fn record_stale() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["stale"]).inc();
    }

    /// No topic registered for the frame
    pub fn record_unrouted() {
        FRAMES_DROPPED_TOTAL.with_label_values(&["unrouted"]).inc();
    }
}

/// Helper struct for recording subscription metrics
pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    pub fn record_subscribe() {
        WIRE_SUBSCRIPTIONS_TOTAL.with_label_values(&["subscribe"]).inc();
    }

    pub fn record_unsubscribe() {
        WIRE_SUBSCRIPTIONS_TOTAL.with_label_values(&["unsubscribe"]).inc();
    }

    pub fn set_active_topics(count: usize) {
        TOPICS_ACTIVE.set(count as i64);
    }
}
