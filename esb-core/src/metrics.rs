//! Service bus metrics

use crate::circuit_breaker::CircuitState;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};

lazy_static::lazy_static! {
    /// Routed messages by target service and outcome (`delivered`,
    /// `unavailable`, `transformation_failed`, `delivery_failed`)
    pub static ref ESB_ROUTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "esb_routed_messages_total",
        "Messages routed by the service bus",
        &["service", "outcome"]
    )
    .expect("esb_routed_messages_total registers once");

    /// Time spent in breaker-wrapped endpoint delivery, per service
    pub static ref ESB_DELIVERY_DURATION: HistogramVec = register_histogram_vec!(
        "esb_delivery_duration_seconds",
        "Endpoint delivery duration",
        &["service"]
    )
    .expect("esb_delivery_duration_seconds registers once");

    /// Live dead-letter entries per service, archived ones included
    pub static ref DLQ_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "esb_dead_letter_size",
        "Dead-letter entries per service",
        &["service"]
    )
    .expect("esb_dead_letter_size registers once");

    /// Breaker state per service, see [`CircuitState::as_metric_value`]
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        "esb_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)",
        &["service"]
    )
    .expect("esb_circuit_breaker_state registers once");

    /// Transformations by source format, target format and status
    pub static ref TRANSFORMATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "esb_transformations_total",
        "Payload transformations",
        &["source", "target", "status"]
    )
    .expect("esb_transformations_total registers once");
}

pub(crate) fn set_breaker_state(service: &str, state: CircuitState) {
    CIRCUIT_BREAKER_STATE
        .with_label_values(&[service])
        .set(state.as_metric_value());
}

pub(crate) fn record_route(service: &str, outcome: &str) {
    ESB_ROUTED_TOTAL.with_label_values(&[service, outcome]).inc();
}

pub(crate) fn set_dlq_size(service: &str, size: usize) {
    DLQ_SIZE
        .with_label_values(&[service])
        .set(i64::try_from(size).unwrap_or(i64::MAX));
}

pub(crate) fn record_transformation(source: &str, target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    TRANSFORMATIONS_TOTAL
        .with_label_values(&[source, target, status])
        .inc();
}
