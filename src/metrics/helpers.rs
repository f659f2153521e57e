//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKEND_ERRORS_TOTAL, BACKEND_OPERATION_LATENCY, CLAIM_ERRORS_TOTAL,
    DUPLICATES_SUPPRESSED_TOTAL, EMPTY_POLLS_TOTAL, EXPIRED_SWEPT_TOTAL, LEASES_RECLAIMED_TOTAL,
    MESSAGES_ACKED_TOTAL, MESSAGES_CLAIMED_TOTAL, MESSAGES_REJECTED_TOTAL, MESSAGES_SENT_TOTAL,
    SWEEP_ERRORS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for send, claim and settlement metrics
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_sent(backend: &str) {
        MESSAGES_SENT_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_duplicate(backend: &str) {
        DUPLICATES_SUPPRESSED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_claimed(backend: &str) {
        MESSAGES_CLAIMED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_empty_poll(backend: &str) {
        EMPTY_POLLS_TOTAL.with_label_values(&[backend]).inc();
    }

    /// Record a claim failure, absorbed (`retryable`) or escalated
    pub fn record_claim_error(backend: &str, retryable: bool) {
        let class = if retryable { "retryable" } else { "fatal" };
        CLAIM_ERRORS_TOTAL.with_label_values(&[backend, class]).inc();
    }

    pub fn record_acked(backend: &str) {
        MESSAGES_ACKED_TOTAL.with_label_values(&[backend]).inc();
    }

    pub fn record_rejected(backend: &str) {
        MESSAGES_REJECTED_TOTAL.with_label_values(&[backend]).inc();
    }
}

/// Helper struct for maintenance sweep metrics
pub struct SweepMetrics;

impl SweepMetrics {
    pub fn record_expired(backend: &str, count: u64) {
        EXPIRED_SWEPT_TOTAL.with_label_values(&[backend]).inc_by(count);
    }

    pub fn record_reclaimed(backend: &str, count: u64) {
        LEASES_RECLAIMED_TOTAL.with_label_values(&[backend]).inc_by(count);
    }

    pub fn record_error(backend: &str, sweep: &str) {
        SWEEP_ERRORS_TOTAL.with_label_values(&[backend, sweep]).inc();
    }
}

/// Helper struct for backend metrics
pub struct BackendMetrics;

impl BackendMetrics {
    /// Record backend operation latency
    pub fn record_latency(backend: &str, operation: &str, latency_secs: f64) {
        BACKEND_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(latency_secs);
    }

    /// Record backend error
    pub fn record_error(backend: &str, operation: &str) {
        BACKEND_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }
}
