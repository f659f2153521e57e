//! Prometheus metrics for the leased queue.
//!
//! - Send metrics (inserted, duplicates suppressed)
//! - Claim metrics (claimed, empty polls, failures by class)
//! - Settlement metrics (acked, rejected)
//! - Maintenance metrics (expired records, reclaimed leases)
//! - Store operation latency

mod helpers;

pub use helpers::{encode_metrics, BackendMetrics, QueueMetrics, SweepMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "leaseq";

lazy_static! {
    // ============================================================================
    // Send Metrics
    // ============================================================================

    /// Messages inserted into a store
    pub static ref MESSAGES_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total messages inserted",
        &["backend"]
    ).unwrap();

    /// Sends skipped because an unleased message with the same key exists
    pub static ref DUPLICATES_SUPPRESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_duplicates_suppressed_total", METRIC_PREFIX),
        "Total sends suppressed by an existing uniqueness key",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Claim Metrics
    // ============================================================================

    /// Messages leased to a consumer
    pub static ref MESSAGES_CLAIMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_claimed_total", METRIC_PREFIX),
        "Total messages claimed",
        &["backend"]
    ).unwrap();

    /// Polls that claimed nothing
    pub static ref EMPTY_POLLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_empty_polls_total", METRIC_PREFIX),
        "Total polls that returned no message",
        &["backend"]
    ).unwrap();

    /// Claim failures (class = retryable | fatal)
    pub static ref CLAIM_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_claim_errors_total", METRIC_PREFIX),
        "Total claim failures by class",
        &["backend", "class"]
    ).unwrap();

    // ============================================================================
    // Settlement Metrics
    // ============================================================================

    pub static ref MESSAGES_ACKED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_acked_total", METRIC_PREFIX),
        "Total messages acknowledged",
        &["backend"]
    ).unwrap();

    pub static ref MESSAGES_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_rejected_total", METRIC_PREFIX),
        "Total messages rejected",
        &["backend"]
    ).unwrap();

    // ============================================================================
    // Maintenance Metrics
    // ============================================================================

    /// Records deleted because their TTL passed
    pub static ref EXPIRED_SWEPT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_expired_swept_total", METRIC_PREFIX),
        "Total expired records removed by the maintenance sweep",
        &["backend"]
    ).unwrap();

    /// Leases released after their redeliver deadline
    pub static ref LEASES_RECLAIMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_leases_reclaimed_total", METRIC_PREFIX),
        "Total timed-out leases released by the maintenance sweep",
        &["backend"]
    ).unwrap();

    /// Failed sweeps (sweep = expire | reclaim)
    pub static ref SWEEP_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_sweep_errors_total", METRIC_PREFIX),
        "Total failed maintenance sweeps",
        &["backend", "sweep"]
    ).unwrap();

    // ============================================================================
    // Backend Metrics
    // ============================================================================

    /// Store operation latency
    pub static ref BACKEND_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_backend_operation_latency_seconds", METRIC_PREFIX),
        "Store operation latency in seconds",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    /// Store operation failures
    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_backend_errors_total", METRIC_PREFIX),
        "Total store operation failures",
        &["backend", "operation"]
    ).unwrap();
}
