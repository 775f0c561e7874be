//! Prometheus metrics for the lease engine
//!
//! All collectors live in the default registry; [`render`] produces the text
//! exposition format for whatever HTTP surface the embedding process offers.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec,
    Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Lease Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Terminal leases by outcome.
    ///
    /// Labels:
    /// - outcome: "success", "failed", "timed_out", "cancelled"
    pub static ref LEASES_TOTAL: CounterVec = register_counter_vec!(
        "leasevisor_leases_total",
        "Leases that reached a terminal outcome",
        &["outcome"]
    ).expect("failed to register LEASES_TOTAL metric");

    /// Wall-clock time from slot assignment to release, by outcome.
    pub static ref LEASE_DURATION: HistogramVec = register_histogram_vec!(
        "leasevisor_lease_duration_seconds",
        "Time from slot assignment to slot release",
        &["outcome"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 3600.0]
    ).expect("failed to register LEASE_DURATION metric");

    /// Time spent in each lease phase.
    ///
    /// Labels:
    /// - phase: "provisioning", "setting_up", "running", "cleaning_up"
    pub static ref PHASE_DURATION: HistogramVec = register_histogram_vec!(
        "leasevisor_phase_duration_seconds",
        "Time spent in each lease phase",
        &["phase"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]
    ).expect("failed to register PHASE_DURATION metric");

    /// Leases currently holding a slot.
    pub static ref LEASES_IN_FLIGHT: Gauge = register_gauge!(
        "leasevisor_leases_in_flight",
        "Leases currently bound to a slot"
    ).expect("failed to register LEASES_IN_FLIGHT metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Pool & Admission Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Slots per lifecycle state.
    ///
    /// Labels:
    /// - state: "cold", "idle", "leased", "quarantined", "recreating", "held", "retired"
    pub static ref SLOTS: GaugeVec = register_gauge_vec!(
        "leasevisor_slots",
        "Pool slots per lifecycle state",
        &["state"]
    ).expect("failed to register SLOTS metric");

    /// Time callers waited for an admission permit.
    pub static ref ADMISSION_WAIT: Histogram = register_histogram!(
        "leasevisor_admission_wait_seconds",
        "Time spent waiting for an admission permit",
        vec![0.001, 0.01, 0.1, 1.0, 5.0, 30.0, 120.0]
    ).expect("failed to register ADMISSION_WAIT metric");

    /// Submissions rejected because the pool was saturated.
    pub static ref ADMISSION_REJECTED: Counter = register_counter!(
        "leasevisor_admission_rejected_total",
        "Submissions rejected with Busy"
    ).expect("failed to register ADMISSION_REJECTED metric");

    /// Time to bring a slot to ready (fresh launch or resume).
    ///
    /// Labels:
    /// - kind: "fresh", "resume", "start", "warm"
    pub static ref PROVISION_DURATION: HistogramVec = register_histogram_vec!(
        "leasevisor_provision_duration_seconds",
        "Time to bring a slot's VM to ready",
        &["kind"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 180.0]
    ).expect("failed to register PROVISION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Failure Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Cleanup attempts that failed (snapshot restore, stop, delete).
    pub static ref CLEANUP_FAILURES: Counter = register_counter!(
        "leasevisor_cleanup_failures_total",
        "Failed cleanup attempts"
    ).expect("failed to register CLEANUP_FAILURES metric");

    /// Slots removed from the pool for good after repeated failures.
    pub static ref SLOTS_RETIRED: Counter = register_counter!(
        "leasevisor_slots_retired_total",
        "Slots permanently removed after quarantine exhaustion"
    ).expect("failed to register SLOTS_RETIRED metric");

    /// Remote-shell connection attempts that were retried.
    pub static ref CONNECT_RETRIES: Counter = register_counter!(
        "leasevisor_connect_retries_total",
        "Remote-shell connection attempts retried"
    ).expect("failed to register CONNECT_RETRIES metric");
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
