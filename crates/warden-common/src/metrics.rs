//! Metrics registry for Warden observability
//!
//! Instruments are created lazily on the global meter, so they are no-ops
//! until telemetry installs an OTLP meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("warden"));

/// Histogram of ingress reconcile pass duration
///
/// Labels:
/// - `result`: success, error
pub static INGRESS_RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("warden_ingress_reconcile_duration_seconds")
        .with_description("Duration of ingress reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of merger decisions
///
/// Labels:
/// - `decision`: noop, create, patch, delete, await_deletion, leave_unowned
pub static INGRESS_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("warden_ingress_decisions_total")
        .with_description("Total number of ingress reconcile decisions by kind")
        .with_unit("{decisions}")
        .build()
});

/// Counter of ingress reconcile errors
///
/// Labels:
/// - `error_type`: transient, permanent
pub static INGRESS_RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("warden_ingress_reconcile_errors_total")
        .with_description("Total number of ingress reconcile errors")
        .with_unit("{errors}")
        .build()
});
