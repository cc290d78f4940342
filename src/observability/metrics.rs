//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `secret_sync_success_total{namespace,name}` - Successful passes per descriptor
//! - `secret_sync_failure_total{namespace,name,reason}` - Failed passes per descriptor
//! - `secret_sync_last_duration_seconds{namespace,name}` - Duration of the last pass per descriptor
//! - `secret_sync_reconciliation_duration_seconds` - Pass duration histogram
//! - `secret_sync_backend_health{backend,kind}` - 1 healthy, 0 unreachable, -1 unknown
//! - `secret_sync_backend_operations_total{kind,operation}` - Backend calls
//! - `secret_sync_backend_operation_duration_seconds{kind,operation}` - Backend call latency
//! - `secret_sync_backend_operation_errors_total{kind,reason}` - Failed backend calls
//! - `secret_sync_store_writes_total{operation}` - Writes to the destination store
//! - `secret_sync_coalesced_triggers_total` - Triggers skipped because a pass was queued or running
//! - `secret_sync_descriptors_managed` - Descriptors currently registered
//! - `secret_sync_watch_restarts_total{resource}` - Watch stream restarts

use crate::controller::descriptor::ObjectIdentity;
use crate::controller::reconciler::SyncError;
use crate::provider::{BackendId, BackendKind, HealthStatus};
use anyhow::Result;
use prometheus::{
    GaugeVec, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static SYNC_SUCCESS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_success_total",
            "Total number of successful reconciliation passes per descriptor",
        ),
        &["namespace", "name"],
    )
    .expect("Failed to create SYNC_SUCCESS_TOTAL metric - this should never happen")
});

static SYNC_FAILURE_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_failure_total",
            "Total number of failed reconciliation passes per descriptor",
        ),
        &["namespace", "name", "reason"],
    )
    .expect("Failed to create SYNC_FAILURE_TOTAL metric - this should never happen")
});

static LAST_SYNC_DURATION: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(
        prometheus::Opts::new(
            "secret_sync_last_duration_seconds",
            "Duration of the most recent reconciliation pass per descriptor",
        ),
        &["namespace", "name"],
    )
    .expect("Failed to create LAST_SYNC_DURATION metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "secret_sync_reconciliation_duration_seconds",
            "Duration of reconciliation passes in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static BACKEND_HEALTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "secret_sync_backend_health",
            "Backend health (1 healthy, 0 unreachable, -1 unknown)",
        ),
        &["backend", "kind"],
    )
    .expect("Failed to create BACKEND_HEALTH metric - this should never happen")
});

static BACKEND_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_backend_operations_total",
            "Total number of backend operations by backend kind",
        ),
        &["kind", "operation"],
    )
    .expect("Failed to create BACKEND_OPERATIONS_TOTAL metric - this should never happen")
});

static BACKEND_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "secret_sync_backend_operation_duration_seconds",
            "Duration of backend operations in seconds by backend kind",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["kind", "operation"],
    )
    .expect("Failed to create BACKEND_OPERATION_DURATION metric - this should never happen")
});

static BACKEND_OPERATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_backend_operation_errors_total",
            "Total number of failed backend operations by backend kind and reason",
        ),
        &["kind", "reason"],
    )
    .expect("Failed to create BACKEND_OPERATION_ERRORS_TOTAL metric - this should never happen")
});

static STORE_WRITES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_store_writes_total",
            "Total number of writes to the destination store",
        ),
        &["operation"],
    )
    .expect("Failed to create STORE_WRITES_TOTAL metric - this should never happen")
});

static COALESCED_TRIGGERS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "secret_sync_coalesced_triggers_total",
        "Total number of triggers skipped because a pass was already queued or running",
    )
    .expect("Failed to create COALESCED_TRIGGERS_TOTAL metric - this should never happen")
});

static DESCRIPTORS_MANAGED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "secret_sync_descriptors_managed",
        "Current number of registered descriptors",
    )
    .expect("Failed to create DESCRIPTORS_MANAGED metric - this should never happen")
});

static WATCH_RESTARTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "secret_sync_watch_restarts_total",
            "Total number of watch stream restarts by resource",
        ),
        &["resource"],
    )
    .expect("Failed to create WATCH_RESTARTS_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(SYNC_SUCCESS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNC_FAILURE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LAST_SYNC_DURATION.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(BACKEND_HEALTH.clone()))?;
    REGISTRY.register(Box::new(BACKEND_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BACKEND_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(BACKEND_OPERATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(COALESCED_TRIGGERS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DESCRIPTORS_MANAGED.clone()))?;
    REGISTRY.register(Box::new(WATCH_RESTARTS_TOTAL.clone()))?;

    Ok(())
}

pub fn record_sync_success(id: &ObjectIdentity, duration: f64) {
    SYNC_SUCCESS_TOTAL
        .with_label_values(&[id.namespace.as_str(), id.name.as_str()])
        .inc();
    LAST_SYNC_DURATION
        .with_label_values(&[id.namespace.as_str(), id.name.as_str()])
        .set(duration);
    RECONCILIATION_DURATION.observe(duration);
}

pub fn record_sync_failure(id: &ObjectIdentity, reason: &str, duration: f64) {
    SYNC_FAILURE_TOTAL
        .with_label_values(&[id.namespace.as_str(), id.name.as_str(), reason])
        .inc();
    LAST_SYNC_DURATION
        .with_label_values(&[id.namespace.as_str(), id.name.as_str()])
        .set(duration);
    RECONCILIATION_DURATION.observe(duration);
}

#[must_use]
pub fn sync_success_count(id: &ObjectIdentity) -> u64 {
    SYNC_SUCCESS_TOTAL
        .with_label_values(&[id.namespace.as_str(), id.name.as_str()])
        .get()
}

#[must_use]
pub fn sync_failure_count(id: &ObjectIdentity, reason: &str) -> u64 {
    SYNC_FAILURE_TOTAL
        .with_label_values(&[id.namespace.as_str(), id.name.as_str(), reason])
        .get()
}

/// Drop the per-descriptor series of a removed descriptor
pub fn remove_descriptor_metrics(id: &ObjectIdentity) {
    let labels = [id.namespace.as_str(), id.name.as_str()];
    let _ = SYNC_SUCCESS_TOTAL.remove_label_values(&labels);
    let _ = LAST_SYNC_DURATION.remove_label_values(&labels);
    for reason in SyncError::REASONS {
        let _ = SYNC_FAILURE_TOTAL.remove_label_values(&[labels[0], labels[1], reason]);
    }
}

pub fn set_backend_health(id: &BackendId, kind: BackendKind, health: HealthStatus) {
    BACKEND_HEALTH
        .with_label_values(&[id.to_string().as_str(), kind.as_str()])
        .set(health.gauge_value());
}

pub fn remove_backend_health(id: &BackendId, kind: BackendKind) {
    let _ = BACKEND_HEALTH.remove_label_values(&[id.to_string().as_str(), kind.as_str()]);
}

pub fn record_backend_operation(kind: BackendKind, operation: &str, duration: f64) {
    BACKEND_OPERATIONS_TOTAL
        .with_label_values(&[kind.as_str(), operation])
        .inc();
    BACKEND_OPERATION_DURATION
        .with_label_values(&[kind.as_str(), operation])
        .observe(duration);
}

pub fn increment_backend_operation_errors(kind: BackendKind, reason: &str) {
    BACKEND_OPERATION_ERRORS_TOTAL
        .with_label_values(&[kind.as_str(), reason])
        .inc();
}

pub fn increment_store_writes(operation: &str) {
    STORE_WRITES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn increment_coalesced_triggers() {
    COALESCED_TRIGGERS_TOTAL.inc();
}

#[must_use]
pub fn coalesced_triggers() -> u64 {
    COALESCED_TRIGGERS_TOTAL.get()
}

pub fn set_descriptors_managed(count: usize) {
    DESCRIPTORS_MANAGED.set(i64::try_from(count).unwrap_or(i64::MAX));
}

pub fn increment_watch_restarts(resource: &str) {
    WATCH_RESTARTS_TOTAL.with_label_values(&[resource]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_descriptor_counters() {
        let id = ObjectIdentity::new("metrics-test", "db");
        let before = sync_success_count(&id);
        record_sync_success(&id, 0.25);
        record_sync_failure(&id, "Unreachable", 0.5);
        assert_eq!(sync_success_count(&id), before + 1);
        assert!(sync_failure_count(&id, "Unreachable") >= 1);
    }

    #[test]
    fn test_removed_descriptor_leaves_no_series() {
        let id = ObjectIdentity::new("metrics-test", "removed");
        record_sync_success(&id, 0.1);
        record_sync_failure(&id, "Timeout", 0.1);
        record_sync_failure(&id, "SecretTypeMismatch", 0.1);

        remove_descriptor_metrics(&id);

        let labels = [id.namespace.as_str(), id.name.as_str()];
        assert!(SYNC_SUCCESS_TOTAL.remove_label_values(&labels).is_err());
        assert!(LAST_SYNC_DURATION.remove_label_values(&labels).is_err());
        for reason in ["Timeout", "SecretTypeMismatch"] {
            assert!(SYNC_FAILURE_TOTAL
                .remove_label_values(&[labels[0], labels[1], reason])
                .is_err());
        }
    }

    #[test]
    fn test_backend_health_gauge() {
        let id = BackendId::namespaced("metrics-test", "vault");
        set_backend_health(&id, BackendKind::VaultLike, HealthStatus::Healthy);
        assert_eq!(
            BACKEND_HEALTH
                .with_label_values(&[id.to_string().as_str(), "vault"])
                .get(),
            1
        );
        set_backend_health(&id, BackendKind::VaultLike, HealthStatus::Unreachable);
        assert_eq!(
            BACKEND_HEALTH
                .with_label_values(&[id.to_string().as_str(), "vault"])
                .get(),
            0
        );
    }
}
