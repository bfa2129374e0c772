//! Observable side channels for the scheduler:
//! `scheduler.total-assignments`, `scheduler.local-assignments`, and
//! `cluster-membership.backends.total`.
//!
//! `MetricSink` is a small capability trait so the scan assigner and the
//! membership tracker can report counters without depending on a concrete
//! metrics backend; production code wires a `PrometheusMetricSink`, tests use
//! `NoopMetricSink`.

use prometheus::{IntCounter, IntGauge, Registry};

pub trait MetricSink: Send + Sync {
    fn inc_total_assignments(&self, by: u64);
    fn inc_local_assignments(&self, by: u64);
    fn set_backend_total(&self, count: i64);
}

/// Default sink: registers the three gauges/counters into a `prometheus::Registry`.
pub struct PrometheusMetricSink {
    total_assignments: IntCounter,
    local_assignments: IntCounter,
    backends_total: IntGauge,
}

impl PrometheusMetricSink {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let total_assignments =
            IntCounter::new("scheduler_total_assignments", "scheduler.total-assignments")?;
        let local_assignments =
            IntCounter::new("scheduler_local_assignments", "scheduler.local-assignments")?;
        let backends_total = IntGauge::new(
            "cluster_membership_backends_total",
            "cluster-membership.backends.total",
        )?;

        registry.register(Box::new(total_assignments.clone()))?;
        registry.register(Box::new(local_assignments.clone()))?;
        registry.register(Box::new(backends_total.clone()))?;

        Ok(Self {
            total_assignments,
            local_assignments,
            backends_total,
        })
    }
}

impl MetricSink for PrometheusMetricSink {
    fn inc_total_assignments(&self, by: u64) {
        self.total_assignments.inc_by(by);
    }

    fn inc_local_assignments(&self, by: u64) {
        self.local_assignments.inc_by(by);
    }

    fn set_backend_total(&self, count: i64) {
        self.backends_total.set(count);
    }
}

/// No-op sink used by unit tests and anywhere metrics plumbing would
/// otherwise be a distraction.
#[derive(Default)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn inc_total_assignments(&self, _by: u64) {}
    fn inc_local_assignments(&self, _by: u64) {}
    fn set_backend_total(&self, _count: i64) {}
}
