//! The scheduling entry point.

use std::collections::HashMap;
use std::sync::Arc;

use parallax_cluster::BackendConfig;
use parallax_common::{MetricSink, NetworkAddress, Result};
use rand::RngCore;

use crate::fragment_planner::{FragmentPlanner, ScanAndInputHosts, ScheduledFragment, UnionHostPolicy};
use crate::plan::{PlanExecInfo, PlanNodeId, QueryExecRequest, QueryOptions};
use crate::scan_assigner::{ScanAssigner, ScanNodeAssignment};

/// Totals surfaced for the external gauges and rolled up
/// from every `AssignmentContext` created while scheduling a query.
#[derive(Debug, Clone, Default)]
pub struct ScheduleCounters {
    pub total_assignments: u64,
    pub local_assignments: u64,
}

#[derive(Debug, Clone)]
pub struct PlanSchedule {
    pub fragments: Vec<ScheduledFragment>,
}

#[derive(Debug, Clone)]
pub struct QuerySchedule {
    pub plans: Vec<PlanSchedule>,
    pub counters: ScheduleCounters,
    pub coord_address: Option<NetworkAddress>,
}

pub struct Scheduler {
    union_policy: Box<dyn UnionHostPolicy + Send + Sync>,
    metrics: Arc<dyn MetricSink>,
}

impl Scheduler {
    pub fn new(metrics: Arc<dyn MetricSink>) -> Self {
        Self {
            union_policy: Box::new(ScanAndInputHosts),
            metrics,
        }
    }

    pub fn with_union_policy(mut self, policy: Box<dyn UnionHostPolicy + Send + Sync>) -> Self {
        self.union_policy = policy;
        self
    }

    /// Schedule every plan in `request` against `snapshot`. `rng` drives the
    /// per-scan-node `AssignmentContext`s; callers that need reproducible
    /// schedules must pass a seeded RNG (this is the determinism guarantee).
    pub fn schedule(
        &self,
        snapshot: &BackendConfig,
        request: &QueryExecRequest,
        options: &QueryOptions,
        rng: &mut dyn RngCore,
    ) -> Result<QuerySchedule> {
        let coordinator = snapshot.coordinator().map(|d| d.address.clone());
        tracing::debug!(plan_count = request.plans.len(), coordinator = ?coordinator, "scheduling query");
        let mut counters = ScheduleCounters::default();
        let mut plans = Vec::with_capacity(request.plans.len());

        for plan_info in &request.plans {
            let assignments = self.assign_scans(snapshot, plan_info, options, rng)?;
            for assignment in assignments.values() {
                counters.total_assignments +=
                    assignment.counters.local_assignments + assignment.counters.remote_assignments;
                counters.local_assignments += assignment.counters.local_assignments;
            }

            let mut planner = FragmentPlanner::new(
                &assignments,
                options.mt_dop,
                coordinator.as_ref(),
                self.union_policy.as_ref(),
            );
            let fragments = planner.plan(&plan_info.plan)?;
            plans.push(PlanSchedule { fragments });
        }

        self.metrics.inc_total_assignments(counters.total_assignments);
        self.metrics.inc_local_assignments(counters.local_assignments);
        tracing::info!(
            total = counters.total_assignments,
            local = counters.local_assignments,
            "query scheduled"
        );

        Ok(QuerySchedule {
            plans,
            counters,
            coord_address: coordinator,
        })
    }

    fn assign_scans(
        &self,
        snapshot: &BackendConfig,
        plan_info: &PlanExecInfo,
        options: &QueryOptions,
        rng: &mut dyn RngCore,
    ) -> Result<HashMap<PlanNodeId, ScanNodeAssignment>> {
        let coordinator = snapshot.coordinator().map(|d| d.address.clone());
        let mut out = HashMap::new();
        for node in plan_info.plan.iter_preorder() {
            if !node.is_scan() {
                continue;
            }
            let ranges = plan_info.scan_ranges.get(&node.id).cloned().unwrap_or_default();
            let assignment = ScanAssigner::assign(
                snapshot,
                node.id,
                &ranges,
                &plan_info.host_list,
                options,
                node.scan_hints,
                coordinator.as_ref(),
                rng,
            )?;
            out.insert(node.id, assignment);
        }
        Ok(out)
    }
}
