//! The scan-range assignment engine.

use std::collections::HashMap;

use itertools::Itertools;
use parallax_cluster::BackendConfig;
use parallax_common::{NetworkAddress, Result, SchedulerError};
use rand::RngCore;

use crate::assignment::{AssignmentContext, ByteCounters};
use crate::plan::{PlanNodeId, QueryOptions, ReplicaPreference, ScanNodeHints, ScanRange};

/// The outcome of assigning every scan range of one scan node.
#[derive(Debug, Default)]
pub struct ScanNodeAssignment {
    /// Scan ranges grouped by the backend address chosen for them.
    pub per_host: HashMap<NetworkAddress, Vec<ScanRange>>,
    pub counters: ByteCounters,
}

/// Resolve the plan-local host's canonical IP: if the host list entry names
/// a hostname the snapshot knows about, use the resolved IP; otherwise
/// assume the entry already carries the raw IP (the common case: scan
/// ranges report datanode addresses directly).
fn resolve_ip<'a>(addr: &'a NetworkAddress, cfg: &'a BackendConfig) -> &'a str {
    cfg.lookup_hostname(&addr.host).unwrap_or(addr.host.as_str())
}

/// Effective minimum memory distance for a scan node:
/// `disable_cached_reads` always forces at least `DiskLocal`, overriding any
/// hint; otherwise the stricter (numerically larger) of the query-wide
/// preference and the node's own override applies.
fn effective_min_distance(options: &QueryOptions, hints: Option<&ScanNodeHints>) -> ReplicaPreference {
    if options.disable_cached_reads {
        return ReplicaPreference::DiskLocal.max(
            hints
                .and_then(|h| h.replica_preference_override)
                .unwrap_or(ReplicaPreference::DiskLocal),
        );
    }
    let from_option = options.replica_preference;
    let from_hint = hints.and_then(|h| h.replica_preference_override);
    match from_hint {
        Some(hint) => from_option.max(hint),
        None => from_option,
    }
}

struct ReplicaClassification {
    ip: String,
    raw_is_local_capable: bool,
    clamped_distance: ReplicaPreference,
}

pub struct ScanAssigner;

impl ScanAssigner {
    /// Assign every range in `scan_ranges` to an executor, returning the
    /// per-backend grouping used by the fragment planner.
    #[allow(clippy::too_many_arguments)]
    pub fn assign(
        snapshot: &BackendConfig,
        node_id: PlanNodeId,
        scan_ranges: &[ScanRange],
        host_list: &[NetworkAddress],
        options: &QueryOptions,
        hints: Option<ScanNodeHints>,
        coordinator: Option<&NetworkAddress>,
        rng: &mut dyn RngCore,
    ) -> Result<ScanNodeAssignment> {
        let mut out = ScanNodeAssignment::default();

        if hints.map(|h| h.exec_at_coord).unwrap_or(false) {
            let coord_addr = coordinator.ok_or_else(|| {
                SchedulerError::internal("exec_at_coord requested but no coordinator in snapshot")
            })?;
            tracing::debug!(node = ?node_id, coord = ?coord_addr, "scan node pinned to coordinator");
            for range in scan_ranges {
                out.counters.local_assignments += 1;
                out.counters.disk_local_bytes += range.length_bytes;
                out.per_host
                    .entry(coord_addr.clone())
                    .or_default()
                    .push(range.clone());
            }
            return Ok(out);
        }

        if snapshot.executor_count() == 0 {
            return Err(SchedulerError::NoExecutors);
        }

        let executor_ips: Vec<String> = snapshot.executor_ips().map(str::to_string).collect();
        let mut ctx = AssignmentContext::new(&executor_ips, rng);
        let min_distance = effective_min_distance(options, hints.as_ref());

        // Classify every range up front so we can process local-replica
        // ranges before purely remote ones.
        let mut classified: Vec<(usize, Vec<ReplicaClassification>, bool)> =
            Vec::with_capacity(scan_ranges.len());
        for (idx, range) in scan_ranges.iter().enumerate() {
            let mut replicas = Vec::with_capacity(range.locations.len());
            let mut has_local = false;
            for loc in &range.locations {
                let host = host_list.get(loc.host_index).ok_or_else(|| {
                    SchedulerError::malformed_plan(format!(
                        "replica host index {} out of range (host_list has {} entries)",
                        loc.host_index,
                        host_list.len()
                    ))
                })?;
                let ip = resolve_ip(host, snapshot).to_string();
                let is_executor = snapshot.has_executor(&ip);
                let raw_distance = if !is_executor {
                    ReplicaPreference::Remote
                } else if loc.is_cached {
                    ReplicaPreference::CacheLocal
                } else {
                    ReplicaPreference::DiskLocal
                };
                if is_executor {
                    has_local = true;
                }
                let clamped = raw_distance.max(min_distance);
                replicas.push(ReplicaClassification {
                    ip,
                    raw_is_local_capable: is_executor,
                    clamped_distance: clamped,
                });
            }
            classified.push((idx, replicas, has_local));
        }
        classified.sort_by_key(|(_, _, has_local)| !*has_local);

        for (idx, replicas, _) in classified {
            let range = &scan_ranges[idx];
            let best_distance = replicas
                .iter()
                .map(|r| r.clamped_distance)
                .min()
                .unwrap_or(ReplicaPreference::Remote);

            let (ip, is_cached, is_remote) = if best_distance == ReplicaPreference::Remote {
                (ctx.select_remote(), false, true)
            } else {
                let break_ties = match best_distance {
                    ReplicaPreference::CacheLocal => true,
                    ReplicaPreference::DiskLocal => options.schedule_random_replica,
                    ReplicaPreference::Remote => unreachable!(),
                };
                let candidates: Vec<&str> = replicas
                    .iter()
                    .filter(|r| r.raw_is_local_capable && r.clamped_distance == best_distance)
                    .map(|r| r.ip.as_str())
                    .unique()
                    .collect();
                let chosen = ctx.select_local(&candidates, break_ties).unwrap_or_else(|| {
                    tracing::warn!(candidates = ?candidates, "no local candidate survived selection, falling back to remote");
                    ctx.select_remote()
                });
                (chosen, best_distance == ReplicaPreference::CacheLocal, false)
            };

            let descriptors: Vec<_> = snapshot
                .descriptors_for_ip(&ip)
                .iter()
                .filter(|d| d.is_executor)
                .collect();
            if descriptors.is_empty() {
                return Err(SchedulerError::internal(format!(
                    "selected ip {ip} has no executor descriptor"
                )));
            }
            let port_idx = ctx.pick_port_index(&ip, descriptors.len());
            let descriptor = descriptors[port_idx];

            ctx.record(&ip, range.length_bytes, is_cached, is_remote);
            out.per_host
                .entry(descriptor.address.clone())
                .or_default()
                .push(range.clone());
        }

        out.counters = ctx.byte_counters;
        Ok(out)
    }
}
