//! Demo binary: stands up a `MembershipTracker`, feeds it a synthetic
//! cluster, schedules one toy query against it, and logs the result. Useful
//! for exercising the scheduling path without a real coordinator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parallax_cluster::{BackendDescriptor, MembershipTracker};
use parallax_common::{NetworkAddress, PrometheusMetricSink};
use parallax_scheduler::{
    PlanExecInfo, PlanNode, PlanNodeId, PlanNodeType, QueryExecRequest, QueryOptions,
    ReplicaLocation, ReplicaPreference, ScanRange, Scheduler, SchedulerConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Parser, Debug)]
#[clap(name = "parallax", about = "Demo driver for the scan scheduler")]
struct Opts {
    /// Number of synthetic executors to register.
    #[clap(long, default_value = "3")]
    executors: u16,

    /// Number of synthetic scan ranges to schedule.
    #[clap(long, default_value = "12")]
    ranges: u32,

    /// RNG seed; same seed against the same cluster always yields the same
    /// assignment.
    #[clap(long, default_value = "0")]
    seed: u64,

    /// Maximum degree of parallelism to split each host's ranges into.
    #[clap(long, default_value = "1")]
    mt_dop: u32,

    /// Path to a `SchedulerConfig` TOML file. Falls back to built-in defaults
    /// when omitted.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Overrides `default_query_options.replica_preference`. One of
    /// `cache_local`, `disk_local`, `remote`.
    #[clap(long)]
    replica_preference: Option<String>,

    #[clap(long)]
    schedule_random_replica: bool,

    #[clap(long)]
    disable_cached_reads: bool,

    /// Overrides `default_query_options.request_pool`.
    #[clap(long)]
    request_pool: Option<String>,
}

fn parse_replica_preference(raw: &str) -> Option<ReplicaPreference> {
    match raw.to_ascii_lowercase().as_str() {
        "cache_local" | "cachelocal" => Some(ReplicaPreference::CacheLocal),
        "disk_local" | "disklocal" => Some(ReplicaPreference::DiskLocal),
        "remote" => Some(ReplicaPreference::Remote),
        _ => None,
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(
        PrometheusMetricSink::new(&registry).expect("metric registration never collides at startup"),
    );

    let tracker = MembershipTracker::new(metrics.clone());
    let descriptors: Vec<BackendDescriptor> = (0..opts.executors)
        .map(|i| {
            let ip = format!("10.0.0.{}", i + 1);
            BackendDescriptor::new(NetworkAddress::new(ip.clone(), 22000 + i), ip)
        })
        .collect();
    tracing::info!(count = descriptors.len(), "seeding synthetic cluster");
    for (idx, descriptor) in descriptors.iter().enumerate() {
        tracker.apply(parallax_cluster::TopicDelta::Incremental(vec![
            parallax_cluster::DeltaEntry {
                key: format!("backend-{idx}"),
                payload: parallax_cluster::DeltaPayload::Update(parallax_cluster::RawBackendPayload {
                    host: descriptor.address.host.clone(),
                    port: descriptor.address.port,
                    ip: descriptor.ip.clone(),
                    is_coordinator: false,
                    is_executor: true,
                }),
            },
        ]));
    }

    let snapshot = tracker.snapshot();
    tracing::info!(executors = snapshot.executor_count(), "cluster ready");

    let host_list = vec![NetworkAddress::new("10.0.0.1", 9000)];
    let mut scan_ranges = HashMap::new();
    scan_ranges.insert(
        PlanNodeId(0),
        (0..opts.ranges)
            .map(|_| {
                ScanRange::new(
                    1_000_000,
                    vec![ReplicaLocation {
                        host_index: 0,
                        is_cached: false,
                    }],
                )
            })
            .collect(),
    );
    let request = QueryExecRequest {
        plans: vec![PlanExecInfo {
            plan: PlanNode::leaf(PlanNodeId(0), PlanNodeType::Scan),
            host_list,
            scan_ranges,
        }],
    };
    let config = match &opts.config {
        Some(path) => match SchedulerConfig::from_toml_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "failed to load scheduler config");
                std::process::exit(1);
            }
        },
        None => SchedulerConfig::default(),
    };
    let mut options = config.default_query_options;
    options.mt_dop = opts.mt_dop;
    if let Some(raw) = &opts.replica_preference {
        match parse_replica_preference(raw) {
            Some(pref) => options.replica_preference = pref,
            None => {
                tracing::error!(value = %raw, "unrecognized --replica-preference value");
                std::process::exit(1);
            }
        }
    }
    if opts.schedule_random_replica {
        options.schedule_random_replica = true;
    }
    if opts.disable_cached_reads {
        options.disable_cached_reads = true;
    }
    if let Some(pool) = opts.request_pool {
        options.request_pool = pool;
    }

    let scheduler = Scheduler::new(metrics);
    let mut rng = StdRng::seed_from_u64(opts.seed);
    match scheduler.schedule(&snapshot, &request, &options, &mut rng) {
        Ok(schedule) => {
            tracing::info!(
                total_assignments = schedule.counters.total_assignments,
                local_assignments = schedule.counters.local_assignments,
                coord_address = ?schedule.coord_address,
                "schedule computed"
            );
            for (plan_idx, plan) in schedule.plans.iter().enumerate() {
                for fragment in &plan.fragments {
                    tracing::info!(
                        plan = plan_idx,
                        fragment = fragment.id.0,
                        kind = ?fragment.kind,
                        instances = fragment.instances.len(),
                        "fragment scheduled"
                    );
                }
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "scheduling failed");
            std::process::exit(1);
        }
    }
}
