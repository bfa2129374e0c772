//! End-to-end scheduling scenarios against the public API, one per literal
//! case worked out for this scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use parallax_cluster::{BackendConfig, BackendDescriptor};
use parallax_common::{NetworkAddress, NoopMetricSink};
use parallax_scheduler::{
    FragmentKind, PlanExecInfo, PlanNode, PlanNodeId, PlanNodeType, QueryExecRequest,
    QueryOptions, ReplicaLocation, ReplicaPreference, ScanRange, Scheduler,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn two_executors() -> BackendConfig {
    BackendConfig::build(vec![
        BackendDescriptor::new(NetworkAddress::new("10.0.0.1", 22000), "10.0.0.1"),
        BackendDescriptor::new(NetworkAddress::new("10.0.0.2", 22000), "10.0.0.2"),
    ])
}

fn single_scan_request(ranges: Vec<ScanRange>, host_list: Vec<NetworkAddress>) -> QueryExecRequest {
    let mut scan_ranges = HashMap::new();
    scan_ranges.insert(PlanNodeId(0), ranges);
    QueryExecRequest {
        plans: vec![PlanExecInfo {
            plan: PlanNode::leaf(PlanNodeId(0), PlanNodeType::Scan),
            host_list,
            scan_ranges,
        }],
    }
}

#[test]
fn scenario_a_two_executors_deterministic_tie_break() {
    let snapshot = two_executors();
    let hosts = vec![
        NetworkAddress::new("10.0.0.1", 9000),
        NetworkAddress::new("10.0.0.2", 9000),
    ];
    let range = ScanRange::new(
        1_000_000,
        vec![
            ReplicaLocation {
                host_index: 0,
                is_cached: false,
            },
            ReplicaLocation {
                host_index: 1,
                is_cached: false,
            },
        ],
    );
    let request = single_scan_request(vec![range], hosts);
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(1);
    let schedule = scheduler
        .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
        .unwrap();

    assert_eq!(schedule.counters.local_assignments, 1);
    let fragment = &schedule.plans[0].fragments[0];
    assert_eq!(fragment.instances.len(), 1);
    assert_eq!(fragment.instances[0].host, NetworkAddress::new("10.0.0.1", 22000));
}

#[test]
fn scenario_b_cached_preference_wins() {
    let snapshot = two_executors();
    let hosts = vec![
        NetworkAddress::new("10.0.0.1", 9000),
        NetworkAddress::new("10.0.0.2", 9000),
    ];
    let range = ScanRange::new(
        1_000_000,
        vec![
            ReplicaLocation {
                host_index: 0,
                is_cached: true,
            },
            ReplicaLocation {
                host_index: 1,
                is_cached: false,
            },
        ],
    );
    let request = single_scan_request(vec![range], hosts);
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(1);
    let schedule = scheduler
        .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
        .unwrap();

    let fragment = &schedule.plans[0].fragments[0];
    assert_eq!(fragment.instances[0].host, NetworkAddress::new("10.0.0.1", 22000));
}

#[test]
fn scenario_c_disable_cached_reads_forces_disk_local() {
    let snapshot = two_executors();
    let hosts = vec![
        NetworkAddress::new("10.0.0.1", 9000),
        NetworkAddress::new("10.0.0.2", 9000),
    ];
    let range = ScanRange::new(
        1_000_000,
        vec![
            ReplicaLocation {
                host_index: 0,
                is_cached: true,
            },
            ReplicaLocation {
                host_index: 1,
                is_cached: false,
            },
        ],
    );
    let request = single_scan_request(vec![range], hosts);
    let options = QueryOptions {
        disable_cached_reads: true,
        ..Default::default()
    };
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(1);
    let schedule = scheduler.schedule(&snapshot, &request, &options, &mut rng).unwrap();
    assert_eq!(schedule.counters.local_assignments, 1);
}

#[test]
fn scenario_d_remote_only_range_goes_to_an_executor() {
    let snapshot = two_executors();
    let hosts = vec![NetworkAddress::new("10.0.0.9", 9000)];
    let range = ScanRange::new(
        500_000,
        vec![ReplicaLocation {
            host_index: 0,
            is_cached: false,
        }],
    );
    let request = single_scan_request(vec![range], hosts);
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(1);
    let schedule = scheduler
        .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
        .unwrap();

    let fragment = &schedule.plans[0].fragments[0];
    assert_eq!(fragment.instances.len(), 1);
    let host = &fragment.instances[0].host;
    assert!(
        *host == NetworkAddress::new("10.0.0.1", 22000)
            || *host == NetworkAddress::new("10.0.0.2", 22000)
    );
}

#[test]
fn scenario_e_load_balances_within_one_range() {
    let snapshot = two_executors();
    let hosts = vec![
        NetworkAddress::new("10.0.0.1", 9000),
        NetworkAddress::new("10.0.0.2", 9000),
    ];
    let ranges: Vec<ScanRange> = (0..100)
        .map(|_| {
            ScanRange::new(
                1_000_000,
                vec![
                    ReplicaLocation {
                        host_index: 0,
                        is_cached: false,
                    },
                    ReplicaLocation {
                        host_index: 1,
                        is_cached: false,
                    },
                ],
            )
        })
        .collect();
    let request = single_scan_request(ranges, hosts);
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(9);
    let schedule = scheduler
        .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
        .unwrap();

    assert_eq!(schedule.counters.local_assignments, 100);
    let fragment = &schedule.plans[0].fragments[0];
    let mut counts: HashMap<NetworkAddress, usize> = HashMap::new();
    for inst in &fragment.instances {
        *counts.entry(inst.host.clone()).or_default() +=
            inst.per_node_scan_ranges.values().map(Vec::len).sum::<usize>();
    }
    let a = *counts.get(&NetworkAddress::new("10.0.0.1", 22000)).unwrap_or(&0) as i64;
    let b = *counts.get(&NetworkAddress::new("10.0.0.2", 22000)).unwrap_or(&0) as i64;
    assert!((a - b).abs() <= 1);
}

#[test]
fn scenario_f_coordinator_only_fragment() {
    let mut descriptors = vec![BackendDescriptor::coordinator(
        NetworkAddress::new("10.0.0.100", 22000),
        "10.0.0.100",
    )];
    descriptors.extend([
        BackendDescriptor::new(NetworkAddress::new("10.0.0.1", 22000), "10.0.0.1"),
        BackendDescriptor::new(NetworkAddress::new("10.0.0.2", 22000), "10.0.0.2"),
    ]);
    let snapshot = BackendConfig::build(descriptors);

    let request = QueryExecRequest {
        plans: vec![PlanExecInfo {
            plan: PlanNode::leaf(PlanNodeId(0), PlanNodeType::Other),
            host_list: vec![],
            scan_ranges: HashMap::new(),
        }],
    };
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(1);
    let schedule = scheduler
        .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
        .unwrap();

    let fragment = &schedule.plans[0].fragments[0];
    assert_eq!(fragment.kind, FragmentKind::Unpartitioned);
    assert_eq!(fragment.instances.len(), 1);
    assert_eq!(fragment.instances[0].host, NetworkAddress::new("10.0.0.100", 22000));
}

#[test]
fn scenario_g_membership_swap_is_isolated_per_snapshot_capture() {
    let metrics = Arc::new(NoopMetricSink);
    let tracker = parallax_cluster::MembershipTracker::new(metrics);
    tracker.apply(parallax_cluster::TopicDelta::FullMap(vec![
        (
            "a".into(),
            parallax_cluster::RawBackendPayload {
                host: "10.0.0.1".into(),
                port: 22000,
                ip: "10.0.0.1".into(),
                is_coordinator: false,
                is_executor: true,
            },
        ),
        (
            "b".into(),
            parallax_cluster::RawBackendPayload {
                host: "10.0.0.2".into(),
                port: 22000,
                ip: "10.0.0.2".into(),
                is_coordinator: false,
                is_executor: true,
            },
        ),
    ]));

    // Scheduling call 1 captures the snapshot before B is removed...
    let captured = tracker.snapshot();

    // ...and a concurrent membership update removes B.
    tracker.apply(parallax_cluster::TopicDelta::Incremental(vec![
        parallax_cluster::DeltaEntry {
            key: "b".into(),
            payload: parallax_cluster::DeltaPayload::Tombstone,
        },
    ]));

    // Call 1 must still see B through its already-captured snapshot.
    assert_eq!(captured.executor_count(), 2);
    assert!(captured.has_executor("10.0.0.2"));
    // A fresh snapshot reflects the removal.
    assert_eq!(tracker.snapshot().executor_count(), 1);
}

#[test]
fn property_byte_sum_equals_total_scan_bytes() {
    let snapshot = two_executors();
    let hosts = vec![
        NetworkAddress::new("10.0.0.1", 9000),
        NetworkAddress::new("10.0.0.2", 9000),
    ];
    let ranges: Vec<ScanRange> = vec![123, 456, 789, 0]
        .into_iter()
        .map(|len| {
            ScanRange::new(
                len,
                vec![ReplicaLocation {
                    host_index: 0,
                    is_cached: false,
                }],
            )
        })
        .collect();
    let total: u64 = ranges.iter().map(|r| r.length_bytes).sum();
    let request = single_scan_request(ranges, hosts);
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(3);
    let schedule = scheduler
        .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
        .unwrap();

    let assigned: u64 = schedule.plans[0].fragments[0]
        .instances
        .iter()
        .flat_map(|i| i.per_node_scan_ranges.values())
        .flatten()
        .map(|r| r.length_bytes)
        .sum();
    assert_eq!(assigned, total);
}

#[test]
fn property_replica_preference_remote_forbids_local_counters() {
    let snapshot = two_executors();
    let hosts = vec![NetworkAddress::new("10.0.0.1", 9000)];
    let range = ScanRange::new(
        10,
        vec![ReplicaLocation {
            host_index: 0,
            is_cached: true,
        }],
    );
    let request = single_scan_request(vec![range], hosts);
    let options = QueryOptions {
        replica_preference: ReplicaPreference::Remote,
        ..Default::default()
    };
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));
    let mut rng = StdRng::seed_from_u64(3);
    let schedule = scheduler.schedule(&snapshot, &request, &options, &mut rng).unwrap();
    assert_eq!(schedule.counters.local_assignments, 0);
}

#[test]
fn property_repeated_scheduling_with_same_seed_is_identical() {
    let snapshot = two_executors();
    let hosts = vec![
        NetworkAddress::new("10.0.0.1", 9000),
        NetworkAddress::new("10.0.0.2", 9000),
    ];
    let ranges: Vec<ScanRange> = (0..20)
        .map(|_| {
            ScanRange::new(
                10,
                vec![
                    ReplicaLocation {
                        host_index: 0,
                        is_cached: false,
                    },
                    ReplicaLocation {
                        host_index: 1,
                        is_cached: false,
                    },
                ],
            )
        })
        .collect();
    let request = single_scan_request(ranges, hosts);
    let scheduler = Scheduler::new(Arc::new(NoopMetricSink));

    let run = || {
        let mut rng = StdRng::seed_from_u64(77);
        scheduler
            .schedule(&snapshot, &request, &QueryOptions::default(), &mut rng)
            .unwrap()
    };
    let first = run();
    let second = run();

    let hosts_of = |s: &parallax_scheduler::QuerySchedule| -> Vec<NetworkAddress> {
        s.plans[0].fragments[0]
            .instances
            .iter()
            .map(|i| i.host.clone())
            .collect()
    };
    assert_eq!(hosts_of(&first), hosts_of(&second));
    assert_eq!(first.counters.total_assignments, second.counters.total_assignments);
}

#[test]
fn full_map_delta_equal_to_current_state_is_a_no_op() {
    let metrics = Arc::new(NoopMetricSink);
    let tracker = parallax_cluster::MembershipTracker::new(metrics);
    let entries = vec![(
        "a".into(),
        parallax_cluster::RawBackendPayload {
            host: "10.0.0.1".into(),
            port: 22000,
            ip: "10.0.0.1".into(),
            is_coordinator: false,
            is_executor: true,
        },
    )];
    tracker.apply(parallax_cluster::TopicDelta::FullMap(entries.clone()));
    let before = tracker.snapshot();
    tracker.apply(parallax_cluster::TopicDelta::FullMap(entries));
    let after = tracker.snapshot();
    assert_eq!(before.size(), after.size());
    assert_eq!(
        before.lookup_by_ip("10.0.0.1").unwrap().address,
        after.lookup_by_ip("10.0.0.1").unwrap().address
    );
}
