//! The plan-tree and scan-range data model the scheduler consumes
//! Produced upstream by query analysis/optimization;
//! the scheduler treats it as a read-only input.

use std::collections::HashMap;

use parallax_common::NetworkAddress;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanNodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanNodeType {
    Scan,
    Union,
    Exchange,
    HashJoin,
    /// Anything else: projections, filters, aggregations, sorts, ... None of
    /// these affect fragment boundaries or scan assignment.
    Other,
}

/// How a producing fragment's rows reach a consuming `Exchange` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Hash,
    Unpartitioned,
}

/// Per-scan-node hints that narrow or override the query-wide options for
/// just that node.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanNodeHints {
    pub replica_preference_override: Option<ReplicaPreference>,
    pub exec_at_coord: bool,
}

#[derive(Debug, Clone)]
pub struct PlanNode {
    pub id: PlanNodeId,
    pub node_type: PlanNodeType,
    pub children: Vec<PlanNode>,
    pub scan_hints: Option<ScanNodeHints>,
    /// Only meaningful when `node_type == Exchange`.
    pub exchange_kind: Option<ExchangeKind>,
}

impl PlanNode {
    pub fn leaf(id: PlanNodeId, node_type: PlanNodeType) -> Self {
        Self {
            id,
            node_type,
            children: Vec::new(),
            scan_hints: None,
            exchange_kind: None,
        }
    }

    pub fn exchange(id: PlanNodeId, kind: ExchangeKind, input: PlanNode) -> Self {
        Self {
            id,
            node_type: PlanNodeType::Exchange,
            children: vec![input],
            scan_hints: None,
            exchange_kind: Some(kind),
        }
    }

    pub fn with_children(mut self, children: Vec<PlanNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_scan_hints(mut self, hints: ScanNodeHints) -> Self {
        self.scan_hints = Some(hints);
        self
    }

    /// Every node in the subtree rooted at `self`, this node first
    /// (pre-order, left to right).
    pub fn iter_preorder(&self) -> Vec<&PlanNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.iter_preorder());
        }
        out
    }

    pub fn is_scan(&self) -> bool {
        self.node_type == PlanNodeType::Scan
    }
}

/// One physical copy of a scan range's data.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaLocation {
    /// Index into the owning `PlanExecInfo::host_list`.
    pub host_index: usize,
    pub is_cached: bool,
}

/// A contiguous chunk of a table's data to be read by one scan.
#[derive(Debug, Clone)]
pub struct ScanRange {
    pub blob: Vec<u8>,
    pub length_bytes: u64,
    pub locations: Vec<ReplicaLocation>,
}

impl ScanRange {
    pub fn new(length_bytes: u64, locations: Vec<ReplicaLocation>) -> Self {
        Self {
            blob: Vec::new(),
            length_bytes,
            locations,
        }
    }
}

/// Cost class of reading a replica, cheapest first. Declaration order is
/// load-bearing: `derive(Ord)` relies on it to make `CACHE_LOCAL < DISK_LOCAL
/// < REMOTE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicaPreference {
    CacheLocal,
    DiskLocal,
    Remote,
}

impl Default for ReplicaPreference {
    fn default() -> Self {
        ReplicaPreference::CacheLocal
    }
}

/// Query-wide scheduling options, all optional with documented defaults.
/// Round-trips through TOML/JSON so a preset can be persisted and replayed
/// (see `SchedulerConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default = "default::replica_preference")]
    pub replica_preference: ReplicaPreference,
    #[serde(default)]
    pub schedule_random_replica: bool,
    #[serde(default)]
    pub disable_cached_reads: bool,
    #[serde(default = "default::mt_dop")]
    pub mt_dop: u32,
    #[serde(default)]
    pub request_pool: String,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            replica_preference: default::replica_preference(),
            schedule_random_replica: false,
            disable_cached_reads: false,
            mt_dop: default::mt_dop(),
            request_pool: String::new(),
        }
    }
}

mod default {
    use super::ReplicaPreference;

    pub fn replica_preference() -> ReplicaPreference {
        ReplicaPreference::CacheLocal
    }

    pub fn mt_dop() -> u32 {
        1
    }
}

/// One plan (coordinator fragment tree) within a query, together with the
/// plan-local host list its `ReplicaLocation`s index into and the scan
/// ranges for every scan node it contains.
#[derive(Debug, Clone)]
pub struct PlanExecInfo {
    pub plan: PlanNode,
    pub host_list: Vec<NetworkAddress>,
    pub scan_ranges: HashMap<PlanNodeId, Vec<ScanRange>>,
}

/// The top-level input to `schedule()`.
#[derive(Debug, Clone)]
pub struct QueryExecRequest {
    pub plans: Vec<PlanExecInfo>,
}
