//! Fragment decomposition and instantiation. Takes the per-scan-node
//! assignments produced by the scan assigner together with a plan tree and
//! produces the final `QuerySchedule`.

use std::collections::HashMap;

use itertools::Itertools;
use parallax_common::{NetworkAddress, Result, SchedulerError};

use crate::plan::{ExchangeKind, PlanNode, PlanNodeId, PlanNodeType};
use crate::scan_assigner::ScanNodeAssignment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Unpartitioned,
    ScanOnly,
    Union,
    Collocated,
}

/// An exchange crossing into this fragment: which plan node receives it, from
/// which producing fragment, and under what partitioning.
#[derive(Debug, Clone)]
struct InputEdge {
    exchange_node: PlanNodeId,
    producer: FragmentId,
    kind: ExchangeKind,
}

/// One fragment: a pruned copy of the plan tree with `Exchange` nodes kept as
/// boundary markers, plus the bookkeeping needed to classify and instantiate
/// it.
#[derive(Debug, Clone)]
struct Fragment {
    id: FragmentId,
    root: PlanNode,
    scans: Vec<PlanNodeId>,
    inputs: Vec<InputEdge>,
}

/// One instance of a scheduled fragment.
#[derive(Debug, Clone)]
pub struct FragmentInstance {
    pub host: NetworkAddress,
    pub sender_id: u32,
    pub per_node_scan_ranges: HashMap<PlanNodeId, Vec<crate::plan::ScanRange>>,
    /// Per consuming `Exchange` node, how many senders feed this instance.
    pub exchange_sender_counts: HashMap<PlanNodeId, u32>,
    /// Per `Exchange` node this instance feeds as a producer, the consumer
    /// instances it must send to.
    pub exchange_destinations: HashMap<PlanNodeId, Vec<ExchangeDestination>>,
}

#[derive(Debug, Clone)]
pub struct ScheduledFragment {
    pub id: FragmentId,
    pub kind: FragmentKind,
    pub instances: Vec<FragmentInstance>,
}

/// A consuming instance's destination reference: `(fragment, instance index
/// within that fragment)`. Senders address their output by enumerating the
/// consuming `ScheduledFragment`'s instances in order and pairing each with
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeDestination {
    pub fragment: FragmentId,
    pub instance_index: usize,
}

impl ExchangeDestination {
    pub fn new(fragment: FragmentId, instance_index: usize) -> Self {
        Self {
            fragment,
            instance_index,
        }
    }
}

/// Narrows union fragment placement. The default keeps the documented
/// behavior (scan hosts union all input-instance hosts); a future policy may
/// restrict to scan hosts only.
pub trait UnionHostPolicy {
    fn hosts(&self, scan_hosts: &[NetworkAddress], input_hosts: &[NetworkAddress]) -> Vec<NetworkAddress>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanAndInputHosts;

impl UnionHostPolicy for ScanAndInputHosts {
    fn hosts(&self, scan_hosts: &[NetworkAddress], input_hosts: &[NetworkAddress]) -> Vec<NetworkAddress> {
        scan_hosts
            .iter()
            .chain(input_hosts.iter())
            .cloned()
            .unique()
            .collect()
    }
}

pub struct FragmentPlanner<'a> {
    assignments: &'a HashMap<PlanNodeId, ScanNodeAssignment>,
    mt_dop: u32,
    coordinator: Option<&'a NetworkAddress>,
    union_policy: &'a dyn UnionHostPolicy,
    next_fragment_id: u64,
    fragments: Vec<Fragment>,
}

impl<'a> FragmentPlanner<'a> {
    pub fn new(
        assignments: &'a HashMap<PlanNodeId, ScanNodeAssignment>,
        mt_dop: u32,
        coordinator: Option<&'a NetworkAddress>,
        union_policy: &'a dyn UnionHostPolicy,
    ) -> Self {
        Self {
            assignments,
            mt_dop: mt_dop.max(1),
            coordinator,
            union_policy,
            next_fragment_id: 0,
            fragments: Vec::new(),
        }
    }

    /// Split the plan tree into fragments at `Exchange` boundaries, instantiate
    /// each one, then wire every producer's `exchange_destinations` now that
    /// every fragment's consumer-side instance list is known.
    pub fn plan(&mut self, root: &PlanNode) -> Result<Vec<ScheduledFragment>> {
        self.split_into_fragments(root)?;

        // Fragments are discovered bottom-up by `split_into_fragments`
        // (producers appended before their consumers' edges reference them),
        // so this index already satisfies the dependency order we need.
        let fragments = std::mem::take(&mut self.fragments);
        let mut instances_by_fragment: HashMap<FragmentId, Vec<FragmentInstance>> = HashMap::new();
        let mut kinds: HashMap<FragmentId, FragmentKind> = HashMap::new();

        for fragment in &fragments {
            let kind = classify(fragment);
            let instances = self.instantiate(fragment, kind, &instances_by_fragment)?;
            instances_by_fragment.insert(fragment.id, instances);
            kinds.insert(fragment.id, kind);
        }

        for fragment in &fragments {
            self.wire_exchange_destinations(fragment, &mut instances_by_fragment);
        }

        let scheduled = fragments
            .into_iter()
            .map(|fragment| ScheduledFragment {
                kind: kinds[&fragment.id],
                instances: instances_by_fragment.remove(&fragment.id).unwrap_or_default(),
                id: fragment.id,
            })
            .collect();

        Ok(scheduled)
    }

    fn fresh_fragment_id(&mut self) -> FragmentId {
        let id = FragmentId(self.next_fragment_id);
        self.next_fragment_id += 1;
        id
    }

    /// Recursively carve `node`'s subtree into fragments. Returns the id of
    /// the fragment rooted at `node`. Child fragments (across `Exchange`
    /// boundaries) are planned first and pushed onto `self.fragments` before
    /// their parent, giving the bottom-up order `plan()` relies on.
    fn split_into_fragments(&mut self, node: &PlanNode) -> Result<FragmentId> {
        let mut scans = Vec::new();
        let mut inputs = Vec::new();
        let pruned = self.prune(node, &mut scans, &mut inputs)?;
        let id = self.fresh_fragment_id();
        self.fragments.push(Fragment {
            id,
            root: pruned,
            scans,
            inputs,
        });
        Ok(id)
    }

    /// Copy `node`, recursing into children, but stop at `Exchange` nodes:
    /// their subtree becomes a separate fragment, and the `Exchange` node
    /// itself is kept in the copy as a childless boundary marker so
    /// `leftmost_scan` and instance-building logic can find it.
    fn prune(
        &mut self,
        node: &PlanNode,
        scans: &mut Vec<PlanNodeId>,
        inputs: &mut Vec<InputEdge>,
    ) -> Result<PlanNode> {
        if node.is_scan() {
            scans.push(node.id);
            return Ok(node.clone());
        }

        if node.node_type == PlanNodeType::Exchange {
            let kind = node.exchange_kind.ok_or_else(|| {
                SchedulerError::internal(format!("exchange node {:?} missing its kind", node.id))
            })?;
            let input = node.children.first().ok_or_else(|| {
                SchedulerError::internal(format!("exchange node {:?} has no input", node.id))
            })?;
            let producer = self.split_into_fragments(input)?;
            inputs.push(InputEdge {
                exchange_node: node.id,
                producer,
                kind,
            });
            return Ok(PlanNode::leaf(node.id, PlanNodeType::Exchange));
        }

        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            children.push(self.prune(child, scans, inputs)?);
        }
        Ok(PlanNode {
            id: node.id,
            node_type: node.node_type,
            children,
            scan_hints: node.scan_hints,
            exchange_kind: None,
        })
    }

    fn instantiate(
        &self,
        fragment: &Fragment,
        kind: FragmentKind,
        prior: &HashMap<FragmentId, Vec<FragmentInstance>>,
    ) -> Result<Vec<FragmentInstance>> {
        let instances = match kind {
            FragmentKind::Unpartitioned => self.instantiate_unpartitioned()?,
            FragmentKind::ScanOnly => self.instantiate_scan_only(fragment)?,
            FragmentKind::Union => self.instantiate_union(fragment, prior)?,
            FragmentKind::Collocated => self.instantiate_collocated(fragment, prior)?,
        };
        Ok(self.wire_exchanges(fragment, instances, prior))
    }

    fn instantiate_unpartitioned(&self) -> Result<Vec<FragmentInstance>> {
        let coord = self
            .coordinator
            .ok_or_else(|| SchedulerError::internal("unpartitioned fragment needs a coordinator address"))?;
        Ok(vec![FragmentInstance {
            host: coord.clone(),
            sender_id: 0,
            per_node_scan_ranges: HashMap::new(),
            exchange_sender_counts: HashMap::new(),
            exchange_destinations: HashMap::new(),
        }])
    }

    fn instantiate_scan_only(&self, fragment: &Fragment) -> Result<Vec<FragmentInstance>> {
        let leftmost = leftmost_scan(&fragment.root).ok_or_else(|| {
            SchedulerError::internal(format!("scan-only fragment {:?} has no scan", fragment.id))
        })?;
        let driving = self
            .assignments
            .get(&leftmost)
            .ok_or_else(|| SchedulerError::internal(format!("scan node {leftmost:?} has no assignment")))?;

        let mut hosts: Vec<&NetworkAddress> = driving.per_host.keys().collect();
        hosts.sort_by_key(|h| (h.host.clone(), h.port));

        let mut instances = Vec::new();
        let mut sender_id = 0u32;
        for host in hosts {
            let mut per_node: HashMap<PlanNodeId, Vec<crate::plan::ScanRange>> = HashMap::new();
            for scan_id in &fragment.scans {
                if let Some(assignment) = self.assignments.get(scan_id) {
                    if let Some(ranges) = assignment.per_host.get(host) {
                        per_node.insert(*scan_id, ranges.clone());
                    }
                }
            }
            let splits = split_by_dop(per_node, self.mt_dop);
            for per_node_split in splits {
                instances.push(FragmentInstance {
                    host: host.clone(),
                    sender_id,
                    per_node_scan_ranges: per_node_split,
                    exchange_sender_counts: HashMap::new(),
                    exchange_destinations: HashMap::new(),
                });
                sender_id += 1;
            }
        }
        Ok(instances)
    }

    fn instantiate_union(
        &self,
        fragment: &Fragment,
        prior: &HashMap<FragmentId, Vec<FragmentInstance>>,
    ) -> Result<Vec<FragmentInstance>> {
        let mut scan_hosts: Vec<NetworkAddress> = fragment
            .scans
            .iter()
            .filter_map(|scan_id| self.assignments.get(scan_id))
            .flat_map(|assignment| assignment.per_host.keys().cloned())
            .unique()
            .collect();
        scan_hosts.sort_by_key(|h| (h.host.clone(), h.port));

        let mut input_hosts: Vec<NetworkAddress> = fragment
            .inputs
            .iter()
            .filter_map(|edge| prior.get(&edge.producer))
            .flat_map(|prev| prev.iter().map(|inst| inst.host.clone()))
            .unique()
            .collect();
        input_hosts.sort_by_key(|h| (h.host.clone(), h.port));

        let hosts = self.union_policy.hosts(&scan_hosts, &input_hosts);

        let mut instances = Vec::with_capacity(hosts.len());
        for (sender_id, host) in hosts.into_iter().enumerate() {
            let mut per_node = HashMap::new();
            for scan_id in &fragment.scans {
                if let Some(assignment) = self.assignments.get(scan_id) {
                    if let Some(ranges) = assignment.per_host.get(&host) {
                        per_node.insert(*scan_id, ranges.clone());
                    }
                }
            }
            instances.push(FragmentInstance {
                host,
                sender_id: sender_id as u32,
                per_node_scan_ranges: per_node,
                exchange_sender_counts: HashMap::new(),
                exchange_destinations: HashMap::new(),
            });
        }
        Ok(instances)
    }

    fn instantiate_collocated(
        &self,
        fragment: &Fragment,
        prior: &HashMap<FragmentId, Vec<FragmentInstance>>,
    ) -> Result<Vec<FragmentInstance>> {
        let edge = fragment
            .inputs
            .first()
            .ok_or_else(|| SchedulerError::internal(format!("collocated fragment {:?} has no input", fragment.id)))?;
        let input_instances = prior.get(&edge.producer).ok_or_else(|| {
            SchedulerError::internal(format!("input fragment {:?} not yet scheduled", edge.producer))
        })?;

        Ok(input_instances
            .iter()
            .enumerate()
            .map(|(sender_id, inst)| FragmentInstance {
                host: inst.host.clone(),
                sender_id: sender_id as u32,
                per_node_scan_ranges: HashMap::new(),
                exchange_sender_counts: HashMap::new(),
                exchange_destinations: HashMap::new(),
            })
            .collect())
    }

    /// Record, on every instance of this fragment, how many senders feed it
    /// through each of its input exchanges. A `Hash` exchange fans every
    /// producer instance into every consumer instance, so each consumer sees
    /// the full producer count; an `Unpartitioned` exchange gathers into a
    /// single canonical consumer instance (index 0), so only that instance
    /// sees any senders at all.
    fn wire_exchanges(
        &self,
        fragment: &Fragment,
        mut instances: Vec<FragmentInstance>,
        prior: &HashMap<FragmentId, Vec<FragmentInstance>>,
    ) -> Vec<FragmentInstance> {
        for edge in &fragment.inputs {
            let producer_count = prior.get(&edge.producer).map(Vec::len).unwrap_or(0) as u32;
            for (idx, inst) in instances.iter_mut().enumerate() {
                let sender_count = match edge.kind {
                    ExchangeKind::Hash => producer_count,
                    ExchangeKind::Unpartitioned => {
                        if idx == 0 {
                            producer_count
                        } else {
                            0
                        }
                    }
                };
                inst.exchange_sender_counts.insert(edge.exchange_node, sender_count);
            }
        }
        instances
    }

    /// For every input edge of `fragment`, compute the consumer-instance
    /// destinations its producer must send to and attach them to each of the
    /// producer's already-finalized instances. Mirrors `wire_exchanges`'
    /// fan-out rule from the sending side: `Hash` addresses every consumer
    /// instance, `Unpartitioned` addresses only instance 0.
    fn wire_exchange_destinations(
        &self,
        fragment: &Fragment,
        instances_by_fragment: &mut HashMap<FragmentId, Vec<FragmentInstance>>,
    ) {
        for edge in &fragment.inputs {
            let consumer_len = instances_by_fragment.get(&fragment.id).map(Vec::len).unwrap_or(0);
            let destinations: Vec<ExchangeDestination> = match edge.kind {
                ExchangeKind::Hash => (0..consumer_len).map(|idx| ExchangeDestination::new(fragment.id, idx)).collect(),
                ExchangeKind::Unpartitioned => {
                    if consumer_len > 0 {
                        vec![ExchangeDestination::new(fragment.id, 0)]
                    } else {
                        Vec::new()
                    }
                }
            };

            if let Some(producer_instances) = instances_by_fragment.get_mut(&edge.producer) {
                for inst in producer_instances.iter_mut() {
                    inst.exchange_destinations
                        .entry(edge.exchange_node)
                        .or_default()
                        .extend(destinations.clone());
                }
            }
        }
    }
}

/// A fragment whose root is a `Union` is classified as `Union` regardless of
/// whether it happens to contain a direct scan branch; that takes priority
/// over the scan-presence check below, since a union combining a scan branch
/// with an exchange-fed branch is still a union, not a scan-only fragment.
fn classify(fragment: &Fragment) -> FragmentKind {
    if fragment.root.node_type == PlanNodeType::Union {
        FragmentKind::Union
    } else if fragment.scans.is_empty() && fragment.inputs.is_empty() {
        FragmentKind::Unpartitioned
    } else if !fragment.scans.is_empty() {
        FragmentKind::ScanOnly
    } else if fragment.inputs.len() == 1 {
        FragmentKind::Collocated
    } else {
        // No scans, no single dominant input, and not an explicit union
        // root: a degenerate multi-way merge, treated as Union.
        FragmentKind::Union
    }
}

/// First scan found by left-first DFS, not descending into `Exchange`
/// boundaries (leftmost-scan heuristic).
fn leftmost_scan(node: &PlanNode) -> Option<PlanNodeId> {
    if node.is_scan() {
        return Some(node.id);
    }
    if node.node_type == PlanNodeType::Exchange {
        return None;
    }
    node.children.iter().find_map(leftmost_scan)
}

/// Byte-weighted round-robin split of one host's combined scan ranges into
/// up to `mt_dop` instances, each as balanced in total bytes as a greedy
/// pass can make it. Never creates more instances than there are ranges to
/// spread across.
fn split_by_dop(
    per_node: HashMap<PlanNodeId, Vec<crate::plan::ScanRange>>,
    mt_dop: u32,
) -> Vec<HashMap<PlanNodeId, Vec<crate::plan::ScanRange>>> {
    if mt_dop <= 1 {
        return vec![per_node];
    }

    let mut flat: Vec<(PlanNodeId, crate::plan::ScanRange)> = Vec::new();
    for (node_id, ranges) in per_node {
        for range in ranges {
            flat.push((node_id, range));
        }
    }
    flat.sort_by(|a, b| b.1.length_bytes.cmp(&a.1.length_bytes));

    let instance_count = (mt_dop as usize).min(flat.len().max(1));
    let mut buckets: Vec<HashMap<PlanNodeId, Vec<crate::plan::ScanRange>>> =
        (0..instance_count).map(|_| HashMap::new()).collect();
    let mut bucket_bytes = vec![0u64; instance_count];

    for (node_id, range) in flat {
        let target = bucket_bytes
            .iter()
            .enumerate()
            .min_by_key(|(_, bytes)| **bytes)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        bucket_bytes[target] += range.length_bytes;
        buckets[target].entry(node_id).or_default().push(range);
    }

    buckets
}
