use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parallax_common::metrics::{MetricSink, NoopMetricSink};
use parking_lot::Mutex;

use crate::backend::{BackendConfig, BackendDescriptor};

/// The raw, not-yet-validated fields of a backend registration as they
/// arrive off the topic. Decoding can fail (empty host, zero port, empty
/// IP) — those failures are the `MEMBERSHIP_DECODE_FAILED` case in the
/// malformed-payload handling.
#[derive(Debug, Clone)]
pub struct RawBackendPayload {
    pub host: String,
    pub port: u16,
    pub ip: String,
    pub is_coordinator: bool,
    pub is_executor: bool,
}

impl RawBackendPayload {
    fn decode(&self) -> Option<BackendDescriptor> {
        if self.host.is_empty() || self.ip.is_empty() || self.port == 0 {
            return None;
        }
        Some(BackendDescriptor {
            address: parallax_common::NetworkAddress::new(self.host.clone(), self.port),
            ip: self.ip.clone(),
            is_coordinator: self.is_coordinator,
            is_executor: self.is_executor,
        })
    }
}

#[derive(Debug, Clone)]
pub enum DeltaPayload {
    Update(RawBackendPayload),
    Tombstone,
}

/// One entry of an incremental topic delta: a backend registration key
/// (opaque, assigned by whatever registered the backend) plus either an
/// updated payload or a tombstone marking removal.
#[derive(Debug, Clone)]
pub struct DeltaEntry {
    pub key: String,
    pub payload: DeltaPayload,
}

/// A single update received from the statestore topic.
#[derive(Debug, Clone)]
pub enum TopicDelta {
    /// A full re-sync: replaces the tracked set wholesale.
    FullMap(Vec<(String, RawBackendPayload)>),
    /// An incremental set of upserts/removals applied on top of the current
    /// tracked set.
    Incremental(Vec<DeltaEntry>),
}

struct TrackedEntry {
    seq: u64,
    descriptor: BackendDescriptor,
}

/// Applies incremental topic deltas and publishes a consistent
/// `BackendConfig` snapshot after every delta.
///
/// Readers call `snapshot()` to get a strong reference to the current
/// `BackendConfig`; that reference stays valid (and consistent) even if a
/// concurrent `apply` publishes a newer one.
pub struct MembershipTracker {
    current: ArcSwap<BackendConfig>,
    tracked: Mutex<HashMap<String, TrackedEntry>>,
    next_seq: Mutex<u64>,
    metrics: Arc<dyn MetricSink>,
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetricSink))
    }
}

impl MembershipTracker {
    pub fn new(metrics: Arc<dyn MetricSink>) -> Self {
        Self {
            current: ArcSwap::from_pointee(BackendConfig::default()),
            tracked: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(0),
            metrics,
        }
    }

    /// The snapshot in effect right now. Cheap: an `Arc` clone of the
    /// published pointer.
    pub fn snapshot(&self) -> Arc<BackendConfig> {
        self.current.load_full()
    }

    /// Apply one topic delta and publish the resulting snapshot.
    ///
    /// Never fails: malformed entries are logged and skipped, duplicate IPs
    /// resolve to the most recently applied entry (logged at WARN), and the
    /// tracker keeps serving the previous snapshot for any update that turns
    /// out to be a no-op.
    pub fn apply(&self, delta: TopicDelta) {
        let mut tracked = self.tracked.lock();
        let mut seq_guard = self.next_seq.lock();

        match delta {
            TopicDelta::FullMap(entries) => {
                tracked.clear();
                for (key, raw) in entries {
                    Self::upsert(&mut tracked, &mut seq_guard, key, raw);
                }
            }
            TopicDelta::Incremental(entries) => {
                for entry in entries {
                    match entry.payload {
                        DeltaPayload::Tombstone => {
                            tracked.remove(&entry.key);
                        }
                        DeltaPayload::Update(raw) => {
                            Self::upsert(&mut tracked, &mut seq_guard, entry.key, raw);
                        }
                    }
                }
            }
        }

        let snapshot = self.build_snapshot(&tracked);
        self.metrics.set_backend_total(snapshot.size() as i64);
        self.current.store(Arc::new(snapshot));
    }

    fn upsert(
        tracked: &mut HashMap<String, TrackedEntry>,
        seq_guard: &mut u64,
        key: String,
        raw: RawBackendPayload,
    ) {
        let Some(descriptor) = raw.decode() else {
            tracing::warn!(key = %key, "membership: dropping malformed backend payload");
            return;
        };
        *seq_guard += 1;
        tracked.insert(
            key,
            TrackedEntry {
                seq: *seq_guard,
                descriptor,
            },
        );
    }

    /// Collapse the tracked-by-key map into a `BackendConfig`, resolving any
    /// two keys that registered the same IP in favor of the one applied
    /// most recently (last writer wins).
    fn build_snapshot(&self, tracked: &HashMap<String, TrackedEntry>) -> BackendConfig {
        let mut by_ip: HashMap<&str, &TrackedEntry> = HashMap::new();
        for entry in tracked.values() {
            match by_ip.get(entry.descriptor.ip.as_str()) {
                Some(existing) if existing.seq > entry.seq => {}
                Some(_) => {
                    tracing::warn!(ip = %entry.descriptor.ip, "membership: duplicate backend id for ip, last writer wins");
                    by_ip.insert(&entry.descriptor.ip, entry);
                }
                None => {
                    by_ip.insert(&entry.descriptor.ip, entry);
                }
            }
        }
        BackendConfig::build(by_ip.into_values().map(|e| e.descriptor.clone()).collect())
    }
}
