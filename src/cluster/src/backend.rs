use std::collections::HashMap;

use parallax_common::NetworkAddress;

/// One backend process known to the cluster.
///
/// `ip` is the canonical locality key: several descriptors (distinct ports)
/// may share the same `ip` when more than one backend process runs on a
/// host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub address: NetworkAddress,
    pub ip: String,
    pub is_coordinator: bool,
    pub is_executor: bool,
}

impl BackendDescriptor {
    pub fn new(address: NetworkAddress, ip: impl Into<String>) -> Self {
        Self {
            address,
            ip: ip.into(),
            is_coordinator: false,
            is_executor: true,
        }
    }

    pub fn coordinator(address: NetworkAddress, ip: impl Into<String>) -> Self {
        Self {
            address,
            ip: ip.into(),
            is_coordinator: true,
            is_executor: false,
        }
    }
}

/// An immutable snapshot of the cluster, as maintained by `MembershipTracker`.
///
/// Built once and never mutated; a new topology is always a brand-new
/// `BackendConfig` published atomically by the tracker.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    by_ip: HashMap<String, Vec<BackendDescriptor>>,
    ip_by_hostname: HashMap<String, String>,
}

impl BackendConfig {
    /// Build a snapshot from a flat list of descriptors. Hostnames are
    /// resolved from `address.host`; when several descriptors share a
    /// hostname, the first one encountered wins (stable for the lifetime of
    /// this snapshot).
    pub fn build(descriptors: Vec<BackendDescriptor>) -> Self {
        let mut by_ip: HashMap<String, Vec<BackendDescriptor>> = HashMap::new();
        let mut ip_by_hostname: HashMap<String, String> = HashMap::new();

        for desc in descriptors {
            ip_by_hostname
                .entry(desc.address.host.clone())
                .or_insert_with(|| desc.ip.clone());
            by_ip.entry(desc.ip.clone()).or_default().push(desc);
        }

        Self {
            by_ip,
            ip_by_hostname,
        }
    }

    /// The first descriptor registered for `ip`, if any.
    pub fn lookup_by_ip(&self, ip: &str) -> Option<&BackendDescriptor> {
        self.by_ip.get(ip).and_then(|v| v.first())
    }

    /// All descriptors (distinct ports) registered for `ip`.
    pub fn descriptors_for_ip(&self, ip: &str) -> &[BackendDescriptor] {
        self.by_ip.get(ip).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn lookup_hostname(&self, hostname: &str) -> Option<&str> {
        self.ip_by_hostname.get(hostname).map(String::as_str)
    }

    pub fn has_executor(&self, ip: &str) -> bool {
        self.by_ip
            .get(ip)
            .map(|v| v.iter().any(|d| d.is_executor))
            .unwrap_or(false)
    }

    /// All backend descriptors flagged as executors, across every IP.
    pub fn executors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.by_ip
            .values()
            .flatten()
            .filter(|d| d.is_executor)
    }

    /// Distinct IPs hosting at least one executor.
    pub fn executor_ips(&self) -> impl Iterator<Item = &str> {
        self.by_ip
            .iter()
            .filter(|(_, descs)| descs.iter().any(|d| d.is_executor))
            .map(|(ip, _)| ip.as_str())
    }

    /// One coordinator-flagged backend, if the snapshot has one.
    pub fn coordinator(&self) -> Option<&BackendDescriptor> {
        self.by_ip
            .values()
            .flatten()
            .find(|d| d.is_coordinator)
    }

    /// Total number of backend descriptors in the snapshot (executors and
    /// coordinator-only, counting every port separately).
    pub fn size(&self) -> usize {
        self.by_ip.values().map(Vec::len).sum()
    }

    pub fn executor_count(&self) -> usize {
        self.executors().count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}
