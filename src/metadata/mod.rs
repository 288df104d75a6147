/// Metadata cache interface
///
/// The cache itself is an external collaborator; routes only need a way to
/// take a snapshot of the currently known instances of a replicaset,
/// labelled by role. Resolution happens at every new-connection event, so a
/// cache update is picked up by the next client without any route restart.
use std::collections::HashMap;
use std::sync::RwLock;

use crate::core::address::RouteAddress;

/// Role of one managed server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceRole {
    Primary,
    Secondary,
}

/// One server instance as reported by a metadata cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedInstance {
    pub addr: RouteAddress,
    pub role: InstanceRole,
}

impl ManagedInstance {
    pub fn new(addr: RouteAddress, role: InstanceRole) -> Self {
        Self { addr, role }
    }
}

/// Snapshot supplier for dynamic destination sets.
pub trait MetadataCache: Send + Sync {
    /// Current instances of the named replicaset. An unknown name yields an
    /// empty snapshot.
    fn instances(&self, replicaset: &str) -> Vec<ManagedInstance>;
}

/// In-process cache backed by a plain map, for embedders and tests. The
/// host program keeps a handle and replaces snapshots as its own topology
/// source changes.
#[derive(Default)]
pub struct FixedCache {
    replicasets: RwLock<HashMap<String, Vec<ManagedInstance>>>,
}

impl FixedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for one replicaset.
    pub fn update<S: Into<String>>(&self, replicaset: S, instances: Vec<ManagedInstance>) {
        self.replicasets
            .write()
            .unwrap()
            .insert(replicaset.into(), instances);
    }
}

impl MetadataCache for FixedCache {
    fn instances(&self, replicaset: &str) -> Vec<ManagedInstance> {
        self.replicasets
            .read()
            .unwrap()
            .get(replicaset)
            .cloned()
            .unwrap_or_default()
    }
}
