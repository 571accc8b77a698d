//! Serializable point-in-time views of node state, for invariant checks
//! and for dumping a simulation run to JSON.

use crate::directory::PageState;
use crate::membership::Liveness;
use crate::pages::Access;
use crate::stats::StatsSnapshot;
use crate::vcpu::VcpuState;
use hyperkernel_protocol::{NodeId, PageNumber, VcpuId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntrySnapshot {
    pub page: PageNumber,
    pub state: PageState,
    pub version: u64,
    pub lost: bool,
    pub busy: bool,
    pub queued: usize,
}

/// Every materialized directory entry homed at one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectorySnapshot {
    pub home: NodeId,
    pub entries: Vec<DirectoryEntrySnapshot>,
}

impl DirectorySnapshot {
    pub fn get(&self, page: PageNumber) -> Option<&DirectoryEntrySnapshot> {
        self.entries
            .binary_search_by_key(&page, |e| e.page)
            .ok()
            .map(|i| &self.entries[i])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedPageSnapshot {
    pub page: PageNumber,
    pub access: Access,
    pub version: u64,
    pub poisoned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VcpuSnapshot {
    pub vcpu: VcpuId,
    pub state: VcpuState,
    pub epoch: u64,
    pub hops: u32,
}

/// One node's caches, vCPUs, peer view and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalSnapshot {
    pub node: NodeId,
    pub pages: Vec<CachedPageSnapshot>,
    pub vcpus: Vec<VcpuSnapshot>,
    pub peers: Vec<(NodeId, Liveness)>,
    pub stats: StatsSnapshot,
}

/// Whole-cluster dump written by the simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterSnapshot {
    pub seed: u64,
    pub directories: Vec<DirectorySnapshot>,
    pub nodes: Vec<LocalSnapshot>,
}
