//! Fault definitions for hyperkernel clusters.
//!
//! Each variant is a failure mode the simulated fabric or the simulated
//! hypervisor can exhibit.  Targets are node indices into the cluster.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fault that can be injected into a running cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    // ── Network faults ──────────────────────────────────────────
    /// Drop every frame between two sets of nodes.
    NetworkPartition {
        side_a: Vec<usize>,
        side_b: Vec<usize>,
    },

    /// Drop frames to/from a node with the given probability.
    PacketLoss {
        target: usize,
        /// Parts per million.
        rate_ppm: u32,
    },

    /// Flip a byte in frames to/from a node.  The receiver's decoder
    /// rejects most of these; the rest surface as protocol anomalies.
    PacketCorruption {
        target: usize,
        /// Parts per million.
        rate_ppm: u32,
    },

    /// Remove all partitions, loss and corruption.
    NetworkHeal,

    // ── Node faults ─────────────────────────────────────────────
    /// Node stops answering.  Its memory and vCPUs stay frozen.
    NodeCrash { target: usize },

    /// A crashed node answers again with whatever state it had.
    NodeRecover { target: usize },

    // ── Resource faults ─────────────────────────────────────────
    /// Every idle execution slot on the node disappears, so inbound
    /// migrations are refused.
    SlotExhaustion { target: usize },

    /// Undo [`Fault::SlotExhaustion`].
    SlotRestore { target: usize },
}

impl Fault {
    /// Target node index, if this fault targets a single node.
    pub fn target(&self) -> Option<usize> {
        match self {
            Fault::NetworkPartition { .. } | Fault::NetworkHeal => None,
            Fault::PacketLoss { target, .. }
            | Fault::PacketCorruption { target, .. }
            | Fault::NodeCrash { target }
            | Fault::NodeRecover { target }
            | Fault::SlotExhaustion { target }
            | Fault::SlotRestore { target } => Some(*target),
        }
    }

    pub fn category(&self) -> FaultCategory {
        match self {
            Fault::NetworkPartition { .. }
            | Fault::PacketLoss { .. }
            | Fault::PacketCorruption { .. }
            | Fault::NetworkHeal => FaultCategory::Network,
            Fault::NodeCrash { .. } | Fault::NodeRecover { .. } => FaultCategory::Node,
            Fault::SlotExhaustion { .. } | Fault::SlotRestore { .. } => FaultCategory::Resource,
        }
    }

    /// Whether this fault undoes damage rather than causing it.
    pub fn is_repair(&self) -> bool {
        matches!(
            self,
            Fault::NetworkHeal | Fault::NodeRecover { .. } | Fault::SlotRestore { .. }
        )
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::NetworkPartition { side_a, side_b } => {
                write!(f, "network-partition({side_a:?} | {side_b:?})")
            }
            Fault::PacketLoss { target, rate_ppm } => {
                write!(f, "packet-loss(node={target}, {rate_ppm}ppm)")
            }
            Fault::PacketCorruption { target, rate_ppm } => {
                write!(f, "packet-corrupt(node={target}, {rate_ppm}ppm)")
            }
            Fault::NetworkHeal => write!(f, "network-heal"),
            Fault::NodeCrash { target } => write!(f, "node-crash(node={target})"),
            Fault::NodeRecover { target } => write!(f, "node-recover(node={target})"),
            Fault::SlotExhaustion { target } => write!(f, "slot-exhaustion(node={target})"),
            Fault::SlotRestore { target } => write!(f, "slot-restore(node={target})"),
        }
    }
}

/// Broad category for a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCategory {
    Network,
    Node,
    Resource,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCategory::Network => write!(f, "network"),
            FaultCategory::Node => write!(f, "node"),
            FaultCategory::Resource => write!(f, "resource"),
        }
    }
}
