//! Error types for every component, and their mapping onto the
//! containment classes the rest of the system acts on.

use hyperkernel_protocol::{NodeId, PageNumber, RejectReason, VcpuId};
use std::fmt;
use thiserror::Error;

/// How the fault-containment boundary should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A reply did not arrive in time; retried locally.
    Timeout,
    /// Another transition holds the page or vCPU.
    Busy,
    /// A cached copy no longer matched the directory.
    StaleVersion,
    /// A peer stopped answering; affected pages or vCPUs are reported.
    NodeUnreachable,
    /// A vCPU is stuck in flight without confirmation.
    MigrationFailed,
    /// A message contradicted local state.
    ProtocolViolation,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::Busy => "busy",
            ErrorClass::StaleVersion => "stale-version",
            ErrorClass::NodeUnreachable => "node-unreachable",
            ErrorClass::MigrationFailed => "migration-failed",
            ErrorClass::ProtocolViolation => "protocol-violation",
        };
        f.write_str(name)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transport
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no reply from {to} within {timeout_ms}ms")]
    Timeout { to: NodeId, timeout_ms: u64 },

    #[error("{to} unreachable after {attempts} attempts")]
    Unreachable { to: NodeId, attempts: u32 },

    #[error("{to} is marked dead")]
    PeerDead { to: NodeId },

    #[error("{0} is not a cluster member")]
    UnknownNode(NodeId),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Timeout { .. } => ErrorClass::Timeout,
            TransportError::Unreachable { .. }
            | TransportError::PeerDead { .. }
            | TransportError::UnknownNode(_) => ErrorClass::NodeUnreachable,
        }
    }

    /// The peer this error is about.
    pub fn peer(&self) -> NodeId {
        match self {
            TransportError::Timeout { to, .. }
            | TransportError::Unreachable { to, .. }
            | TransportError::PeerDead { to } => *to,
            TransportError::UnknownNode(node) => *node,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Directory
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("{page} has a transition in progress")]
    Busy { page: PageNumber },

    #[error("gave up waiting for {page} after {waited_ms}ms")]
    QueueTimeout { page: PageNumber, waited_ms: u64 },

    #[error("token for {page} does not hold the transition")]
    StaleToken { page: PageNumber },

    #[error("illegal transition on {page}: {detail}")]
    IllegalTransition { page: PageNumber, detail: String },
}

impl DirectoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DirectoryError::Busy { .. } | DirectoryError::QueueTimeout { .. } => ErrorClass::Busy,
            DirectoryError::StaleToken { .. } | DirectoryError::IllegalTransition { .. } => {
                ErrorClass::ProtocolViolation
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Hypervisor
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("no idle execution slot")]
    NoIdleSlot,

    #[error("{0} has no execution slot here")]
    UnknownVcpu(VcpuId),

    #[error("{0} already occupies a slot")]
    SlotOccupied(VcpuId),

    #[error("{0} must be paused first")]
    NotPaused(VcpuId),

    #[error("context for {vcpu} is malformed ({len} bytes)")]
    MalformedContext { vcpu: VcpuId, len: usize },
}

// ═══════════════════════════════════════════════════════════════════════
//  Migration
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("{vcpu} is not resident on {node}")]
    NotResident { vcpu: VcpuId, node: NodeId },

    #[error("{vcpu} is paused on {node}")]
    NotRunning { vcpu: VcpuId, node: NodeId },

    #[error("{vcpu} is already migrating")]
    AlreadyMigrating { vcpu: VcpuId },

    #[error("{vcpu} is stranded in flight to {target}")]
    Stranded { vcpu: VcpuId, target: NodeId },

    #[error("{0} is not a cluster member")]
    UnknownNode(NodeId),

    #[error("target {target} is not alive")]
    TargetNotAlive { target: NodeId },

    #[error("{target} refused {vcpu}: {reason}")]
    Rejected {
        vcpu: VcpuId,
        target: NodeId,
        reason: RejectReason,
    },

    #[error("{target} never acknowledged {vcpu}")]
    Unacknowledged { vcpu: VcpuId, target: NodeId },

    #[error("unexpected reply migrating {vcpu}: {detail}")]
    ProtocolViolation { vcpu: VcpuId, detail: String },

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl MigrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::AlreadyMigrating { .. } | MigrationError::NotRunning { .. } => {
                ErrorClass::Busy
            }
            MigrationError::Stranded { .. } | MigrationError::Unacknowledged { .. } => {
                ErrorClass::MigrationFailed
            }
            MigrationError::UnknownNode(_) | MigrationError::TargetNotAlive { .. } => {
                ErrorClass::NodeUnreachable
            }
            MigrationError::NotResident { .. }
            | MigrationError::Rejected { .. }
            | MigrationError::ProtocolViolation { .. }
            | MigrationError::Hypervisor(_) => ErrorClass::ProtocolViolation,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Coherence
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoherenceError {
    #[error("{node} unreachable while resolving {page}")]
    NodeUnreachable { node: NodeId, page: PageNumber },

    #[error("{page} kept going stale after {refaults} refaults")]
    StaleVersion { page: PageNumber, refaults: u32 },

    #[error("{page} is still busy at its home")]
    QueueTimeout { page: PageNumber },

    #[error("protocol violation on {page}: {detail}")]
    ProtocolViolation { page: PageNumber, detail: String },

    #[error("{page} is poisoned on this node")]
    Poisoned { page: PageNumber },

    #[error("access of {len} bytes at {gpa:#x} crosses a page boundary")]
    InvalidAccess { gpa: u64, len: usize },

    #[error("{vcpu} is not runnable here")]
    NotRunnable { vcpu: VcpuId },

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl CoherenceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoherenceError::NodeUnreachable { .. } => ErrorClass::NodeUnreachable,
            CoherenceError::StaleVersion { .. } => ErrorClass::StaleVersion,
            CoherenceError::QueueTimeout { .. } | CoherenceError::NotRunnable { .. } => {
                ErrorClass::Busy
            }
            CoherenceError::ProtocolViolation { .. }
            | CoherenceError::Poisoned { .. }
            | CoherenceError::InvalidAccess { .. } => ErrorClass::ProtocolViolation,
            CoherenceError::Migration(e) => e.class(),
        }
    }
}
