//! Wire protocol for hyperkernel page coherence and vCPU migration.
//!
//! This crate defines the identifiers, message set, and binary encoding
//! exchanged between nodes of a federated hyperkernel.  It carries no
//! protocol logic: the directory, coherence, and migration engines in
//! `hyperkernel-core` decide *when* to send each message.
//!
//! # Transport model
//!
//! Every exchange is a request/reply pair over a reliable, per-channel
//! ordered transport:
//!
//! 1. Sender wraps a [`Message`] in an [`Envelope`] and encodes it
//! 2. Transport delivers the frame to the destination node
//! 3. Receiver decodes, dispatches, and encodes exactly one reply
//! 4. Sender decodes the reply (or observes a timeout)
//!
//! A frame that fails to decode is dropped by the receiver, so corruption
//! below the transport surfaces to the sender as a timeout.
//!
//! # Message flow
//!
//! ```text
//! Requester              Home                     Owner / Sharer
//! ─────────              ────                     ──────────────
//! PageRequest  ───────→  lookup
//!                        Recall(downgrade) ────→  write back, keep RO
//!              ←───────  PageReply          ←──── RecallReply
//!
//! WriteRequest ───────→  Invalidate ───────────→  drop copy
//!                                         ←─────  InvalidateAck
//!              ←───────  WriteGrant (version+1)
//!
//! Source                 Target
//! ──────                 ──────
//! VcpuMigrate  ───────→  inject context, Running
//!              ←───────  MigrateAck | MigrateNack
//! ```

pub mod codec;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use codec::{decode, encode, DecodeError};

// ═══════════════════════════════════════════════════════════════════════
//  Sizes and framing constants
// ═══════════════════════════════════════════════════════════════════════

/// Size of a guest physical page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Highest page number whose bytes are all addressable.
pub const MAX_PAGE_NUMBER: u64 = u64::MAX / PAGE_SIZE as u64;

/// Upper bound on an encoded vCPU context blob.
pub const MAX_CONTEXT_LEN: usize = 64 * 1024;

/// Frame magic, `"HK"` little-endian.
pub const WIRE_MAGIC: u16 = 0x4B48;

/// Current wire format revision.
pub const WIRE_VERSION: u8 = 1;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Largest body the decoder will accept.
pub const MAX_BODY_LEN: usize = MAX_CONTEXT_LEN + 64;

// ═══════════════════════════════════════════════════════════════════════
//  Message tags
// ═══════════════════════════════════════════════════════════════════════

/// Read fault: requester asks the home for a shared copy.
pub const MSG_PAGE_REQUEST: u8 = 0x01;
/// Shared copy returned to a read requester.
pub const MSG_PAGE_REPLY: u8 = 0x02;
/// Write fault: requester asks the home for exclusive ownership.
pub const MSG_WRITE_REQUEST: u8 = 0x03;
/// Exclusive ownership granted, carrying the new version.
pub const MSG_WRITE_GRANT: u8 = 0x04;
/// Home tells a sharer to drop its read-only copy.
pub const MSG_INVALIDATE: u8 = 0x05;
/// Sharer confirms the copy is gone.
pub const MSG_INVALIDATE_ACK: u8 = 0x06;
/// Home asks the exclusive owner to write back.
pub const MSG_RECALL: u8 = 0x07;
/// Owner's write-back.
pub const MSG_RECALL_REPLY: u8 = 0x08;
/// Node re-checks one cached copy against the directory.
pub const MSG_VALIDATE: u8 = 0x09;
/// Directory verdict on a cached copy.
pub const MSG_VALIDATE_REPLY: u8 = 0x0A;
/// Fenced node asks to be treated as alive again.
pub const MSG_REJOIN: u8 = 0x0B;
/// Home accepted the rejoin.
pub const MSG_REJOIN_ACK: u8 = 0x0C;
/// Home refused a page request.
pub const MSG_NACK: u8 = 0x0D;

/// vCPU context handed from source to target.
pub const MSG_VCPU_MIGRATE: u8 = 0x20;
/// Target reconstructed the vCPU and is running it.
pub const MSG_MIGRATE_ACK: u8 = 0x21;
/// Target positively failed to reconstruct the vCPU.
pub const MSG_MIGRATE_NACK: u8 = 0x22;

// ═══════════════════════════════════════════════════════════════════════
//  Identifiers
// ═══════════════════════════════════════════════════════════════════════

/// Identity of a physical machine in the federation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Guest physical page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageNumber(pub u64);

impl PageNumber {
    /// Page containing guest physical address `gpa`.
    pub const fn containing(gpa: u64) -> Self {
        Self(gpa / PAGE_SIZE as u64)
    }

    /// First guest physical address of this page.  Pages above
    /// [`MAX_PAGE_NUMBER`] have no address and saturate; the decoder
    /// never produces one.
    pub const fn base_address(self) -> u64 {
        self.0.saturating_mul(PAGE_SIZE as u64)
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn{:#x}", self.0)
    }
}

/// Identity of a guest virtual CPU.  Stable across migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VcpuId(pub u32);

impl fmt::Display for VcpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vcpu{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Refusal reasons
// ═══════════════════════════════════════════════════════════════════════

/// Why a home refused a page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
    /// The page is not homed at the receiving node.
    NotHome,
    /// The requester is marked dead by the home and must revalidate first.
    Fenced,
    /// The page's exclusive copy lives on a node that cannot be reached.
    OwnerUnreachable(NodeId),
    /// The request waited too long behind other transitions on the page.
    QueueTimeout,
    /// The request contradicts the directory.
    Violation,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::NotHome => write!(f, "not-home"),
            NackReason::Fenced => write!(f, "fenced"),
            NackReason::OwnerUnreachable(node) => write!(f, "owner-unreachable({node})"),
            NackReason::QueueTimeout => write!(f, "queue-timeout"),
            NackReason::Violation => write!(f, "violation"),
        }
    }
}

/// Why a migration target refused to take a vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// No idle execution slot on the target.
    NoIdleSlot,
    /// The context blob could not be injected.
    BadContext,
    /// The target holds conflicting state for this vCPU.
    Conflict,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoIdleSlot => write!(f, "no-idle-slot"),
            RejectReason::BadContext => write!(f, "bad-context"),
            RejectReason::Conflict => write!(f, "conflict"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Messages
// ═══════════════════════════════════════════════════════════════════════

/// A coherence or migration protocol message.
///
/// Page payloads are always exactly [`PAGE_SIZE`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // ── Coherence ───────────────────────────────────────────────
    PageRequest {
        page: PageNumber,
        requester: NodeId,
        /// Version of the requester's last copy, if it ever had one.
        known_version: Option<u64>,
    },
    PageReply {
        page: PageNumber,
        version: u64,
        data: Vec<u8>,
    },
    WriteRequest {
        page: PageNumber,
        requester: NodeId,
    },
    WriteGrant {
        page: PageNumber,
        version: u64,
        data: Vec<u8>,
    },
    Invalidate {
        page: PageNumber,
        version: u64,
    },
    InvalidateAck {
        page: PageNumber,
    },
    Recall {
        page: PageNumber,
        version: u64,
        /// Keep a read-only copy after writing back.
        downgrade: bool,
    },
    RecallReply {
        page: PageNumber,
        version: u64,
        /// `None` when the owner never installed the grant.
        data: Option<Vec<u8>>,
    },
    Validate {
        page: PageNumber,
        known_version: u64,
    },
    ValidateReply {
        page: PageNumber,
        version: u64,
        valid: bool,
    },
    Rejoin {
        node: NodeId,
    },
    RejoinAck {
        node: NodeId,
    },
    Nack {
        page: PageNumber,
        reason: NackReason,
    },

    // ── Migration ───────────────────────────────────────────────
    VcpuMigrate {
        vcpu: VcpuId,
        /// Migration generation; a retry carries the same epoch.
        epoch: u64,
        /// Number of migrations this vCPU has made so far.
        hops: u32,
        context: Vec<u8>,
    },
    MigrateAck {
        vcpu: VcpuId,
    },
    MigrateNack {
        vcpu: VcpuId,
        reason: RejectReason,
    },
}

impl Message {
    /// Wire tag for this message.
    pub fn tag(&self) -> u8 {
        match self {
            Message::PageRequest { .. } => MSG_PAGE_REQUEST,
            Message::PageReply { .. } => MSG_PAGE_REPLY,
            Message::WriteRequest { .. } => MSG_WRITE_REQUEST,
            Message::WriteGrant { .. } => MSG_WRITE_GRANT,
            Message::Invalidate { .. } => MSG_INVALIDATE,
            Message::InvalidateAck { .. } => MSG_INVALIDATE_ACK,
            Message::Recall { .. } => MSG_RECALL,
            Message::RecallReply { .. } => MSG_RECALL_REPLY,
            Message::Validate { .. } => MSG_VALIDATE,
            Message::ValidateReply { .. } => MSG_VALIDATE_REPLY,
            Message::Rejoin { .. } => MSG_REJOIN,
            Message::RejoinAck { .. } => MSG_REJOIN_ACK,
            Message::Nack { .. } => MSG_NACK,
            Message::VcpuMigrate { .. } => MSG_VCPU_MIGRATE,
            Message::MigrateAck { .. } => MSG_MIGRATE_ACK,
            Message::MigrateNack { .. } => MSG_MIGRATE_NACK,
        }
    }

    /// Page this message concerns, if it is a coherence message.
    pub fn page(&self) -> Option<PageNumber> {
        match self {
            Message::PageRequest { page, .. }
            | Message::PageReply { page, .. }
            | Message::WriteRequest { page, .. }
            | Message::WriteGrant { page, .. }
            | Message::Invalidate { page, .. }
            | Message::InvalidateAck { page }
            | Message::Recall { page, .. }
            | Message::RecallReply { page, .. }
            | Message::Validate { page, .. }
            | Message::ValidateReply { page, .. }
            | Message::Nack { page, .. } => Some(*page),
            Message::Rejoin { .. }
            | Message::RejoinAck { .. }
            | Message::VcpuMigrate { .. }
            | Message::MigrateAck { .. }
            | Message::MigrateNack { .. } => None,
        }
    }

    /// vCPU this message concerns, if it is a migration message.
    pub fn vcpu(&self) -> Option<VcpuId> {
        match self {
            Message::VcpuMigrate { vcpu, .. }
            | Message::MigrateAck { vcpu }
            | Message::MigrateNack { vcpu, .. } => Some(*vcpu),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::PageRequest {
                page,
                requester,
                known_version,
            } => match known_version {
                Some(v) => write!(f, "page-request({page}, from={requester}, known=v{v})"),
                None => write!(f, "page-request({page}, from={requester})"),
            },
            Message::PageReply { page, version, .. } => write!(f, "page-reply({page}, v{version})"),
            Message::WriteRequest { page, requester } => {
                write!(f, "write-request({page}, from={requester})")
            }
            Message::WriteGrant { page, version, .. } => {
                write!(f, "write-grant({page}, v{version})")
            }
            Message::Invalidate { page, version } => write!(f, "invalidate({page}, v{version})"),
            Message::InvalidateAck { page } => write!(f, "invalidate-ack({page})"),
            Message::Recall {
                page,
                version,
                downgrade,
            } => write!(f, "recall({page}, v{version}, downgrade={downgrade})"),
            Message::RecallReply { page, version, data } => write!(
                f,
                "recall-reply({page}, v{version}, {})",
                if data.is_some() { "data" } else { "empty" }
            ),
            Message::Validate {
                page,
                known_version,
            } => write!(f, "validate({page}, v{known_version})"),
            Message::ValidateReply {
                page,
                version,
                valid,
            } => write!(f, "validate-reply({page}, v{version}, valid={valid})"),
            Message::Rejoin { node } => write!(f, "rejoin({node})"),
            Message::RejoinAck { node } => write!(f, "rejoin-ack({node})"),
            Message::Nack { page, reason } => write!(f, "nack({page}, {reason})"),
            Message::VcpuMigrate {
                vcpu,
                epoch,
                hops,
                context,
            } => write!(
                f,
                "vcpu-migrate({vcpu}, epoch={epoch}, hops={hops}, {}B)",
                context.len()
            ),
            Message::MigrateAck { vcpu } => write!(f, "migrate-ack({vcpu})"),
            Message::MigrateNack { vcpu, reason } => write!(f, "migrate-nack({vcpu}, {reason})"),
        }
    }
}

/// A message together with its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub body: Message,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, body: Message) -> Self {
        Self { from, to, body }
    }
}
