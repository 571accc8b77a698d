//! Containment events.
//!
//! Failures that must not be swallowed (a dead peer, a lost page, a
//! stranded vCPU) are appended here in addition to being returned to the
//! caller that hit them.  Whoever owns fault containment drains the log.

use crate::lock;
use hyperkernel_protocol::{NodeId, PageNumber, RejectReason, VcpuId};
use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClusterEvent {
    NodeSuspected {
        node: NodeId,
    },
    /// Retries exhausted; the node is now treated as dead.
    NodeUnreachable {
        node: NodeId,
    },
    NodeRejoined {
        node: NodeId,
    },
    /// A dead sharer was dropped from a sharer set without an ack.
    SharerEvicted {
        page: PageNumber,
        sharer: NodeId,
    },
    /// The only current copy of a page lives on a dead node.
    PageLost {
        page: PageNumber,
        owner: NodeId,
    },
    StaleCopyDropped {
        page: PageNumber,
        version: u64,
    },
    MigrationRefused {
        vcpu: VcpuId,
        target: NodeId,
        reason: RejectReason,
    },
    /// The vCPU is stranded in flight.
    MigrationFailed {
        vcpu: VcpuId,
        target: NodeId,
    },
    ProtocolViolation {
        page: Option<PageNumber>,
        detail: String,
    },
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterEvent::NodeSuspected { node } => write!(f, "{node} suspected"),
            ClusterEvent::NodeUnreachable { node } => write!(f, "{node} unreachable"),
            ClusterEvent::NodeRejoined { node } => write!(f, "{node} rejoined"),
            ClusterEvent::SharerEvicted { page, sharer } => {
                write!(f, "{sharer} evicted from sharers of {page}")
            }
            ClusterEvent::PageLost { page, owner } => {
                write!(f, "{page} lost with its owner {owner}")
            }
            ClusterEvent::StaleCopyDropped { page, version } => {
                write!(f, "stale copy of {page} at v{version} dropped")
            }
            ClusterEvent::MigrationRefused {
                vcpu,
                target,
                reason,
            } => write!(f, "{target} refused {vcpu}: {reason}"),
            ClusterEvent::MigrationFailed { vcpu, target } => {
                write!(f, "{vcpu} stranded in flight to {target}")
            }
            ClusterEvent::ProtocolViolation { page, detail } => match page {
                Some(page) => write!(f, "protocol violation on {page}: {detail}"),
                None => write!(f, "protocol violation: {detail}"),
            },
        }
    }
}

/// Append-only event buffer for one node.
#[derive(Debug)]
pub struct EventLog {
    node: NodeId,
    events: Mutex<Vec<ClusterEvent>>,
}

impl EventLog {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: ClusterEvent) {
        match &event {
            ClusterEvent::NodeSuspected { .. }
            | ClusterEvent::NodeRejoined { .. }
            | ClusterEvent::StaleCopyDropped { .. }
            | ClusterEvent::MigrationRefused { .. } => info!("{}: {event}", self.node),
            ClusterEvent::NodeUnreachable { .. } | ClusterEvent::SharerEvicted { .. } => {
                warn!("{}: {event}", self.node)
            }
            ClusterEvent::PageLost { .. }
            | ClusterEvent::MigrationFailed { .. }
            | ClusterEvent::ProtocolViolation { .. } => error!("{}: {event}", self.node),
        }
        lock(&self.events).push(event);
    }

    /// Take every event recorded so far.
    pub fn drain(&self) -> Vec<ClusterEvent> {
        std::mem::take(&mut *lock(&self.events))
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
