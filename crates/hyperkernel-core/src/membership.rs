//! One node's view of the cluster: who is a member, who is home for a
//! page, and how alive each peer looks.
//!
//! The member list is fixed at construction and identical on every node,
//! so [`Membership::home_of`] agrees everywhere.  Liveness is local
//! opinion: node A may consider C dead while B still talks to it.
//!
//! ```text
//!        timeout             retries exhausted
//! Alive ─────────→ Suspected ─────────────────→ Dead
//!   ↑                  │ reply                   │ Rejoin
//!   └──────────────────┴─────────────────────────┘
//! ```

use crate::config::HomeStrategy;
use crate::verified::home::{hashed_home, interleaved_home};
use crate::{read, write};
use hyperkernel_protocol::{NodeId, PageNumber};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    Alive,
    Suspected,
    Dead,
}

#[derive(Debug, Clone)]
struct PeerInfo {
    liveness: Liveness,
    /// Placement decisions left during which this peer is treated as
    /// having no idle slot.
    saturation_hint: u32,
}

#[derive(Debug)]
pub struct Membership {
    local: NodeId,
    members: Vec<NodeId>,
    strategy: HomeStrategy,
    peers: RwLock<HashMap<NodeId, PeerInfo>>,
}

impl Membership {
    /// `members` must include `local`.  Order does not matter.
    pub fn new(local: NodeId, members: &[NodeId], strategy: HomeStrategy) -> Self {
        let mut members = members.to_vec();
        members.sort();
        members.dedup();
        debug_assert!(members.contains(&local), "local node must be a member");

        let peers = members
            .iter()
            .filter(|&&n| n != local)
            .map(|&n| {
                (
                    n,
                    PeerInfo {
                        liveness: Liveness::Alive,
                        saturation_hint: 0,
                    },
                )
            })
            .collect();

        Self {
            local,
            members,
            strategy,
            peers: RwLock::new(peers),
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Every member except the local node.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |&n| n != self.local)
    }

    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }

    /// Node statically responsible for `page`.
    pub fn home_of(&self, page: PageNumber) -> NodeId {
        let index = match self.strategy {
            HomeStrategy::Hashed => hashed_home(page.0, self.members.len()),
            HomeStrategy::Interleaved => interleaved_home(page.0, self.members.len()),
        };
        self.members[index]
    }

    pub fn is_home(&self, page: PageNumber) -> bool {
        self.home_of(page) == self.local
    }

    /// `None` for non-members.  The local node is always alive.
    pub fn liveness(&self, node: NodeId) -> Option<Liveness> {
        if node == self.local {
            return Some(Liveness::Alive);
        }
        read(&self.peers).get(&node).map(|p| p.liveness)
    }

    pub fn is_dead(&self, node: NodeId) -> bool {
        self.liveness(node) == Some(Liveness::Dead)
    }

    /// Alive → Suspected.  Returns whether the state changed.
    pub fn suspect(&self, node: NodeId) -> bool {
        self.transition(node, |l| (l == Liveness::Alive).then_some(Liveness::Suspected))
    }

    /// Anything → Dead.  Returns whether the state changed.
    pub fn declare_dead(&self, node: NodeId) -> bool {
        self.transition(node, |l| (l != Liveness::Dead).then_some(Liveness::Dead))
    }

    /// Anything → Alive.  Returns whether the state changed.
    pub fn mark_alive(&self, node: NodeId) -> bool {
        self.transition(node, |l| (l != Liveness::Alive).then_some(Liveness::Alive))
    }

    /// Record that `node` refused a vCPU for lack of slots.
    pub fn mark_saturated(&self, node: NodeId, decisions: u32) {
        if let Some(peer) = write(&self.peers).get_mut(&node) {
            peer.saturation_hint = decisions;
        }
    }

    /// Whether `node` should be skipped as a migration target.  Each call
    /// counts as one placement decision.
    pub fn consult_saturation(&self, node: NodeId) -> bool {
        match write(&self.peers).get_mut(&node) {
            Some(peer) if peer.saturation_hint > 0 => {
                peer.saturation_hint -= 1;
                true
            }
            _ => false,
        }
    }

    /// Liveness of every peer, sorted by node.
    pub fn view(&self) -> Vec<(NodeId, Liveness)> {
        let peers = read(&self.peers);
        let mut view: Vec<_> = peers.iter().map(|(&n, p)| (n, p.liveness)).collect();
        view.sort_by_key(|&(n, _)| n);
        view
    }

    fn transition(&self, node: NodeId, f: impl FnOnce(Liveness) -> Option<Liveness>) -> bool {
        let mut peers = write(&self.peers);
        let Some(peer) = peers.get_mut(&node) else {
            return false;
        };
        match f(peer.liveness) {
            Some(next) => {
                peer.liveness = next;
                true
            }
            None => false,
        }
    }
}
