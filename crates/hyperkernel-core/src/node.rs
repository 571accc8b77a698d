//! One machine of the federation: wires the engines together, answers
//! inbound protocol messages, and emulates the guest trap path.
//!
//! ```text
//!            ┌──────────────────────── Node ────────────────────────┐
//! guest ────→│ trap loop ─→ CoherenceEngine ─→ PageDirectory (home)  │
//!            │                 │      │                             │
//!            │           placement  MigrationEngine ─→ Hypervisor   │
//!            │                 │      │                             │
//!            │            LocalPages  VcpuTable                     │
//!            │                 └──────┴──→ PeerClient ──→ Transport ─┼──→ peers
//!            └──────────────────────────────────────────────────────┘
//! ```

use crate::coherence::{CoherenceEngine, FaultOutcome};
use crate::config::NodeConfig;
use crate::directory::PageDirectory;
use crate::error::{CoherenceError, MigrationError};
use crate::events::{ClusterEvent, EventLog};
use crate::hypervisor::Hypervisor;
use crate::membership::Membership;
use crate::migration::MigrationEngine;
use crate::pages::{Access, LocalPages};
use crate::snapshot::{DirectorySnapshot, LocalSnapshot};
use crate::stats::{NodeStats, StatsSnapshot};
use crate::transport::{MessageHandler, PeerClient, Transport};
use crate::vcpu::{VcpuState, VcpuTable};
use hyperkernel_protocol::{Message, NodeId, PageNumber, VcpuId, PAGE_SIZE};
use log::{info, warn};
use std::sync::Arc;

/// Result of a guest access through the trap path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestAccess<T> {
    Done(T),
    /// The vCPU was moved to `target` instead; the access must be
    /// replayed there.
    Migrated { target: NodeId },
}

pub struct Node {
    id: NodeId,
    config: NodeConfig,
    membership: Arc<Membership>,
    pages: Arc<LocalPages>,
    vcpus: Arc<VcpuTable>,
    hypervisor: Arc<dyn Hypervisor>,
    migration: Arc<MigrationEngine>,
    coherence: CoherenceEngine,
    events: Arc<EventLog>,
    stats: Arc<NodeStats>,
}

impl Node {
    pub fn new(
        id: NodeId,
        config: NodeConfig,
        members: &[NodeId],
        transport: Arc<dyn Transport>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Arc<Self> {
        let membership = Arc::new(Membership::new(id, members, config.home));
        let events = Arc::new(EventLog::new(id));
        let stats = Arc::new(NodeStats::default());
        let client = Arc::new(PeerClient::new(
            transport,
            Arc::clone(&membership),
            config.retry.clone(),
            Arc::clone(&events),
        ));
        let pages = Arc::new(LocalPages::new(config.directory_shards));
        let vcpus = Arc::new(VcpuTable::new(id, config.placement.window));
        let migration = Arc::new(MigrationEngine::new(
            Arc::clone(&vcpus),
            Arc::clone(&hypervisor),
            Arc::clone(&client),
            Arc::clone(&events),
            Arc::clone(&stats),
            config.placement.saturation_backoff,
        ));
        let coherence = CoherenceEngine::new(
            config.clone(),
            Arc::clone(&membership),
            Arc::clone(&pages),
            Arc::clone(&vcpus),
            Arc::clone(&migration),
            Arc::clone(&client),
            Arc::clone(&events),
            Arc::clone(&stats),
        );

        Arc::new(Self {
            id,
            config,
            membership,
            pages,
            vcpus,
            hypervisor,
            migration,
            coherence,
            events,
            stats,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn pages(&self) -> &LocalPages {
        &self.pages
    }

    // ── vCPUs ───────────────────────────────────────────────────

    /// Bring up a vCPU that has never run anywhere.
    pub fn start_vcpu(&self, vcpu: VcpuId, context: &[u8]) -> Result<(), MigrationError> {
        self.migration.admit(vcpu, context)?;
        info!("{}: started {vcpu}", self.id);
        Ok(())
    }

    /// Operator-initiated move.
    pub fn migrate(&self, vcpu: VcpuId, target: NodeId) -> Result<(), MigrationError> {
        self.migration.migrate(vcpu, target)
    }

    pub fn retry_stranded(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        self.migration.retry_stranded(vcpu)
    }

    pub fn pause_vcpu(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        self.vcpus.set_paused(vcpu, true)?;
        self.hypervisor.pause(vcpu)?;
        Ok(())
    }

    pub fn resume_vcpu(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        self.vcpus.set_paused(vcpu, false)?;
        self.hypervisor.resume(vcpu)?;
        Ok(())
    }

    pub fn vcpu_state(&self, vcpu: VcpuId) -> Option<VcpuState> {
        self.vcpus.state(vcpu)
    }

    pub fn resident_vcpus(&self) -> Vec<VcpuId> {
        self.vcpus.resident()
    }

    pub fn forwarded_to(&self, vcpu: VcpuId) -> Option<NodeId> {
        self.vcpus.forwarded_to(vcpu)
    }

    // ── Guest memory ────────────────────────────────────────────

    /// Load `len` bytes at `gpa` on behalf of `vcpu`.
    pub fn guest_read(
        &self,
        vcpu: VcpuId,
        gpa: u64,
        len: usize,
    ) -> Result<GuestAccess<Vec<u8>>, CoherenceError> {
        self.trap(Some(vcpu), gpa, len, Access::Read, |page, offset| {
            self.pages.read(page, offset, len)
        })
    }

    /// Store `bytes` at `gpa` on behalf of `vcpu`.
    pub fn guest_write(
        &self,
        vcpu: VcpuId,
        gpa: u64,
        bytes: &[u8],
    ) -> Result<GuestAccess<()>, CoherenceError> {
        self.trap(Some(vcpu), gpa, bytes.len(), Access::Write, |page, offset| {
            self.pages.write(page, offset, bytes).then_some(())
        })
    }

    /// Read outside any vCPU (device emulation, diagnostics).  Never
    /// migrates anything.
    pub fn host_read(&self, gpa: u64, len: usize) -> Result<Vec<u8>, CoherenceError> {
        let done = self.trap(None, gpa, len, Access::Read, |page, offset| {
            self.pages.read(page, offset, len)
        })?;
        Self::host_done(gpa, done)
    }

    pub fn host_write(&self, gpa: u64, bytes: &[u8]) -> Result<(), CoherenceError> {
        let done = self.trap(None, gpa, bytes.len(), Access::Write, |page, offset| {
            self.pages.write(page, offset, bytes).then_some(())
        })?;
        Self::host_done(gpa, done)
    }

    fn host_done<T>(gpa: u64, access: GuestAccess<T>) -> Result<T, CoherenceError> {
        match access {
            GuestAccess::Done(value) => Ok(value),
            GuestAccess::Migrated { target } => Err(CoherenceError::ProtocolViolation {
                page: PageNumber::containing(gpa),
                detail: format!("host access moved to {target}"),
            }),
        }
    }

    /// Make sure this node holds `page` with at least `access`.
    pub fn access(&self, page: PageNumber, access: Access) -> Result<FaultOutcome, CoherenceError> {
        self.coherence.handle_fault(None, page, access)
    }

    /// Try the access, fault on a miss, try again.
    fn trap<T>(
        &self,
        vcpu: Option<VcpuId>,
        gpa: u64,
        len: usize,
        access: Access,
        op: impl Fn(PageNumber, usize) -> Option<T>,
    ) -> Result<GuestAccess<T>, CoherenceError> {
        let page = PageNumber::containing(gpa);
        let offset = (gpa % PAGE_SIZE as u64) as usize;
        if len == 0 || len > PAGE_SIZE - offset {
            return Err(CoherenceError::InvalidAccess { gpa, len });
        }

        let attempts = self.config.max_stale_refaults.saturating_add(1);
        for _ in 0..attempts {
            if let Some(vcpu) = vcpu {
                if !self.vcpus.may_resume(vcpu) {
                    return Err(CoherenceError::NotRunnable { vcpu });
                }
            }
            if let Some(value) = op(page, offset) {
                return Ok(GuestAccess::Done(value));
            }
            if let FaultOutcome::Migrated { target } =
                self.coherence.handle_fault(vcpu, page, access)?
            {
                return Ok(GuestAccess::Migrated { target });
            }
        }
        Err(CoherenceError::StaleVersion {
            page,
            refaults: attempts,
        })
    }

    // ── Recovery ────────────────────────────────────────────────

    /// Announce this node to every peer and drop cached copies the homes
    /// no longer vouch for.  Returns the number of copies dropped.
    pub fn recover(&self) -> usize {
        for peer in self.membership.peers() {
            if let Err(e) = self.coherence.announce(peer) {
                warn!("{}: rejoin with {peer}: {e}", self.id);
            }
        }
        self.coherence.revalidate(None)
    }

    // ── Diagnostics ─────────────────────────────────────────────

    /// Directory entries of the pages homed here.
    pub fn directory(&self) -> &PageDirectory {
        self.coherence.directory()
    }

    pub fn directory_snapshot(&self) -> DirectorySnapshot {
        self.coherence.directory().snapshot()
    }

    pub fn local_snapshot(&self) -> LocalSnapshot {
        LocalSnapshot {
            node: self.id,
            pages: self.pages.snapshot(),
            vcpus: self.vcpus.snapshot(),
            peers: self.membership.view(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn drain_events(&self) -> Vec<ClusterEvent> {
        self.events.drain()
    }
}

impl MessageHandler for Node {
    fn handle(&self, from: NodeId, msg: Message) -> Message {
        match msg {
            Message::VcpuMigrate {
                vcpu,
                epoch,
                hops,
                context,
            } => self
                .migration
                .handle_incoming(from, vcpu, epoch, hops, &context),
            other => self.coherence.handle(from, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::SimNetwork;
    use crate::error::HypervisorError;
    use crate::hypervisor::SimHypervisor;
    use hyperkernel_protocol::RejectReason;

    /// A one-node federation: every page is homed locally.
    fn solo() -> (Arc<Node>, Arc<SimHypervisor>) {
        let hv = Arc::new(SimHypervisor::new(2));
        let node = Node::new(
            NodeId(0),
            NodeConfig::default(),
            &[NodeId(0)],
            Arc::new(SimNetwork::new(0)),
            hv.clone(),
        );
        (node, hv)
    }

    #[test]
    fn untouched_memory_reads_zero() {
        let (node, _) = solo();
        node.start_vcpu(VcpuId(0), &SimHypervisor::initial_context(VcpuId(0)))
            .unwrap();
        assert_eq!(
            node.guest_read(VcpuId(0), 0x1000, 4).unwrap(),
            GuestAccess::Done(vec![0; 4])
        );
    }

    #[test]
    fn write_then_read_back() {
        let (node, _) = solo();
        node.start_vcpu(VcpuId(0), &SimHypervisor::initial_context(VcpuId(0)))
            .unwrap();
        node.guest_write(VcpuId(0), 0x2010, b"abc").unwrap();
        assert_eq!(
            node.guest_read(VcpuId(0), 0x2010, 3).unwrap(),
            GuestAccess::Done(b"abc".to_vec())
        );

        let snap = node.directory_snapshot();
        let entry = snap.get(PageNumber(2)).unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(
            entry.state,
            crate::directory::PageState::Exclusive { owner: NodeId(0) }
        );
        assert_eq!(node.stats().write_grants, 1);
    }

    #[test]
    fn access_across_page_boundary_is_rejected() {
        let (node, _) = solo();
        assert_eq!(
            node.host_write(4094, &[1, 2, 3]),
            Err(CoherenceError::InvalidAccess { gpa: 4094, len: 3 })
        );
        assert_eq!(
            node.host_read(4095, usize::MAX),
            Err(CoherenceError::InvalidAccess {
                gpa: 4095,
                len: usize::MAX
            })
        );
        assert!(node.host_read(0, 0).is_err());
    }

    #[test]
    fn paused_vcpu_cannot_access_memory() {
        let (node, hv) = solo();
        node.start_vcpu(VcpuId(1), &SimHypervisor::initial_context(VcpuId(1)))
            .unwrap();
        assert!(hv.is_running(VcpuId(1)));
        node.pause_vcpu(VcpuId(1)).unwrap();
        assert!(!hv.is_running(VcpuId(1)));
        assert_eq!(
            node.guest_read(VcpuId(1), 0, 1),
            Err(CoherenceError::NotRunnable { vcpu: VcpuId(1) })
        );
        node.resume_vcpu(VcpuId(1)).unwrap();
        assert!(node.guest_read(VcpuId(1), 0, 1).is_ok());
    }

    #[test]
    fn migrate_to_self_is_a_no_op() {
        let (node, _) = solo();
        node.start_vcpu(VcpuId(0), &SimHypervisor::initial_context(VcpuId(0)))
            .unwrap();
        node.migrate(VcpuId(0), NodeId(0)).unwrap();
        assert_eq!(node.vcpu_state(VcpuId(0)), Some(VcpuState::Running));

        node.pause_vcpu(VcpuId(0)).unwrap();
        assert_eq!(
            node.migrate(VcpuId(0), NodeId(0)),
            Err(MigrationError::NotRunning {
                vcpu: VcpuId(0),
                node: NodeId(0)
            })
        );
        assert_eq!(node.vcpu_state(VcpuId(0)), Some(VcpuState::Paused));
        assert_eq!(
            node.migrate(VcpuId(5), NodeId(0)),
            Err(MigrationError::NotResident {
                vcpu: VcpuId(5),
                node: NodeId(0)
            })
        );
    }

    /// Accepts contexts but can never start a vCPU.
    struct StuckHypervisor(SimHypervisor);

    impl Hypervisor for StuckHypervisor {
        fn claim_slot(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
            self.0.claim_slot(vcpu)
        }
        fn release_slot(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
            self.0.release_slot(vcpu)
        }
        fn pause(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
            self.0.pause(vcpu)
        }
        fn capture_context(&self, vcpu: VcpuId) -> Result<Vec<u8>, HypervisorError> {
            self.0.capture_context(vcpu)
        }
        fn inject_context(&self, vcpu: VcpuId, context: &[u8]) -> Result<(), HypervisorError> {
            self.0.inject_context(vcpu, context)
        }
        fn resume(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
            Err(HypervisorError::UnknownVcpu(vcpu))
        }
        fn free_slots(&self) -> usize {
            self.0.free_slots()
        }
    }

    #[test]
    fn arrival_that_cannot_start_goes_back() {
        let members = [NodeId(0), NodeId(1)];
        let network = Arc::new(SimNetwork::new(0));
        let stuck = Arc::new(StuckHypervisor(SimHypervisor::new(2)));
        let healthy = Arc::new(SimHypervisor::new(2));
        let target = Node::new(
            NodeId(0),
            NodeConfig::default(),
            &members,
            network.clone(),
            stuck.clone(),
        );
        let source = Node::new(
            NodeId(1),
            NodeConfig::default(),
            &members,
            network.clone(),
            healthy.clone(),
        );
        for node in [&target, &source] {
            let handler: Arc<dyn MessageHandler> = node.clone();
            network.register(node.id(), Arc::downgrade(&handler));
        }

        let v = VcpuId(3);
        source
            .start_vcpu(v, &SimHypervisor::initial_context(v))
            .unwrap();
        assert_eq!(
            source.migrate(v, NodeId(0)),
            Err(MigrationError::Rejected {
                vcpu: v,
                target: NodeId(0),
                reason: RejectReason::BadContext
            })
        );

        assert_eq!(source.vcpu_state(v), Some(VcpuState::Running));
        assert!(healthy.is_running(v));
        assert_eq!(target.vcpu_state(v), None);
        assert_eq!(stuck.0.occupied(), 0);
        assert_eq!(target.stats().migrations_in, 0);

        // The refused epoch is not remembered as landed.
        assert!(matches!(
            target.handle(
                NodeId(1),
                Message::VcpuMigrate {
                    vcpu: v,
                    epoch: 1,
                    hops: 0,
                    context: SimHypervisor::initial_context(v),
                },
            ),
            Message::MigrateNack { .. }
        ));
    }

    #[test]
    fn local_snapshot_lists_copies_and_vcpus() {
        let (node, _) = solo();
        node.start_vcpu(VcpuId(0), &SimHypervisor::initial_context(VcpuId(0)))
            .unwrap();
        node.host_read(0x3000, 8).unwrap();
        let snap = node.local_snapshot();
        assert_eq!(snap.pages.len(), 1);
        assert_eq!(snap.pages[0].access, Access::Read);
        assert_eq!(snap.vcpus.len(), 1);
        assert!(snap.peers.is_empty());
        assert!(serde_json::to_string(&snap).is_ok());
    }
}
