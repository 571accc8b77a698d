//! In-process federation for tests and the simulator, and the
//! cluster-wide safety checks run against it.
//!
//! ```text
//!  FaultEngine ──poll(frames sent)──→ Cluster::apply_fault
//!                                       ├─ network, crash   → SimNetwork
//!                                       ├─ slot exhaustion  → SimHypervisor
//!                                       └─ heal, recover    → Node::recover
//!
//!  Node 0 ──┐
//!  Node 1 ──┼── SimNetwork (weak handler refs) ── one shared fault model
//!  Node 2 ──┘
//! ```
//!
//! Node index `i` is `NodeId(i)` everywhere, which is how fault targets
//! name nodes.
//!
//! The checks are pure functions of a [`ClusterSnapshot`] and return
//! their violations rather than panicking, so the simulator can feed
//! them to the property oracle.

use crate::config::{ConfigError, NodeConfig};
use crate::directory::PageState;
use crate::error::MigrationError;
use crate::fabric::SimNetwork;
use crate::hypervisor::SimHypervisor;
use crate::membership::Liveness;
use crate::node::Node;
use crate::pages::Access;
use crate::snapshot::{ClusterSnapshot, DirectoryEntrySnapshot};
use crate::transport::MessageHandler;
use crate::vcpu::VcpuState;
use hyperkernel_fault::engine::FaultEngine;
use hyperkernel_fault::Fault;
use hyperkernel_protocol::{NodeId, PageNumber, VcpuId};
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub num_nodes: usize,
    /// Execution slots per simulated hypervisor.
    pub slots_per_node: usize,
    /// Seeds the network fault model.
    pub seed: u64,
    /// Same for every node.
    pub node: NodeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_nodes: 3,
            slots_per_node: 4,
            seed: 42,
            node: NodeConfig::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Cluster
// ═══════════════════════════════════════════════════════════════════════

pub struct Cluster {
    seed: u64,
    network: Arc<SimNetwork>,
    nodes: Vec<Arc<Node>>,
    hypervisors: Vec<Arc<SimHypervisor>>,
}

impl Cluster {
    pub fn new(config: &ClusterConfig) -> Result<Self, ConfigError> {
        if config.num_nodes == 0 {
            return Err(ConfigError::Invalid {
                reason: "a cluster needs at least one node".to_string(),
            });
        }
        config.node.validate()?;

        let network = Arc::new(SimNetwork::new(config.seed));
        let members: Vec<NodeId> = (0..config.num_nodes as u32).map(NodeId).collect();
        let mut nodes = Vec::with_capacity(members.len());
        let mut hypervisors = Vec::with_capacity(members.len());

        for &id in &members {
            let hypervisor = Arc::new(SimHypervisor::new(config.slots_per_node));
            let node = Node::new(
                id,
                config.node.clone(),
                &members,
                network.clone(),
                hypervisor.clone(),
            );
            let handler: Arc<dyn MessageHandler> = node.clone();
            network.register(id, Arc::downgrade(&handler));
            nodes.push(node);
            hypervisors.push(hypervisor);
        }

        info!(
            "cluster up: {} nodes, {} slots each, seed {}",
            config.num_nodes, config.slots_per_node, config.seed
        );
        Ok(Self {
            seed: config.seed,
            network,
            nodes,
            hypervisors,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// # Panics
    ///
    /// If `index` is not a node of this cluster.
    pub fn node(&self, index: usize) -> &Arc<Node> {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// # Panics
    ///
    /// If `index` is not a node of this cluster.
    pub fn hypervisor(&self, index: usize) -> &SimHypervisor {
        &self.hypervisors[index]
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn is_crashed(&self, index: usize) -> bool {
        self.network.is_crashed(NodeId(index as u32))
    }

    /// Bring up `vcpu` on node `index` with a fresh context.
    pub fn start_vcpu(&self, vcpu: VcpuId, index: usize) -> Result<(), MigrationError> {
        self.nodes[index].start_vcpu(vcpu, &SimHypervisor::initial_context(vcpu))
    }

    /// Every node that holds `vcpu` in any state.
    pub fn locate(&self, vcpu: VcpuId) -> Vec<(NodeId, VcpuState)> {
        self.nodes
            .iter()
            .filter_map(|n| n.vcpu_state(vcpu).map(|s| (n.id(), s)))
            .collect()
    }

    // ── Faults ──────────────────────────────────────────────────

    /// Apply every fault `engine` has due at the current frame count.
    pub fn apply_due_faults(&self, engine: &mut FaultEngine) -> Vec<Fault> {
        let faults = engine.poll_faults(self.network.messages_sent());
        for fault in &faults {
            self.apply_fault(fault);
        }
        faults
    }

    pub fn apply_fault(&self, fault: &Fault) {
        info!("applying {fault}");
        match fault {
            Fault::SlotExhaustion { target } | Fault::SlotRestore { target } => {
                match self.hypervisors.get(*target) {
                    Some(hv) => hv.set_exhausted(matches!(fault, Fault::SlotExhaustion { .. })),
                    None => warn!("{fault}: no node {target}"),
                }
            }
            Fault::NodeRecover { target } => {
                self.network.apply_fault(fault);
                match self.nodes.get(*target) {
                    Some(node) => {
                        let dropped = node.recover();
                        info!("{} rejoined, {dropped} stale copies dropped", node.id());
                    }
                    None => warn!("{fault}: no node {target}"),
                }
            }
            Fault::NetworkHeal => {
                self.network.apply_fault(fault);
                self.recover_all();
            }
            _ => {
                self.network.apply_fault(fault);
            }
        }
    }

    /// Clear every network fault and have each running node rejoin.
    pub fn heal(&self) {
        self.apply_fault(&Fault::NetworkHeal);
    }

    fn recover_all(&self) {
        for (i, node) in self.nodes.iter().enumerate() {
            if !self.is_crashed(i) {
                node.recover();
            }
        }
    }

    // ── Inspection ──────────────────────────────────────────────

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            seed: self.seed,
            directories: self.nodes.iter().map(|n| n.directory_snapshot()).collect(),
            nodes: self.nodes.iter().map(|n| n.local_snapshot()).collect(),
        }
    }

    /// Snapshot the cluster and run every check on it.
    pub fn check_invariants(&self, watch: &mut VersionWatch) -> Vec<Violation> {
        check_snapshot(&self.snapshot(), watch)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Safety checks (pure, return violations)
// ═══════════════════════════════════════════════════════════════════════

pub const SINGLE_WRITER: &str = "single-writer";
pub const COPIES_AGREE: &str = "copies-agree-with-home";
pub const SINGLE_LOCATION: &str = "vcpu-single-location";
pub const VERSIONS_MONOTONIC: &str = "versions-monotonic";

/// Every property [`check_snapshot`] evaluates.
pub const PROPERTIES: [&str; 4] = [SINGLE_WRITER, COPIES_AGREE, SINGLE_LOCATION, VERSIONS_MONOTONIC];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub property: &'static str,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.property, self.detail)
    }
}

/// A cached copy its home does not account for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyMismatch {
    pub node: NodeId,
    pub page: PageNumber,
    pub copy_version: u64,
    /// `None` if the home has no entry for the page at all.
    pub home_version: Option<u64>,
}

/// Run every check; `watch` carries version history between calls.
pub fn check_snapshot(snapshot: &ClusterSnapshot, watch: &mut VersionWatch) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (page, writers) in check_single_writer(snapshot) {
        violations.push(Violation {
            property: SINGLE_WRITER,
            detail: format!("{page} writable on {writers:?}"),
        });
    }
    for m in check_copies_agree(snapshot) {
        violations.push(Violation {
            property: COPIES_AGREE,
            detail: format!(
                "{} holds {} v{}, home has {:?}",
                m.node, m.page, m.copy_version, m.home_version
            ),
        });
    }
    for (vcpu, nodes) in check_single_location(snapshot) {
        violations.push(Violation {
            property: SINGLE_LOCATION,
            detail: format!("{vcpu} runnable on {nodes:?}"),
        });
    }
    for (page, before, now) in watch.observe(snapshot) {
        violations.push(Violation {
            property: VERSIONS_MONOTONIC,
            detail: format!("{page} went from v{before} to v{now}"),
        });
    }
    violations
}

/// At most one node holds a writable copy of any page.
pub fn check_single_writer(snapshot: &ClusterSnapshot) -> Vec<(PageNumber, Vec<NodeId>)> {
    let mut writers: BTreeMap<PageNumber, Vec<NodeId>> = BTreeMap::new();
    for node in &snapshot.nodes {
        for copy in node.pages.iter().filter(|c| c.access == Access::Write && !c.poisoned) {
            writers.entry(copy.page).or_default().push(node.node);
        }
    }
    writers.into_iter().filter(|(_, w)| w.len() > 1).collect()
}

/// Every copy on a node its home still counts as alive matches the
/// home's directory entry.
///
/// A node the home has declared dead may hold stale copies until it
/// rejoins; those are skipped.  An owner whose write grant never arrived
/// may still hold the read-only copy from one version earlier.
pub fn check_copies_agree(snapshot: &ClusterSnapshot) -> Vec<CopyMismatch> {
    let mut mismatches = Vec::new();
    for node in &snapshot.nodes {
        for copy in node.pages.iter().filter(|c| !c.poisoned) {
            let mismatch = |home_version| CopyMismatch {
                node: node.node,
                page: copy.page,
                copy_version: copy.version,
                home_version,
            };
            let Some((home, entry)) = home_entry(snapshot, copy.page) else {
                mismatches.push(mismatch(None));
                continue;
            };
            if considers_dead(snapshot, home, node.node) {
                continue;
            }
            let agrees = match copy.version.cmp(&entry.version) {
                Ordering::Equal => entry.state.permits_copy(node.node),
                Ordering::Less => {
                    copy.access == Access::Read
                        && entry.state == (PageState::Exclusive { owner: node.node })
                }
                Ordering::Greater => false,
            };
            if !agrees {
                mismatches.push(mismatch(Some(entry.version)));
            }
        }
    }
    mismatches
}

fn home_entry(snapshot: &ClusterSnapshot, page: PageNumber) -> Option<(NodeId, &DirectoryEntrySnapshot)> {
    snapshot
        .directories
        .iter()
        .find_map(|d| d.get(page).map(|e| (d.home, e)))
}

/// Whether `observer` has declared `node` dead.
fn considers_dead(snapshot: &ClusterSnapshot, observer: NodeId, node: NodeId) -> bool {
    snapshot
        .nodes
        .iter()
        .find(|n| n.node == observer)
        .and_then(|n| n.peers.iter().find(|(peer, _)| *peer == node))
        .is_some_and(|&(_, liveness)| liveness == Liveness::Dead)
}

/// No vCPU is runnable (running or paused) on two nodes.
pub fn check_single_location(snapshot: &ClusterSnapshot) -> Vec<(VcpuId, Vec<NodeId>)> {
    let mut resident: BTreeMap<VcpuId, Vec<NodeId>> = BTreeMap::new();
    for node in &snapshot.nodes {
        for v in &node.vcpus {
            if matches!(v.state, VcpuState::Running | VcpuState::Paused) {
                resident.entry(v.vcpu).or_default().push(node.node);
            }
        }
    }
    resident.into_iter().filter(|(_, n)| n.len() > 1).collect()
}

/// vCPUs from `expected` that no node holds in any state.
pub fn check_vcpus_accounted(snapshot: &ClusterSnapshot, expected: &[VcpuId]) -> Vec<VcpuId> {
    expected
        .iter()
        .copied()
        .filter(|vcpu| {
            !snapshot
                .nodes
                .iter()
                .any(|n| n.vcpus.iter().any(|v| v.vcpu == *vcpu))
        })
        .collect()
}

/// Remembers the highest directory version seen per page.
#[derive(Debug, Default)]
pub struct VersionWatch {
    highest: BTreeMap<PageNumber, u64>,
}

impl VersionWatch {
    /// Pages whose directory version went backwards since the last
    /// observation, as `(page, highest seen, now)`.
    pub fn observe(&mut self, snapshot: &ClusterSnapshot) -> Vec<(PageNumber, u64, u64)> {
        let mut regressions = Vec::new();
        for entry in snapshot.directories.iter().flat_map(|d| &d.entries) {
            let highest = self.highest.entry(entry.page).or_insert(entry.version);
            match entry.version.cmp(highest) {
                Ordering::Less => regressions.push((entry.page, *highest, entry.version)),
                Ordering::Greater => *highest = entry.version,
                Ordering::Equal => {}
            }
        }
        regressions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HomeStrategy, PlacementConfig, RetryPolicy};
    use crate::error::CoherenceError;
    use crate::events::ClusterEvent;
    use crate::node::GuestAccess;
    use crate::snapshot::DirectorySnapshot;
    use hyperkernel_protocol::{Message, NackReason, RejectReason, PAGE_SIZE};
    use std::collections::BTreeSet;
    use std::thread;

    const V: VcpuId = VcpuId(0);

    /// Interleaved homes (`page % nodes`), fast retries, no placement.
    fn config(nodes: usize) -> ClusterConfig {
        ClusterConfig {
            num_nodes: nodes,
            slots_per_node: 4,
            seed: 7,
            node: NodeConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_backoff_us: 1,
                    max_backoff_us: 2,
                    timeout_ms: 1,
                },
                placement: PlacementConfig {
                    enabled: false,
                    ..Default::default()
                },
                home: HomeStrategy::Interleaved,
                directory_shards: 8,
                queue_wait_ms: 2_000,
                max_stale_refaults: 8,
            },
        }
    }

    fn cluster(nodes: usize) -> Cluster {
        Cluster::new(&config(nodes)).unwrap()
    }

    fn gpa(page: u64) -> u64 {
        PageNumber(page).base_address()
    }

    fn entry(cluster: &Cluster, home: usize, page: u64) -> DirectoryEntrySnapshot {
        cluster
            .node(home)
            .directory_snapshot()
            .get(PageNumber(page))
            .cloned()
            .unwrap()
    }

    fn sharers(nodes: &[u32]) -> PageState {
        PageState::Shared {
            sharers: nodes.iter().copied().map(NodeId).collect::<BTreeSet<_>>(),
        }
    }

    fn assert_invariants(cluster: &Cluster) {
        let violations = cluster.check_invariants(&mut VersionWatch::default());
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn empty_cluster_is_rejected() {
        let mut cfg = config(0);
        assert!(Cluster::new(&cfg).is_err());
        cfg.num_nodes = 1;
        cfg.node.directory_shards = 0;
        assert!(Cluster::new(&cfg).is_err());
    }

    // ── Coherence scenarios ─────────────────────────────────────

    #[test]
    fn reads_share_a_page() {
        let c = cluster(2);
        // Page 42 is homed at node0.
        assert_eq!(c.node(1).host_read(gpa(42), 4).unwrap(), vec![0; 4]);
        assert_eq!(c.node(0).host_read(gpa(42), 4).unwrap(), vec![0; 4]);

        let e = entry(&c, 0, 42);
        assert_eq!(e.state, sharers(&[0, 1]));
        assert_eq!(e.version, 0);
        assert_eq!(c.node(1).pages().access(PageNumber(42)), Some(Access::Read));
        assert_invariants(&c);
    }

    #[test]
    fn write_invalidates_other_sharers() {
        let c = cluster(2);
        c.node(1).host_read(gpa(42), 4).unwrap();
        c.node(0).host_read(gpa(42), 4).unwrap();

        c.node(0).host_write(gpa(42), b"new!").unwrap();
        let e = entry(&c, 0, 42);
        assert_eq!(e.state, PageState::Exclusive { owner: NodeId(0) });
        assert_eq!(e.version, 1);
        assert_eq!(c.node(1).pages().version(PageNumber(42)), None);
        assert_eq!(c.node(0).stats().invalidations_sent, 1);
        assert_eq!(c.node(1).stats().invalidations_received, 1);

        // The reader sees the new bytes and the writer is downgraded.
        assert_eq!(c.node(1).host_read(gpa(42), 4).unwrap(), b"new!".to_vec());
        let e = entry(&c, 0, 42);
        assert_eq!(e.state, sharers(&[0, 1]));
        assert_eq!(e.version, 1);
        assert_eq!(c.node(0).pages().access(PageNumber(42)), Some(Access::Read));
        assert_eq!(c.node(0).stats().recalls_sent, 1);
        assert_invariants(&c);
    }

    #[test]
    fn write_waits_behind_inflight_transition() {
        let c = cluster(2);
        // Page 7 is homed at node1.
        let home = c.node(1).directory();
        let token = home.begin_transition(PageNumber(7)).unwrap();

        thread::scope(|s| {
            let writer = s.spawn(|| c.node(0).host_write(gpa(7), b"x"));
            while home.queued(PageNumber(7)) == 0 {
                thread::yield_now();
            }
            assert_eq!(home.queued(PageNumber(7)), 1);
            home.abort(token);
            writer.join().unwrap().unwrap();
        });

        let e = entry(&c, 1, 7);
        assert_eq!(e.state, PageState::Exclusive { owner: NodeId(0) });
        assert_eq!(e.version, 1);
        assert_eq!(e.queued, 0);
        assert!(!e.busy);
    }

    #[test]
    fn concurrent_writers_never_lose_updates() {
        let mut cfg = config(3);
        cfg.node.max_stale_refaults = 64;
        let c = Cluster::new(&cfg).unwrap();
        // Page 5 is homed at node2; each writer owns one byte of it.
        let writers = [0usize, 1, 2, 0];

        thread::scope(|s| {
            for (offset, &node) in writers.iter().enumerate() {
                let c = &c;
                s.spawn(move || {
                    for round in 1..=20u8 {
                        c.node(node)
                            .host_write(gpa(5) + offset as u64, &[round])
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(c.node(1).host_read(gpa(5), 4).unwrap(), vec![20; 4]);
        assert!(entry(&c, 2, 5).version >= 2);
        assert_invariants(&c);
    }

    // ── Migration scenarios ─────────────────────────────────────

    #[test]
    fn vcpu_moves_with_its_context() {
        let c = cluster(2);
        c.start_vcpu(V, 1).unwrap();
        let mut context = SimHypervisor::initial_context(V);
        context[12] = 0xAB;
        c.hypervisor(1).set_context(V, context.clone()).unwrap();

        c.node(1).migrate(V, NodeId(0)).unwrap();
        assert_eq!(c.locate(V), vec![(NodeId(0), VcpuState::Running)]);
        assert_eq!(c.node(1).forwarded_to(V), Some(NodeId(0)));
        assert_eq!(c.hypervisor(0).context(V), Some(context));
        assert!(c.hypervisor(0).is_running(V));
        assert_eq!(c.hypervisor(1).occupied(), 0);
        assert_eq!(c.node(0).resident_vcpus(), vec![V]);
        assert!(c.node(1).resident_vcpus().is_empty());
        assert_eq!(c.node(1).stats().migrations_out, 1);
        assert_eq!(c.node(0).stats().migrations_in, 1);

        // Asking the holder to move it to itself changes nothing; asking
        // the old node fails.
        c.node(0).migrate(V, NodeId(0)).unwrap();
        assert_eq!(
            c.node(1).migrate(V, NodeId(0)),
            Err(MigrationError::NotResident {
                vcpu: V,
                node: NodeId(1)
            })
        );
        assert_invariants(&c);
    }

    #[test]
    fn refused_migration_resumes_on_source() {
        let c = cluster(2);
        c.start_vcpu(V, 1).unwrap();
        c.apply_fault(&Fault::SlotExhaustion { target: 0 });

        assert_eq!(
            c.node(1).migrate(V, NodeId(0)),
            Err(MigrationError::Rejected {
                vcpu: V,
                target: NodeId(0),
                reason: RejectReason::NoIdleSlot
            })
        );
        assert_eq!(c.locate(V), vec![(NodeId(1), VcpuState::Running)]);
        assert!(c.hypervisor(1).is_running(V));
        assert_eq!(c.node(1).stats().migrations_refused, 1);
        assert!(c.node(1).drain_events().contains(&ClusterEvent::MigrationRefused {
            vcpu: V,
            target: NodeId(0),
            reason: RejectReason::NoIdleSlot
        }));

        c.apply_fault(&Fault::SlotRestore { target: 0 });
        c.node(1).migrate(V, NodeId(0)).unwrap();
        assert_eq!(c.locate(V), vec![(NodeId(0), VcpuState::Running)]);
    }

    #[test]
    fn stranded_vcpu_is_retried_after_recovery() {
        let c = cluster(2);
        c.start_vcpu(V, 1).unwrap();
        c.apply_fault(&Fault::NodeCrash { target: 0 });

        assert_eq!(
            c.node(1).migrate(V, NodeId(0)),
            Err(MigrationError::Unacknowledged {
                vcpu: V,
                target: NodeId(0)
            })
        );
        let stranded = VcpuState::Migrating {
            target: NodeId(0),
            epoch: 1,
            stranded: true,
        };
        assert_eq!(c.node(1).vcpu_state(V), Some(stranded));
        assert_eq!(
            c.node(1).guest_read(V, 0, 1),
            Err(CoherenceError::NotRunnable { vcpu: V })
        );
        assert!(c
            .node(1)
            .drain_events()
            .contains(&ClusterEvent::MigrationFailed {
                vcpu: V,
                target: NodeId(0)
            }));

        // Moving it "here" is not a way out of the stranded state.
        assert_eq!(
            c.node(1).migrate(V, NodeId(1)),
            Err(MigrationError::Stranded {
                vcpu: V,
                target: NodeId(0)
            })
        );
        assert_eq!(c.node(1).vcpu_state(V), Some(stranded));
        assert!(!c.hypervisor(1).is_running(V));

        // Still down: the retry strands it again.
        assert!(c.node(1).retry_stranded(V).is_err());
        assert_eq!(c.node(1).vcpu_state(V), Some(stranded));

        c.apply_fault(&Fault::NodeRecover { target: 0 });
        c.node(1).retry_stranded(V).unwrap();
        assert_eq!(c.locate(V), vec![(NodeId(0), VcpuState::Running)]);
        assert_invariants(&c);
    }

    #[test]
    fn repeated_handoff_is_acknowledged_once() {
        let c = cluster(2);
        let handoff = |epoch| Message::VcpuMigrate {
            vcpu: V,
            epoch,
            hops: 0,
            context: SimHypervisor::initial_context(V),
        };

        assert_eq!(
            c.node(0).handle(NodeId(1), handoff(3)),
            Message::MigrateAck { vcpu: V }
        );
        assert_eq!(
            c.node(0).handle(NodeId(1), handoff(3)),
            Message::MigrateAck { vcpu: V }
        );
        assert_eq!(
            c.node(0).handle(NodeId(1), handoff(2)),
            Message::MigrateAck { vcpu: V }
        );
        assert_eq!(c.hypervisor(0).occupied(), 1);
        assert_eq!(c.node(0).stats().migrations_in, 1);
        assert_eq!(c.locate(V), vec![(NodeId(0), VcpuState::Running)]);
    }

    #[test]
    fn hot_remote_pages_pull_the_vcpu() {
        let mut cfg = config(2);
        cfg.node.placement = PlacementConfig {
            enabled: true,
            hot_page_threshold: 3,
            window: 8,
            min_dwell: 0,
            bounce_dwell_multiplier: 1,
            saturation_backoff: 4,
        };
        let c = Cluster::new(&cfg).unwrap();
        c.start_vcpu(V, 1).unwrap();

        // Even pages are homed at node0.
        assert!(matches!(c.node(1).guest_read(V, gpa(0), 1), Ok(GuestAccess::Done(_))));
        assert!(matches!(c.node(1).guest_read(V, gpa(2), 1), Ok(GuestAccess::Done(_))));
        assert_eq!(
            c.node(1).guest_read(V, gpa(4), 1),
            Ok(GuestAccess::Migrated { target: NodeId(0) })
        );

        assert_eq!(c.locate(V), vec![(NodeId(0), VcpuState::Running)]);
        assert_eq!(
            c.node(0).guest_read(V, gpa(4), 1),
            Ok(GuestAccess::Done(vec![0]))
        );
        let snap = c.node(0).local_snapshot();
        assert_eq!(snap.vcpus[0].hops, 1);
        assert_eq!(snap.vcpus[0].epoch, 1);
    }

    // ── Failure scenarios ───────────────────────────────────────

    #[test]
    fn crashed_home_surfaces_as_unreachable() {
        let c = cluster(3);
        c.apply_fault(&Fault::NodeCrash { target: 2 });

        let unreachable = Err(CoherenceError::NodeUnreachable {
            node: NodeId(2),
            page: PageNumber(2),
        });
        assert_eq!(c.node(0).host_read(gpa(2), 1), unreachable);
        assert!(c
            .node(0)
            .drain_events()
            .contains(&ClusterEvent::NodeUnreachable { node: NodeId(2) }));
        assert!(c.node(0).membership().is_dead(NodeId(2)));

        // Dead homes fail fast.
        let sent = c.network().messages_sent();
        assert_eq!(c.node(0).host_read(gpa(2), 1), unreachable);
        assert_eq!(c.network().messages_sent(), sent);
    }

    #[test]
    fn dead_sharer_is_evicted() {
        let c = cluster(3);
        c.node(1).host_read(gpa(0), 1).unwrap();
        c.node(2).host_read(gpa(0), 1).unwrap();
        c.apply_fault(&Fault::NodeCrash { target: 2 });

        c.node(1).host_write(gpa(0), b"w").unwrap();
        let e = entry(&c, 0, 0);
        assert_eq!(e.state, PageState::Exclusive { owner: NodeId(1) });
        assert_eq!(e.version, 1);
        assert!(c.node(0).drain_events().contains(&ClusterEvent::SharerEvicted {
            page: PageNumber(0),
            sharer: NodeId(2)
        }));
        // node2's old copy is stale, but node0 no longer vouches for it.
        assert_eq!(c.node(2).pages().version(PageNumber(0)), Some(0));
        assert_invariants(&c);
    }

    /// Answers everything with a refusal.
    struct Refuser;

    impl MessageHandler for Refuser {
        fn handle(&self, _from: NodeId, msg: Message) -> Message {
            Message::Nack {
                page: msg.page().unwrap_or(PageNumber(0)),
                reason: NackReason::Violation,
            }
        }
    }

    #[test]
    fn unacknowledged_invalidate_blocks_the_write() {
        let c = cluster(3);
        c.node(1).host_read(gpa(0), 1).unwrap();

        let refuser: Arc<dyn MessageHandler> = Arc::new(Refuser);
        c.network().register(NodeId(1), Arc::downgrade(&refuser));
        assert!(matches!(
            c.node(2).host_write(gpa(0), b"w"),
            Err(CoherenceError::ProtocolViolation { .. })
        ));

        // node1 was neither evicted nor overtaken by a writer.
        let e = entry(&c, 0, 0);
        assert_eq!(e.state, sharers(&[1]));
        assert_eq!(e.version, 0);
        assert!(!e.busy);
        let events = c.node(0).drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ClusterEvent::ProtocolViolation { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ClusterEvent::SharerEvicted { .. })));
        assert_eq!(c.node(1).pages().version(PageNumber(0)), Some(0));
        assert_invariants(&c);

        let honest: Arc<dyn MessageHandler> = c.node(1).clone();
        c.network().register(NodeId(1), Arc::downgrade(&honest));
        c.node(2).host_write(gpa(0), b"w").unwrap();
        assert_eq!(entry(&c, 0, 0).state, PageState::Exclusive { owner: NodeId(2) });
        assert_eq!(c.node(1).pages().version(PageNumber(0)), None);
        assert_invariants(&c);
    }

    #[test]
    fn dead_owner_loses_page_until_it_rejoins() {
        let c = cluster(3);
        c.node(1).host_write(gpa(0), b"own").unwrap();
        c.apply_fault(&Fault::NodeCrash { target: 1 });

        let unreachable = Err(CoherenceError::NodeUnreachable {
            node: NodeId(1),
            page: PageNumber(0),
        });
        assert_eq!(c.node(2).host_read(gpa(0), 3), unreachable);
        assert_eq!(c.node(2).host_read(gpa(0), 3), unreachable);

        let lost = c
            .node(0)
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ClusterEvent::PageLost { .. }))
            .count();
        assert_eq!(lost, 1);
        assert!(entry(&c, 0, 0).lost);

        c.apply_fault(&Fault::NodeRecover { target: 1 });
        assert!(!entry(&c, 0, 0).lost);
        assert!(c
            .node(0)
            .drain_events()
            .contains(&ClusterEvent::NodeRejoined { node: NodeId(1) }));
        assert_eq!(c.node(2).host_read(gpa(0), 3).unwrap(), b"own".to_vec());
        assert_invariants(&c);
    }

    #[test]
    fn fenced_node_rejoins_and_drops_stale_copies() {
        let c = cluster(3);
        c.node(1).host_read(gpa(0), 2).unwrap();
        c.apply_fault(&Fault::NetworkPartition {
            side_a: vec![1],
            side_b: vec![0, 2],
        });

        c.node(2).host_write(gpa(0), b"v1").unwrap();
        assert!(c.node(0).membership().is_dead(NodeId(1)));
        assert_eq!(c.node(1).pages().version(PageNumber(0)), Some(0));
        assert_invariants(&c);

        // Heal the links only; node1 learns it was fenced on its next
        // request.
        c.network().heal();
        c.node(1).host_write(gpa(0) + 4, b"x").unwrap();

        assert!(c
            .node(0)
            .drain_events()
            .contains(&ClusterEvent::NodeRejoined { node: NodeId(1) }));
        assert!(c
            .node(1)
            .drain_events()
            .contains(&ClusterEvent::StaleCopyDropped {
                page: PageNumber(0),
                version: 0
            }));
        let e = entry(&c, 0, 0);
        assert_eq!(e.state, PageState::Exclusive { owner: NodeId(1) });
        assert_eq!(e.version, 2);
        assert_eq!(c.node(1).host_read(gpa(0), 2).unwrap(), b"v1".to_vec());
        assert_invariants(&c);
    }

    #[test]
    fn corrupted_links_look_like_a_dead_home() {
        let c = cluster(2);
        c.apply_fault(&Fault::PacketCorruption {
            target: 0,
            rate_ppm: 1_000_000,
        });
        assert_eq!(
            c.node(1).host_read(gpa(0), 1),
            Err(CoherenceError::NodeUnreachable {
                node: NodeId(0),
                page: PageNumber(0)
            })
        );
        assert!(c.network().frames_dropped() >= 2);

        c.heal();
        assert!(!c.node(1).membership().is_dead(NodeId(0)));
        assert_eq!(c.node(1).host_read(gpa(0), 1).unwrap(), vec![0]);
    }

    // ── Checks ──────────────────────────────────────────────────

    #[test]
    fn two_writable_copies_are_flagged() {
        let c = cluster(2);
        for i in 0..2 {
            c.node(i)
                .pages()
                .install(PageNumber(9), Access::Write, 1, vec![0; PAGE_SIZE]);
        }
        let snap = c.snapshot();
        assert_eq!(
            check_single_writer(&snap),
            vec![(PageNumber(9), vec![NodeId(0), NodeId(1)])]
        );
        // The home never handed these out.
        assert_eq!(check_copies_agree(&snap).len(), 2);
    }

    #[test]
    fn version_regression_is_flagged() {
        let snap = |version| ClusterSnapshot {
            seed: 0,
            directories: vec![DirectorySnapshot {
                home: NodeId(0),
                entries: vec![DirectoryEntrySnapshot {
                    page: PageNumber(3),
                    state: PageState::Exclusive { owner: NodeId(0) },
                    version,
                    lost: false,
                    busy: false,
                    queued: 0,
                }],
            }],
            nodes: Vec::new(),
        };
        let mut watch = VersionWatch::default();
        assert!(watch.observe(&snap(2)).is_empty());
        assert!(watch.observe(&snap(3)).is_empty());
        assert_eq!(watch.observe(&snap(1)), vec![(PageNumber(3), 3, 1)]);
    }

    #[test]
    fn missing_vcpu_is_flagged() {
        let c = cluster(2);
        c.start_vcpu(V, 0).unwrap();
        assert_eq!(
            check_vcpus_accounted(&c.snapshot(), &[V, VcpuId(1)]),
            vec![VcpuId(1)]
        );
    }

    #[test]
    fn cluster_snapshot_serializes() {
        let c = cluster(2);
        c.start_vcpu(V, 0).unwrap();
        c.node(1).host_read(gpa(0), 1).unwrap();
        let json = serde_json::to_string(&c.snapshot()).unwrap();
        assert!(json.contains("\"seed\":7"));
        assert!(json.contains("Shared"));
    }
}
