//! Seeded random workload: drives guest reads, guest writes and operator
//! migrations across a [`Cluster`] while the fault engine injects
//! failures, and feeds every check into the property oracle.
//!
//! ```text
//! for step in 0..steps:
//!     apply due faults (logical time = frames sent)
//!     pick a vCPU ──→ stranded?  retry_stranded
//!                 └─→ running?   migrate | write | read
//!     drain events ──→ record_sometimes (rare paths reached)
//!     snapshot     ──→ record_always   (safety properties)
//! then heal, recover, retry every stranded vCPU, read everything back
//! ```
//!
//! Each write stores `step + 1` (little-endian `u64`) at the base of a
//! page, so every read can be compared with the last write the workload
//! saw succeed.

use crate::cluster::{self, Cluster, VersionWatch, PROPERTIES};
use crate::events::ClusterEvent;
use crate::membership::Liveness;
use crate::node::GuestAccess;
use crate::vcpu::VcpuState;
use hyperkernel_fault::{Fault, FaultEngine};
use hyperkernel_protocol::{NodeId, PageNumber, VcpuId};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const READS_SEE_LAST_WRITE: &str = "reads-see-last-write";
pub const VCPUS_ACCOUNTED: &str = "vcpus-accounted";
pub const FINAL_READS_SUCCEED: &str = "final-reads-succeed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub steps: u64,
    /// Guest pages touched, starting at page 0.
    pub pages: u64,
    pub vcpus: u32,
    /// Chance per step of an operator migration, in parts per million.
    pub migrate_ppm: u32,
    /// Chance that an access is a write rather than a read.
    pub write_ppm: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            steps: 500,
            pages: 16,
            vcpus: 4,
            migrate_ppm: 50_000,
            write_ppm: 400_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadReport {
    pub reads: u64,
    pub writes: u64,
    /// Accesses that returned an error (unreachable home, lost page...).
    pub failed_accesses: u64,
    /// Faults the placement policy resolved by moving the vCPU.
    pub placement_moves: u64,
    pub operator_moves: u64,
    pub refused_moves: u64,
    pub stranded_retries: u64,
    pub faults_fired: u64,
    /// `always` checks that failed during this run.
    pub violations: Vec<String>,
}

/// Run one seeded workload.  The caller brackets it with
/// `engine.begin_run` and `engine.end_run`.
pub fn run(cluster: &Cluster, engine: &mut FaultEngine, config: &WorkloadConfig) -> WorkloadReport {
    let mut driver = Driver {
        cluster,
        engine,
        report: WorkloadReport::default(),
        expected: BTreeMap::new(),
        watch: VersionWatch::default(),
    };
    let vcpus: Vec<VcpuId> = (0..config.vcpus).map(VcpuId).collect();

    for (i, &vcpu) in vcpus.iter().enumerate() {
        if let Err(e) = cluster.start_vcpu(vcpu, i % cluster.len()) {
            warn!("starting {vcpu}: {e}");
        }
    }
    driver.engine.arm();

    for step in 0..config.steps {
        driver.apply_due_faults();
        let vcpu = vcpus[driver.engine.random_choice(vcpus.len())];
        driver.step(step, vcpu, config);
        driver.observe_events();
        driver.check();
    }

    driver.settle(&vcpus);
    driver.read_back(config.pages);
    info!(
        "workload done: {} reads, {} writes, {} failed, {} violations",
        driver.report.reads,
        driver.report.writes,
        driver.report.failed_accesses,
        driver.report.violations.len()
    );
    driver.report
}

struct Driver<'a> {
    cluster: &'a Cluster,
    engine: &'a mut FaultEngine,
    report: WorkloadReport,
    /// Last value the workload saw written to each page.
    expected: BTreeMap<PageNumber, u64>,
    watch: VersionWatch,
}

impl Driver<'_> {
    fn apply_due_faults(&mut self) {
        let fired = self.cluster.apply_due_faults(self.engine);
        self.report.faults_fired += fired.len() as u64;
    }

    fn always(&mut self, name: &str, condition: bool, detail: &str) {
        if !self.engine.oracle_mut().record_always(name, condition, detail) {
            warn!("{name} violated: {detail}");
            self.report.violations.push(format!("{name}: {detail}"));
        }
    }

    // ── One step ────────────────────────────────────────────────

    fn step(&mut self, step: u64, vcpu: VcpuId, config: &WorkloadConfig) {
        let located = self.cluster.locate(vcpu);
        let live = |node: &NodeId| !self.cluster.is_crashed(node.0 as usize);

        let stranded = located.iter().find(|(node, state)| {
            matches!(state, VcpuState::Migrating { stranded: true, .. }) && live(node)
        });
        if let Some(&(node, _)) = stranded {
            self.report.stranded_retries += 1;
            if let Err(e) = self.cluster.node(node.0 as usize).retry_stranded(vcpu) {
                debug!("retrying {vcpu} from {node}: {e}");
            }
            return;
        }

        let Some(&(node, _)) = located
            .iter()
            .find(|(node, state)| *state == VcpuState::Running && live(node))
        else {
            return;
        };

        if self.engine.chance_ppm(config.migrate_ppm) {
            let target = NodeId(self.engine.random_choice(self.cluster.len()) as u32);
            self.operator_migrate(vcpu, node, target);
            return;
        }

        let page = PageNumber(self.engine.random_choice(config.pages.max(1) as usize) as u64);
        if self.engine.chance_ppm(config.write_ppm) {
            self.write(node, vcpu, page, step + 1);
        } else {
            self.read(node, vcpu, page);
        }
    }

    fn operator_migrate(&mut self, vcpu: VcpuId, from: NodeId, to: NodeId) {
        match self.cluster.node(from.0 as usize).migrate(vcpu, to) {
            Ok(()) => {
                if from != to {
                    self.report.operator_moves += 1;
                }
            }
            Err(crate::error::MigrationError::Rejected { .. }) => self.report.refused_moves += 1,
            Err(e) => debug!("moving {vcpu} {from} -> {to}: {e}"),
        }
    }

    fn write(&mut self, node: NodeId, vcpu: VcpuId, page: PageNumber, value: u64) {
        let gpa = page.base_address();
        match self
            .cluster
            .node(node.0 as usize)
            .guest_write(vcpu, gpa, &value.to_le_bytes())
        {
            Ok(GuestAccess::Done(())) => {
                self.report.writes += 1;
                self.expected.insert(page, value);
            }
            Ok(GuestAccess::Migrated { target }) => {
                debug!("{vcpu} pulled to {target} by {page}");
                self.report.placement_moves += 1;
            }
            Err(e) => {
                debug!("{node}: write of {page} failed: {e}");
                self.report.failed_accesses += 1;
            }
        }
    }

    fn read(&mut self, node: NodeId, vcpu: VcpuId, page: PageNumber) {
        let gpa = page.base_address();
        let bytes = match self.cluster.node(node.0 as usize).guest_read(vcpu, gpa, 8) {
            Ok(GuestAccess::Done(bytes)) => bytes,
            Ok(GuestAccess::Migrated { target }) => {
                debug!("{vcpu} pulled to {target} by {page}");
                self.report.placement_moves += 1;
                return;
            }
            Err(e) => {
                debug!("{node}: read of {page} failed: {e}");
                self.report.failed_accesses += 1;
                return;
            }
        };
        self.report.reads += 1;

        // A node its home has fenced may still read its stale copy.
        if self.fenced(node, page) {
            return;
        }
        self.check_value(node, page, &bytes);
    }

    /// Whether `node` is dead in the view of `page`'s home.
    fn fenced(&self, node: NodeId, page: PageNumber) -> bool {
        let home = self.cluster.node(node.0 as usize).membership().home_of(page);
        self.cluster
            .node(home.0 as usize)
            .membership()
            .liveness(node)
            == Some(Liveness::Dead)
    }

    fn check_value(&mut self, node: NodeId, page: PageNumber, bytes: &[u8]) {
        let want = self.expected.get(&page).copied().unwrap_or(0);
        let got = <[u8; 8]>::try_from(bytes).map(u64::from_le_bytes);
        let detail = format!("{node} read {got:?} from {page}, last write was {want}");
        self.always(READS_SEE_LAST_WRITE, got.as_ref().ok() == Some(&want), &detail);
    }

    // ── Observation ─────────────────────────────────────────────

    fn observe_events(&mut self) {
        let events: Vec<ClusterEvent> = self
            .cluster
            .nodes()
            .iter()
            .flat_map(|n| n.drain_events())
            .collect();
        let seen = |pred: fn(&ClusterEvent) -> bool| events.iter().any(pred);

        let probes = [
            ("sharer-evicted", seen(|e| matches!(e, ClusterEvent::SharerEvicted { .. }))),
            ("page-lost", seen(|e| matches!(e, ClusterEvent::PageLost { .. }))),
            ("node-rejoined", seen(|e| matches!(e, ClusterEvent::NodeRejoined { .. }))),
            ("stale-copy-dropped", seen(|e| matches!(e, ClusterEvent::StaleCopyDropped { .. }))),
            ("migration-refused", seen(|e| matches!(e, ClusterEvent::MigrationRefused { .. }))),
            ("vcpu-stranded", seen(|e| matches!(e, ClusterEvent::MigrationFailed { .. }))),
        ];
        let oracle = self.engine.oracle_mut();
        for (name, reached) in probes {
            oracle.record_sometimes(name, reached);
        }
        for event in &events {
            if let ClusterEvent::ProtocolViolation { .. } = event {
                warn!("{event}");
            }
        }
    }

    fn check(&mut self) {
        let violations = self.cluster.check_invariants(&mut self.watch);
        for property in PROPERTIES {
            let detail = violations
                .iter()
                .filter(|v| v.property == property)
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.always(property, detail.is_empty(), &detail);
        }
    }

    // ── End of run ──────────────────────────────────────────────

    /// Undo every fault and finish every migration still in flight.
    fn settle(&mut self, vcpus: &[VcpuId]) {
        self.cluster.heal();
        for i in 0..self.cluster.len() {
            if self.cluster.is_crashed(i) {
                self.cluster.apply_fault(&Fault::NodeRecover { target: i });
            }
            self.cluster.apply_fault(&Fault::SlotRestore { target: i });
        }

        for &vcpu in vcpus {
            for (node, state) in self.cluster.locate(vcpu) {
                if matches!(state, VcpuState::Migrating { stranded: true, .. }) {
                    self.report.stranded_retries += 1;
                    if let Err(e) = self.cluster.node(node.0 as usize).retry_stranded(vcpu) {
                        warn!("{vcpu} still stranded on {node}: {e}");
                    }
                }
            }
        }
        self.observe_events();
        self.check();

        let missing = cluster::check_vcpus_accounted(&self.cluster.snapshot(), vcpus);
        let detail = format!("no node holds {missing:?}");
        self.always(VCPUS_ACCOUNTED, missing.is_empty(), &detail);
    }

    /// Read every page back from node 0 once the cluster is whole again.
    fn read_back(&mut self, pages: u64) {
        let reader = self.cluster.node(0).clone();
        for page in (0..pages).map(PageNumber) {
            match reader.host_read(page.base_address(), 8) {
                Ok(bytes) => self.check_value(reader.id(), page, &bytes),
                Err(e) => {
                    let detail = format!("{} cannot read {page}: {e}", reader.id());
                    self.always(FINAL_READS_SUCCEED, false, &detail);
                    continue;
                }
            }
            self.always(FINAL_READS_SUCCEED, true, "");
        }
    }
}
