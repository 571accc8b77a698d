//! Migration Engine: moves a vCPU's execution context between nodes.
//!
//! ```text
//! source                                      target
//! ──────                                      ──────
//! begin_migration (epoch+1)
//! pause, capture_context
//! VcpuMigrate{epoch, hops, ctx} ───────────→  epoch already accepted? → Ack
//!                                             claim_slot, inject, resume
//!                               ←───────────  MigrateAck | MigrateNack
//! Ack   → release slot, Absent
//! Nack  → resume here (the only case the source runs it again)
//! silence → Stranded: never resumed here, retried with the same epoch
//! ```
//!
//! The target accepts a given epoch at most once.  A retry whose
//! original handoff already landed is answered with an ack, so a lost
//! ack never produces a second running copy.

use crate::error::{HypervisorError, MigrationError};
use crate::events::{ClusterEvent, EventLog};
use crate::hypervisor::Hypervisor;
use crate::membership::Liveness;
use crate::placement::DwellState;
use crate::stats::{bump, NodeStats};
use crate::transport::PeerClient;
use crate::vcpu::{VcpuState, VcpuTable};
use hyperkernel_protocol::{Message, NodeId, RejectReason, VcpuId};
use log::{debug, info, warn};
use std::sync::Arc;

pub struct MigrationEngine {
    local: NodeId,
    vcpus: Arc<VcpuTable>,
    hypervisor: Arc<dyn Hypervisor>,
    client: Arc<PeerClient>,
    events: Arc<EventLog>,
    stats: Arc<NodeStats>,
    /// Placement decisions a target is skipped for after refusing for
    /// lack of slots.
    saturation_backoff: u32,
}

impl MigrationEngine {
    pub fn new(
        vcpus: Arc<VcpuTable>,
        hypervisor: Arc<dyn Hypervisor>,
        client: Arc<PeerClient>,
        events: Arc<EventLog>,
        stats: Arc<NodeStats>,
        saturation_backoff: u32,
    ) -> Self {
        Self {
            local: client.membership().local(),
            vcpus,
            hypervisor,
            client,
            events,
            stats,
            saturation_backoff,
        }
    }

    // ═══════════════════════════════════════════════════════════════
    //  Source side
    // ═══════════════════════════════════════════════════════════════

    /// Move `vcpu` from this node to `target`.
    ///
    /// On `Rejected` the vCPU is running here again.  On `Unacknowledged`
    /// or `ProtocolViolation` it is stranded and must be retried with
    /// [`retry_stranded`](Self::retry_stranded).
    pub fn migrate(&self, vcpu: VcpuId, target: NodeId) -> Result<(), MigrationError> {
        if target == self.local {
            return match self.vcpus.state(vcpu) {
                Some(VcpuState::Running) => Ok(()),
                Some(VcpuState::Paused) => Err(MigrationError::NotRunning {
                    vcpu,
                    node: self.local,
                }),
                Some(VcpuState::Migrating {
                    stranded: false, ..
                }) => Err(MigrationError::AlreadyMigrating { vcpu }),
                Some(VcpuState::Migrating {
                    target: away,
                    stranded: true,
                    ..
                }) => Err(MigrationError::Stranded { vcpu, target: away }),
                None => Err(MigrationError::NotResident {
                    vcpu,
                    node: self.local,
                }),
            };
        }
        match self.client.membership().liveness(target) {
            None => return Err(MigrationError::UnknownNode(target)),
            Some(Liveness::Alive) => {}
            Some(_) => return Err(MigrationError::TargetNotAlive { target }),
        }

        let epoch = self.vcpus.begin_migration(vcpu, target)?;
        let captured = self
            .hypervisor
            .pause(vcpu)
            .and_then(|()| self.hypervisor.capture_context(vcpu));
        let context = match captured {
            Ok(context) => context,
            Err(e) => {
                warn!("{}: capturing {vcpu} failed: {e}", self.local);
                self.vcpus.cancel_migration(vcpu)?;
                self.hypervisor.resume(vcpu)?;
                return Err(e.into());
            }
        };

        debug!("{}: shipping {vcpu} to {target} (epoch {epoch})", self.local);
        self.ship(vcpu, target, epoch, context, false)
    }

    /// Resend a stranded vCPU to its original target with its original
    /// epoch.  Reaches the target even if it is currently marked dead.
    pub fn retry_stranded(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        let (target, epoch) = self.vcpus.resume_stranded(vcpu)?;
        let context = match self.hypervisor.capture_context(vcpu) {
            Ok(context) => context,
            Err(e) => {
                self.vcpus.strand(vcpu)?;
                return Err(e.into());
            }
        };
        info!("{}: retrying {vcpu} to {target} (epoch {epoch})", self.local);
        self.ship(vcpu, target, epoch, context, true)
    }

    fn ship(
        &self,
        vcpu: VcpuId,
        target: NodeId,
        epoch: u64,
        context: Vec<u8>,
        probe: bool,
    ) -> Result<(), MigrationError> {
        let msg = Message::VcpuMigrate {
            vcpu,
            epoch,
            hops: self.vcpus.hops(vcpu).unwrap_or(0),
            context,
        };
        let reply = if probe {
            self.client.probe(target, msg)
        } else {
            self.client.call(target, msg)
        };

        match reply {
            Ok(Message::MigrateAck { vcpu: acked }) if acked == vcpu => {
                self.vcpus.complete_migration(vcpu)?;
                if let Err(e) = self.hypervisor.release_slot(vcpu) {
                    warn!("{}: releasing slot of departed {vcpu}: {e}", self.local);
                }
                bump(&self.stats.migrations_out);
                info!("{}: {vcpu} now runs on {target}", self.local);
                Ok(())
            }
            Ok(Message::MigrateNack {
                vcpu: refused,
                reason,
            }) if refused == vcpu => {
                self.vcpus.cancel_migration(vcpu)?;
                self.hypervisor.resume(vcpu)?;
                if reason == RejectReason::NoIdleSlot {
                    self.client
                        .membership()
                        .mark_saturated(target, self.saturation_backoff);
                }
                bump(&self.stats.migrations_refused);
                self.events.push(ClusterEvent::MigrationRefused {
                    vcpu,
                    target,
                    reason,
                });
                Err(MigrationError::Rejected {
                    vcpu,
                    target,
                    reason,
                })
            }
            Ok(other) => {
                self.vcpus.strand(vcpu)?;
                let detail = format!("{target} answered {other}");
                self.events.push(ClusterEvent::ProtocolViolation {
                    page: None,
                    detail: format!("migrating {vcpu}: {detail}"),
                });
                Err(MigrationError::ProtocolViolation { vcpu, detail })
            }
            Err(e) => {
                warn!("{}: handoff of {vcpu} to {target} failed: {e}", self.local);
                self.vcpus.strand(vcpu)?;
                self.events
                    .push(ClusterEvent::MigrationFailed { vcpu, target });
                Err(MigrationError::Unacknowledged { vcpu, target })
            }
        }
    }

    /// Start a vCPU that has never run anywhere else.
    pub fn admit(&self, vcpu: VcpuId, context: &[u8]) -> Result<(), MigrationError> {
        self.hypervisor.claim_slot(vcpu)?;
        let installed = self
            .hypervisor
            .inject_context(vcpu, context)
            .map_err(MigrationError::from)
            .and_then(|()| self.vcpus.install_running(vcpu, 0, DwellState::default()));
        if let Err(e) = installed {
            self.release_quietly(vcpu);
            return Err(e);
        }
        self.hypervisor.resume(vcpu)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    //  Target side
    // ═══════════════════════════════════════════════════════════════

    /// Handle an inbound `VcpuMigrate`.  Always answers `MigrateAck` or
    /// `MigrateNack`.
    pub fn handle_incoming(
        &self,
        from: NodeId,
        vcpu: VcpuId,
        epoch: u64,
        hops: u32,
        context: &[u8],
    ) -> Message {
        let nack = |reason: RejectReason| {
            debug!("{}: refusing {vcpu} from {from}: {reason}", self.local);
            Message::MigrateNack { vcpu, reason }
        };

        if self.vcpus.accepted_epoch(vcpu).is_some_and(|last| epoch <= last) {
            debug!("{}: {vcpu} epoch {epoch} already accepted", self.local);
            return Message::MigrateAck { vcpu };
        }
        if self.vcpus.state(vcpu).is_some() {
            return nack(RejectReason::Conflict);
        }

        match self.hypervisor.claim_slot(vcpu) {
            Ok(()) => {}
            Err(HypervisorError::NoIdleSlot) => return nack(RejectReason::NoIdleSlot),
            Err(_) => return nack(RejectReason::Conflict),
        }
        if let Err(e) = self.hypervisor.inject_context(vcpu, context) {
            warn!("{}: context for {vcpu} rejected: {e}", self.local);
            self.release_quietly(vcpu);
            return nack(RejectReason::BadContext);
        }

        let dwell = DwellState {
            arrived_at: 0,
            previous: Some(from),
            hops: hops.saturating_add(1),
        };
        let previous = self.vcpus.accepted_epoch(vcpu);
        if self.vcpus.install_running(vcpu, epoch, dwell).is_err() {
            self.release_quietly(vcpu);
            return nack(RejectReason::Conflict);
        }
        if let Err(e) = self.hypervisor.resume(vcpu) {
            warn!("{}: resuming arrived {vcpu}: {e}", self.local);
            if let Err(e) = self.vcpus.revoke_arrival(vcpu, epoch, previous) {
                warn!("{}: revoking arrival of {vcpu}: {e}", self.local);
            }
            self.release_quietly(vcpu);
            return nack(RejectReason::BadContext);
        }

        bump(&self.stats.migrations_in);
        info!("{}: {vcpu} arrived from {from} (epoch {epoch})", self.local);
        Message::MigrateAck { vcpu }
    }

    fn release_quietly(&self, vcpu: VcpuId) {
        if let Err(e) = self.hypervisor.release_slot(vcpu) {
            debug!("{}: releasing slot of {vcpu}: {e}", self.local);
        }
    }
}
