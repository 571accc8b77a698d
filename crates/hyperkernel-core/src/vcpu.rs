//! The vCPUs resident on this node and where departed ones went.
//!
//! Each vCPU sits behind its own mutex, so migrating one never blocks
//! faults on another.  Every state change is checked against
//! [`vcpu_transition_allowed`]; a refused change is a protocol violation,
//! never a silent overwrite.
//!
//! The migration epoch increases by one each time a vCPU starts a move
//! and travels with it, so the target can recognize a retried handoff.

use crate::error::MigrationError;
use crate::placement::{AccessHistory, DwellState};
use crate::snapshot::VcpuSnapshot;
use crate::verified::state::{vcpu_transition_allowed, VcpuPhase};
use crate::{lock, read, write};
use hyperkernel_protocol::{NodeId, VcpuId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VcpuState {
    Running,
    Paused,
    /// Context handed to `target`.  `stranded` once the handoff went
    /// unacknowledged; a stranded vCPU never runs here again.
    Migrating {
        target: NodeId,
        epoch: u64,
        stranded: bool,
    },
}

impl VcpuState {
    fn phase(&self) -> VcpuPhase {
        match self {
            VcpuState::Running => VcpuPhase::Running,
            VcpuState::Paused => VcpuPhase::Paused,
            VcpuState::Migrating {
                stranded: false, ..
            } => VcpuPhase::Migrating,
            VcpuState::Migrating { stranded: true, .. } => VcpuPhase::Stranded,
        }
    }
}

#[derive(Debug)]
struct VcpuSlot {
    state: VcpuState,
    epoch: u64,
    history: AccessHistory,
    dwell: DwellState,
}

#[derive(Debug)]
pub struct VcpuTable {
    local: NodeId,
    window: usize,
    vcpus: RwLock<HashMap<VcpuId, Arc<Mutex<VcpuSlot>>>>,
    /// Last known destination of vCPUs that left.
    forwarded: RwLock<HashMap<VcpuId, NodeId>>,
    /// Highest epoch each vCPU ever arrived here with.
    accepted: RwLock<HashMap<VcpuId, u64>>,
}

impl VcpuTable {
    pub fn new(local: NodeId, window: usize) -> Self {
        Self {
            local,
            window,
            vcpus: RwLock::new(HashMap::new()),
            forwarded: RwLock::new(HashMap::new()),
            accepted: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, vcpu: VcpuId) -> Result<Arc<Mutex<VcpuSlot>>, MigrationError> {
        read(&self.vcpus)
            .get(&vcpu)
            .cloned()
            .ok_or(MigrationError::NotResident {
                vcpu,
                node: self.local,
            })
    }

    fn check(vcpu: VcpuId, from: VcpuPhase, to: VcpuPhase) -> Result<(), MigrationError> {
        if vcpu_transition_allowed(from, to) {
            Ok(())
        } else {
            Err(MigrationError::ProtocolViolation {
                vcpu,
                detail: format!("{from:?} -> {to:?}"),
            })
        }
    }

    /// Absent → Running, with the epoch and dwell it arrived with.
    pub fn install_running(
        &self,
        vcpu: VcpuId,
        epoch: u64,
        dwell: DwellState,
    ) -> Result<(), MigrationError> {
        let mut vcpus = write(&self.vcpus);
        if let Some(existing) = vcpus.get(&vcpu) {
            let from = lock(existing).state.phase();
            return Err(MigrationError::ProtocolViolation {
                vcpu,
                detail: format!("already present as {from:?}"),
            });
        }
        Self::check(vcpu, VcpuPhase::Absent, VcpuPhase::Running)?;
        vcpus.insert(
            vcpu,
            Arc::new(Mutex::new(VcpuSlot {
                state: VcpuState::Running,
                epoch,
                history: AccessHistory::new(self.window),
                dwell,
            })),
        );
        drop(vcpus);
        write(&self.forwarded).remove(&vcpu);
        let mut accepted = write(&self.accepted);
        let last = accepted.entry(vcpu).or_insert(epoch);
        *last = (*last).max(epoch);
        Ok(())
    }

    /// Undo an [`install_running`](Self::install_running) whose vCPU
    /// never started executing.  The accepted epoch goes back to
    /// `previous`, so the refused handoff is not mistaken for a landed
    /// one if it arrives again.
    pub fn revoke_arrival(
        &self,
        vcpu: VcpuId,
        epoch: u64,
        previous: Option<u64>,
    ) -> Result<(), MigrationError> {
        let mut vcpus = write(&self.vcpus);
        let Some(existing) = vcpus.get(&vcpu) else {
            return Err(MigrationError::NotResident {
                vcpu,
                node: self.local,
            });
        };
        {
            let slot = lock(existing);
            if slot.state != VcpuState::Running || slot.epoch != epoch {
                return Err(MigrationError::ProtocolViolation {
                    vcpu,
                    detail: format!("revoking arrival while {:?}", slot.state.phase()),
                });
            }
        }
        vcpus.remove(&vcpu);
        drop(vcpus);
        let mut accepted = write(&self.accepted);
        match previous {
            Some(last) => accepted.insert(vcpu, last),
            None => accepted.remove(&vcpu),
        };
        Ok(())
    }

    /// Running | Paused → Migrating.  Returns the new epoch.
    pub fn begin_migration(&self, vcpu: VcpuId, target: NodeId) -> Result<u64, MigrationError> {
        let slot = self.slot(vcpu)?;
        let mut slot = lock(&slot);
        match slot.state {
            VcpuState::Migrating {
                stranded: false, ..
            } => return Err(MigrationError::AlreadyMigrating { vcpu }),
            VcpuState::Migrating {
                target,
                stranded: true,
                ..
            } => return Err(MigrationError::Stranded { vcpu, target }),
            VcpuState::Running | VcpuState::Paused => {}
        }
        Self::check(vcpu, slot.state.phase(), VcpuPhase::Migrating)?;
        slot.epoch += 1;
        slot.state = VcpuState::Migrating {
            target,
            epoch: slot.epoch,
            stranded: false,
        };
        Ok(slot.epoch)
    }

    /// Migrating → Absent, once the target acknowledged.
    pub fn complete_migration(&self, vcpu: VcpuId) -> Result<NodeId, MigrationError> {
        let slot = self.slot(vcpu)?;
        let target = {
            let slot = lock(&slot);
            let VcpuState::Migrating { target, .. } = slot.state else {
                return Err(MigrationError::ProtocolViolation {
                    vcpu,
                    detail: format!("ack while {:?}", slot.state.phase()),
                });
            };
            Self::check(vcpu, slot.state.phase(), VcpuPhase::Absent)?;
            target
        };
        write(&self.vcpus).remove(&vcpu);
        write(&self.forwarded).insert(vcpu, target);
        Ok(target)
    }

    /// Migrating → Running, after a positive refusal.
    pub fn cancel_migration(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        let slot = self.slot(vcpu)?;
        let mut slot = lock(&slot);
        Self::check(vcpu, slot.state.phase(), VcpuPhase::Running)?;
        slot.state = VcpuState::Running;
        Ok(())
    }

    /// Migrating → Stranded, after the handoff went unacknowledged.
    pub fn strand(&self, vcpu: VcpuId) -> Result<(), MigrationError> {
        let slot = self.slot(vcpu)?;
        let mut slot = lock(&slot);
        Self::check(vcpu, slot.state.phase(), VcpuPhase::Stranded)?;
        if let VcpuState::Migrating { stranded, .. } = &mut slot.state {
            *stranded = true;
        }
        Ok(())
    }

    /// Stranded → Migrating, to resend the same handoff.  Returns the
    /// original target and epoch.
    pub fn resume_stranded(&self, vcpu: VcpuId) -> Result<(NodeId, u64), MigrationError> {
        let slot = self.slot(vcpu)?;
        let mut slot = lock(&slot);
        let VcpuState::Migrating {
            target,
            epoch,
            stranded: true,
        } = slot.state
        else {
            return Err(MigrationError::ProtocolViolation {
                vcpu,
                detail: format!("retry while {:?}", slot.state.phase()),
            });
        };
        Self::check(vcpu, VcpuPhase::Stranded, VcpuPhase::Migrating)?;
        slot.state = VcpuState::Migrating {
            target,
            epoch,
            stranded: false,
        };
        Ok((target, epoch))
    }

    /// Running ⇄ Paused.
    pub fn set_paused(&self, vcpu: VcpuId, paused: bool) -> Result<(), MigrationError> {
        let slot = self.slot(vcpu)?;
        let mut slot = lock(&slot);
        let (to, phase) = if paused {
            (VcpuState::Paused, VcpuPhase::Paused)
        } else {
            (VcpuState::Running, VcpuPhase::Running)
        };
        Self::check(vcpu, slot.state.phase(), phase)?;
        slot.state = to;
        Ok(())
    }

    /// Only a `Running` vCPU may execute guest code here.
    pub fn may_resume(&self, vcpu: VcpuId) -> bool {
        self.state(vcpu) == Some(VcpuState::Running)
    }

    pub fn state(&self, vcpu: VcpuId) -> Option<VcpuState> {
        let slot = self.slot(vcpu).ok()?;
        let state = lock(&slot).state;
        Some(state)
    }

    pub fn epoch(&self, vcpu: VcpuId) -> Option<u64> {
        let slot = self.slot(vcpu).ok()?;
        let epoch = lock(&slot).epoch;
        Some(epoch)
    }

    pub fn hops(&self, vcpu: VcpuId) -> Option<u32> {
        let slot = self.slot(vcpu).ok()?;
        let hops = lock(&slot).dwell.hops;
        Some(hops)
    }

    /// Run `f` over the vCPU's placement inputs.
    pub fn with_placement<R>(
        &self,
        vcpu: VcpuId,
        f: impl FnOnce(&mut AccessHistory, &DwellState) -> R,
    ) -> Option<R> {
        let slot = self.slot(vcpu).ok()?;
        let mut slot = lock(&slot);
        let VcpuSlot { history, dwell, .. } = &mut *slot;
        Some(f(history, dwell))
    }

    /// vCPUs present on this node in any state, sorted.
    pub fn resident(&self) -> Vec<VcpuId> {
        let mut ids: Vec<_> = read(&self.vcpus).keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn forwarded_to(&self, vcpu: VcpuId) -> Option<NodeId> {
        read(&self.forwarded).get(&vcpu).copied()
    }

    /// Highest epoch `vcpu` was ever installed here with.
    pub fn accepted_epoch(&self, vcpu: VcpuId) -> Option<u64> {
        read(&self.accepted).get(&vcpu).copied()
    }

    pub fn snapshot(&self) -> Vec<VcpuSnapshot> {
        let vcpus = read(&self.vcpus);
        let mut out: Vec<_> = vcpus
            .iter()
            .map(|(&vcpu, slot)| {
                let slot = lock(slot);
                VcpuSnapshot {
                    vcpu,
                    state: slot.state,
                    epoch: slot.epoch,
                    hops: slot.dwell.hops,
                }
            })
            .collect();
        out.sort_by_key(|v| v.vcpu);
        out
    }
}
