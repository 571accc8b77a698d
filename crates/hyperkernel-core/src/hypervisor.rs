//! Narrow interface to the local hardware-virtualization layer, and an
//! in-process implementation of it.
//!
//! The engines only ever need five things from the layer underneath:
//! an execution slot for a vCPU, pause/resume, and the vCPU's register
//! state as an opaque blob.
//!
//! ```text
//! source                               target
//! ──────                               ──────
//! pause ─→ capture_context ── blob ──→ claim_slot ─→ inject_context ─→ resume
//! release_slot (after ack)
//! ```

use crate::error::HypervisorError;
use crate::lock;
use hyperkernel_protocol::{VcpuId, MAX_CONTEXT_LEN};
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait Hypervisor: Send + Sync {
    /// Reserve an execution slot for `vcpu`.
    fn claim_slot(&self, vcpu: VcpuId) -> Result<(), HypervisorError>;

    /// Give the slot back; the vCPU no longer exists here.
    fn release_slot(&self, vcpu: VcpuId) -> Result<(), HypervisorError>;

    fn pause(&self, vcpu: VcpuId) -> Result<(), HypervisorError>;

    /// Register state of a paused vCPU.
    fn capture_context(&self, vcpu: VcpuId) -> Result<Vec<u8>, HypervisorError>;

    /// Load state captured elsewhere into a claimed, not yet running slot.
    fn inject_context(&self, vcpu: VcpuId, context: &[u8]) -> Result<(), HypervisorError>;

    fn resume(&self, vcpu: VcpuId) -> Result<(), HypervisorError>;

    fn free_slots(&self) -> usize;
}

// ═══════════════════════════════════════════════════════════════════════
//  Simulated hardware layer
// ═══════════════════════════════════════════════════════════════════════

/// Leading bytes of every simulated context blob, `"HKVC"`.
pub const CONTEXT_MAGIC: [u8; 4] = *b"HKVC";

/// Magic plus the vCPU id.
const CONTEXT_HEADER_LEN: usize = 8;

/// Register file size of a freshly created simulated vCPU.
const INITIAL_REGISTERS: usize = 64;

#[derive(Debug, Default)]
struct SimSlot {
    context: Vec<u8>,
    running: bool,
}

#[derive(Debug)]
struct SimState {
    capacity: usize,
    /// Slot exhaustion fault: no slot may be claimed while set.
    exhausted: bool,
    slots: HashMap<VcpuId, SimSlot>,
}

/// Fixed number of execution slots; contexts are plain bytes.
#[derive(Debug)]
pub struct SimHypervisor {
    state: Mutex<SimState>,
}

impl SimHypervisor {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                capacity,
                exhausted: false,
                slots: HashMap::new(),
            }),
        }
    }

    /// Blob for a vCPU that has never run anywhere.
    pub fn initial_context(vcpu: VcpuId) -> Vec<u8> {
        let mut context = Vec::with_capacity(CONTEXT_HEADER_LEN + INITIAL_REGISTERS);
        context.extend_from_slice(&CONTEXT_MAGIC);
        context.extend_from_slice(&vcpu.0.to_le_bytes());
        context.resize(CONTEXT_HEADER_LEN + INITIAL_REGISTERS, 0);
        context
    }

    fn validate(vcpu: VcpuId, context: &[u8]) -> Result<(), HypervisorError> {
        let malformed = || HypervisorError::MalformedContext {
            vcpu,
            len: context.len(),
        };
        if context.len() < CONTEXT_HEADER_LEN || context.len() > MAX_CONTEXT_LEN {
            return Err(malformed());
        }
        if context[..4] != CONTEXT_MAGIC || context[4..8] != vcpu.0.to_le_bytes() {
            return Err(malformed());
        }
        Ok(())
    }

    /// Overwrite the register state of a vCPU held here.
    pub fn set_context(&self, vcpu: VcpuId, context: Vec<u8>) -> Result<(), HypervisorError> {
        Self::validate(vcpu, &context)?;
        let mut state = lock(&self.state);
        let slot = state
            .slots
            .get_mut(&vcpu)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))?;
        slot.context = context;
        Ok(())
    }

    pub fn context(&self, vcpu: VcpuId) -> Option<Vec<u8>> {
        lock(&self.state).slots.get(&vcpu).map(|s| s.context.clone())
    }

    pub fn is_running(&self, vcpu: VcpuId) -> bool {
        lock(&self.state).slots.get(&vcpu).is_some_and(|s| s.running)
    }

    pub fn occupied(&self) -> usize {
        lock(&self.state).slots.len()
    }

    pub fn set_exhausted(&self, exhausted: bool) {
        debug!("slot exhaustion {}", if exhausted { "on" } else { "off" });
        lock(&self.state).exhausted = exhausted;
    }
}

impl Hypervisor for SimHypervisor {
    fn claim_slot(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
        let mut state = lock(&self.state);
        if state.slots.contains_key(&vcpu) {
            return Err(HypervisorError::SlotOccupied(vcpu));
        }
        if state.exhausted || state.slots.len() >= state.capacity {
            return Err(HypervisorError::NoIdleSlot);
        }
        state.slots.insert(vcpu, SimSlot::default());
        Ok(())
    }

    fn release_slot(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
        lock(&self.state)
            .slots
            .remove(&vcpu)
            .map(drop)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))
    }

    fn pause(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
        let mut state = lock(&self.state);
        let slot = state
            .slots
            .get_mut(&vcpu)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))?;
        slot.running = false;
        Ok(())
    }

    fn capture_context(&self, vcpu: VcpuId) -> Result<Vec<u8>, HypervisorError> {
        let state = lock(&self.state);
        let slot = state
            .slots
            .get(&vcpu)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))?;
        if slot.running {
            return Err(HypervisorError::NotPaused(vcpu));
        }
        Ok(slot.context.clone())
    }

    fn inject_context(&self, vcpu: VcpuId, context: &[u8]) -> Result<(), HypervisorError> {
        Self::validate(vcpu, context)?;
        let mut state = lock(&self.state);
        let slot = state
            .slots
            .get_mut(&vcpu)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))?;
        if slot.running {
            return Err(HypervisorError::NotPaused(vcpu));
        }
        slot.context = context.to_vec();
        Ok(())
    }

    fn resume(&self, vcpu: VcpuId) -> Result<(), HypervisorError> {
        let mut state = lock(&self.state);
        let slot = state
            .slots
            .get_mut(&vcpu)
            .ok_or(HypervisorError::UnknownVcpu(vcpu))?;
        slot.running = true;
        Ok(())
    }

    fn free_slots(&self) -> usize {
        let state = lock(&self.state);
        if state.exhausted {
            0
        } else {
            state.capacity.saturating_sub(state.slots.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: VcpuId = VcpuId(3);

    #[test]
    fn capture_requires_pause() {
        let hv = SimHypervisor::new(2);
        hv.claim_slot(V).unwrap();
        hv.inject_context(V, &SimHypervisor::initial_context(V)).unwrap();
        hv.resume(V).unwrap();
        assert_eq!(hv.capture_context(V), Err(HypervisorError::NotPaused(V)));
        hv.pause(V).unwrap();
        assert_eq!(hv.capture_context(V).unwrap(), SimHypervisor::initial_context(V));
    }

    #[test]
    fn capacity_and_exhaustion() {
        let hv = SimHypervisor::new(1);
        assert_eq!(hv.free_slots(), 1);
        hv.claim_slot(VcpuId(0)).unwrap();
        assert_eq!(hv.claim_slot(VcpuId(1)), Err(HypervisorError::NoIdleSlot));
        hv.release_slot(VcpuId(0)).unwrap();

        hv.set_exhausted(true);
        assert_eq!(hv.free_slots(), 0);
        assert_eq!(hv.claim_slot(VcpuId(1)), Err(HypervisorError::NoIdleSlot));
        hv.set_exhausted(false);
        assert!(hv.claim_slot(VcpuId(1)).is_ok());
    }

    #[test]
    fn foreign_context_is_malformed() {
        let hv = SimHypervisor::new(2);
        hv.claim_slot(V).unwrap();
        let other = SimHypervisor::initial_context(VcpuId(4));
        assert_eq!(
            hv.inject_context(V, &other),
            Err(HypervisorError::MalformedContext {
                vcpu: V,
                len: other.len()
            })
        );
        assert!(hv.inject_context(V, b"junk").is_err());
    }

    #[test]
    fn double_claim_is_refused() {
        let hv = SimHypervisor::new(4);
        hv.claim_slot(V).unwrap();
        assert_eq!(hv.claim_slot(V), Err(HypervisorError::SlotOccupied(V)));
        assert_eq!(hv.occupied(), 1);
    }

    #[test]
    fn set_context_round_trips() {
        let hv = SimHypervisor::new(1);
        hv.claim_slot(V).unwrap();
        let mut ctx = SimHypervisor::initial_context(V);
        ctx[20] = 0x5A;
        hv.set_context(V, ctx.clone()).unwrap();
        assert_eq!(hv.context(V), Some(ctx));
        assert!(!hv.is_running(V));
    }
}
