//! Distributed page coherence and vCPU migration for a federated
//! hyperkernel.
//!
//! Several machines cooperate so that one guest sees a single large
//! machine.  Guest memory is kept coherent page by page with a
//! home-driven, invalidate-on-write protocol, and each remote-access
//! fault is resolved either by fetching the page or by moving the
//! faulting vCPU to the data.
//!
//! # Architecture
//!
//! ```text
//!  guest access ──→ Node::guest_read / guest_write (trap loop)
//!                        │ miss
//!                        ▼
//!                  CoherenceEngine::handle_fault
//!                   │            │
//!        placement::decide    fetch from home ──→ Transport ──→ home Node
//!                   │                                   │
//!           MigrationEngine::migrate          PageDirectory transition
//!                   │                          Recall / Invalidate
//!               Transport ──→ target Node           │
//!                                              LocalPages (each node)
//! ```
//!
//! Every node runs the same code.  The node that is home for a page (a
//! static function of the page number, see [`membership`]) owns its
//! directory entry and drives every transition on it.
//!
//! [`fabric::SimNetwork`], [`hypervisor::SimHypervisor`] and
//! [`cluster::Cluster`] provide an in-process cluster for tests and the
//! `hyperkernel-sim` binary, which drives it with [`workload::run`].

pub mod cluster;
pub mod coherence;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod fabric;
pub mod hypervisor;
pub mod membership;
pub mod migration;
pub mod node;
pub mod pages;
pub mod placement;
pub mod snapshot;
pub mod stats;
pub mod transport;
pub mod vcpu;
pub mod verified;
pub mod workload;

pub use hyperkernel_protocol as protocol;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Critical sections never panic part-way through an update, so a
// poisoned lock still guards consistent state.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
