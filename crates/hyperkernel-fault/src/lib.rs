//! Deterministic fault injection and property oracle for hyperkernel
//! clusters.
//!
//! This crate provides three main components:
//!
//! 1. **[`faults`]**: fault definitions (network, node, execution slots)
//! 2. **[`engine`]**: seeded scheduler that decides which faults fire at
//!    each point of logical time
//! 3. **[`oracle`]**: property oracle that scores cluster invariants
//!    across multiple seeded runs
//!
//! # Architecture
//!
//! ```text
//! Cluster harness          Fault Engine             Oracle
//! ───────────────          ────────────             ──────
//! frames sent ──────────→ poll_faults(now) ──→ apply to SimNetwork
//! invariant check ──────────────────────────→ record_always()
//! rare path reached ────────────────────────→ record_sometimes()
//! workload choice ──────→ random_choice(n)
//! ```
//!
//! Logical time is the number of frames the simulated fabric has
//! carried, so a schedule replays identically for a given seed.

pub mod engine;
pub mod faults;
pub mod oracle;
pub mod schedule;

pub use engine::{EngineConfig, FaultEngine};
pub use faults::Fault;
pub use oracle::{OracleReport, PropertyOracle};
pub use schedule::{FaultSchedule, FaultScheduleBuilder};
