//! Fault injection engine: the seeded coordinator.
//!
//! The [`FaultEngine`] combines the fault schedule, the property oracle,
//! and a deterministic RNG.  The cluster harness polls it after every
//! workload step with the fabric's frame count and applies whatever
//! faults come back.  The same RNG drives workload choices, so one seed
//! fixes the whole run.

use crate::faults::Fault;
use crate::oracle::PropertyOracle;
use crate::schedule::{FaultSchedule, ScheduledFault};
use log::debug;
use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Configuration for the fault engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Seed for the first run.
    pub seed: u64,
    /// Number of nodes in the cluster (for fault targeting).
    pub num_nodes: usize,
    pub schedule: Option<FaultSchedule>,
    /// Generate random faults in addition to scheduled ones.
    pub random_faults: bool,
    /// Frames between random faults.
    pub random_fault_interval: u64,
    /// Frames after which a random fault is repaired.
    pub repair_after: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_nodes: 1,
            schedule: None,
            random_faults: false,
            random_fault_interval: 500,
            repair_after: 200,
        }
    }
}

/// The central fault injection engine.
///
/// # Example
///
/// ```
/// use hyperkernel_fault::engine::{EngineConfig, FaultEngine};
/// use hyperkernel_fault::faults::Fault;
/// use hyperkernel_fault::schedule::FaultScheduleBuilder;
///
/// let schedule = FaultScheduleBuilder::new()
///     .at(10, Fault::NodeCrash { target: 2 })
///     .build();
///
/// let mut engine = FaultEngine::new(EngineConfig {
///     num_nodes: 3,
///     schedule: Some(schedule),
///     ..Default::default()
/// });
/// engine.begin_run(7);
/// engine.arm();
///
/// assert!(engine.poll_faults(5).is_empty());
/// assert_eq!(engine.poll_faults(10), vec![Fault::NodeCrash { target: 2 }]);
/// ```
pub struct FaultEngine {
    config: EngineConfig,
    rng: ChaCha20Rng,
    oracle: PropertyOracle,
    schedule: FaultSchedule,
    faults_injected: u64,
    /// Faults are held back until the cluster finishes bootstrapping.
    armed: bool,
    next_random_fault: u64,
}

impl FaultEngine {
    pub fn new(config: EngineConfig) -> Self {
        let rng = Self::rng_from_seed(config.seed);
        let schedule = config.schedule.clone().unwrap_or_default();
        let next_random_fault = config.random_fault_interval;
        Self {
            config,
            rng,
            oracle: PropertyOracle::new(),
            schedule,
            faults_injected: 0,
            armed: false,
            next_random_fault,
        }
    }

    /// Begin a run with its own seed.  The oracle keeps accumulating.
    pub fn begin_run(&mut self, seed: u64) {
        self.rng = Self::rng_from_seed(seed);
        self.oracle.begin_run();
        self.schedule = self.config.schedule.clone().unwrap_or_default();
        self.armed = false;
        self.next_random_fault = self.config.random_fault_interval;
    }

    pub fn end_run(&mut self) {
        self.oracle.end_run();
    }

    /// Allow faults to fire from now on.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Faults due at logical time `now` (frames sent so far).
    pub fn poll_faults(&mut self, now: u64) -> Vec<Fault> {
        if !self.armed {
            return Vec::new();
        }

        let mut faults: Vec<Fault> = self
            .schedule
            .drain_due(now)
            .into_iter()
            .map(|sf| {
                if let Some(label) = &sf.label {
                    debug!("scheduled fault '{label}': {}", sf.fault);
                }
                sf.fault
            })
            .collect();

        if self.config.random_faults && now >= self.next_random_fault {
            if let Some(fault) = self.generate_random_fault(now) {
                debug!("random fault at t={now}: {fault}");
                faults.push(fault);
            }
            self.next_random_fault = now + self.config.random_fault_interval;
        }

        self.faults_injected += faults.len() as u64;
        faults
    }

    // ── Randomness for the workload ─────────────────────────────

    pub fn next_random(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Uniform choice in `0..n`; `0` when `n <= 1`.
    pub fn random_choice(&mut self, n: usize) -> usize {
        if n <= 1 {
            0
        } else {
            (self.rng.next_u64() % n as u64) as usize
        }
    }

    /// True with probability `ppm / 1_000_000`.
    pub fn chance_ppm(&mut self, ppm: u32) -> bool {
        self.rng.next_u64() % 1_000_000 < u64::from(ppm)
    }

    pub fn oracle(&self) -> &PropertyOracle {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut PropertyOracle {
        &mut self.oracle
    }

    pub fn faults_injected(&self) -> u64 {
        self.faults_injected
    }

    // ── Internal ────────────────────────────────────────────────

    fn rng_from_seed(seed: u64) -> ChaCha20Rng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&seed.to_le_bytes());
        ChaCha20Rng::from_seed(key)
    }

    /// Pick a damaging fault and schedule its repair.
    fn generate_random_fault(&mut self, now: u64) -> Option<Fault> {
        let n = self.config.num_nodes;
        if n == 0 {
            return None;
        }
        let target = self.random_choice(n);

        let (fault, repair) = match self.rng.next_u64() % 5 {
            0 => (Fault::NodeCrash { target }, Fault::NodeRecover { target }),
            1 => (
                Fault::NetworkPartition {
                    side_a: vec![target],
                    side_b: (0..n).filter(|&i| i != target).collect(),
                },
                Fault::NetworkHeal,
            ),
            2 => (
                Fault::PacketLoss {
                    target,
                    rate_ppm: ((self.rng.next_u64() % 300_000) + 10_000) as u32,
                },
                Fault::NetworkHeal,
            ),
            3 => (
                Fault::PacketCorruption {
                    target,
                    rate_ppm: ((self.rng.next_u64() % 100_000) + 10_000) as u32,
                },
                Fault::NetworkHeal,
            ),
            _ => (
                Fault::SlotExhaustion { target },
                Fault::SlotRestore { target },
            ),
        };

        self.schedule.add(
            ScheduledFault::new(now + self.config.repair_after, repair).with_label("repair"),
        );
        Some(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::FaultScheduleBuilder;

    #[test]
    fn unarmed_engine_holds_faults() {
        let schedule = FaultScheduleBuilder::new()
            .at(0, Fault::NodeCrash { target: 0 })
            .build();
        let mut engine = FaultEngine::new(EngineConfig {
            schedule: Some(schedule),
            ..Default::default()
        });
        engine.begin_run(1);

        assert!(!engine.is_armed());
        assert!(engine.poll_faults(100).is_empty());
        engine.arm();
        assert!(engine.is_armed());
        assert_eq!(engine.poll_faults(100).len(), 1);
        assert_eq!(engine.faults_injected(), 1);
    }

    #[test]
    fn scheduled_faults_fire_in_order() {
        let schedule = FaultScheduleBuilder::new()
            .at(10, Fault::NetworkHeal)
            .at(20, Fault::NodeCrash { target: 0 })
            .build();
        let mut engine = FaultEngine::new(EngineConfig {
            schedule: Some(schedule),
            ..Default::default()
        });
        engine.begin_run(1);
        engine.arm();

        assert!(engine.poll_faults(5).is_empty());
        assert_eq!(engine.poll_faults(15), vec![Fault::NetworkHeal]);
        assert_eq!(engine.poll_faults(30), vec![Fault::NodeCrash { target: 0 }]);
    }

    #[test]
    fn schedule_replays_each_run() {
        let schedule = FaultScheduleBuilder::new().at(1, Fault::NetworkHeal).build();
        let mut engine = FaultEngine::new(EngineConfig {
            schedule: Some(schedule),
            ..Default::default()
        });
        for seed in 0..2 {
            engine.begin_run(seed);
            engine.arm();
            assert_eq!(engine.poll_faults(1).len(), 1);
            engine.end_run();
        }
        assert_eq!(engine.oracle().total_runs(), 2);
    }

    #[test]
    fn same_seed_same_choices() {
        let mut e1 = FaultEngine::new(EngineConfig::default());
        let mut e2 = FaultEngine::new(EngineConfig::default());
        e1.begin_run(123);
        e2.begin_run(123);
        for _ in 0..10 {
            assert_eq!(e1.next_random(), e2.next_random());
        }
        e2.begin_run(124);
        assert_ne!(e1.next_random(), e2.next_random());
    }

    #[test]
    fn random_choice_in_range() {
        let mut engine = FaultEngine::new(EngineConfig::default());
        engine.begin_run(9);
        for _ in 0..100 {
            assert!(engine.random_choice(5) < 5);
        }
        assert_eq!(engine.random_choice(0), 0);
        assert!(!engine.chance_ppm(0));
        assert!(engine.chance_ppm(1_000_000));
    }

    #[test]
    fn random_faults_are_repaired() {
        let mut engine = FaultEngine::new(EngineConfig {
            num_nodes: 3,
            random_faults: true,
            random_fault_interval: 10,
            repair_after: 5,
            ..Default::default()
        });
        engine.begin_run(5);
        engine.arm();

        let damage = engine.poll_faults(10);
        assert_eq!(damage.len(), 1);
        assert!(!damage[0].is_repair());

        let repair = engine.poll_faults(15);
        assert_eq!(repair.len(), 1);
        assert!(repair[0].is_repair());
    }
}
