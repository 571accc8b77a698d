//! Fault scheduling: when and what to inject.
//!
//! Time is logical: the number of frames the fabric has carried when the
//! fault becomes due.  A [`FaultSchedule`] can be written by hand for a
//! targeted scenario or loaded from a cluster config file.

use crate::faults::Fault;
use serde::{Deserialize, Serialize};

/// A fault due once `after_messages` frames have been sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledFault {
    pub after_messages: u64,
    pub fault: Fault,
    #[serde(default)]
    pub label: Option<String>,
}

impl ScheduledFault {
    pub fn new(after_messages: u64, fault: Fault) -> Self {
        Self {
            after_messages,
            fault,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// An ordered sequence of faults consumed by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ScheduleFile", into = "ScheduleFile")]
pub struct FaultSchedule {
    faults: Vec<ScheduledFault>,
    cursor: usize,
}

/// On-disk form: faults in any order.
#[derive(Serialize, Deserialize)]
struct ScheduleFile {
    faults: Vec<ScheduledFault>,
}

impl From<ScheduleFile> for FaultSchedule {
    fn from(file: ScheduleFile) -> Self {
        let mut schedule = FaultSchedule::new();
        for fault in file.faults {
            schedule.add(fault);
        }
        schedule
    }
}

impl From<FaultSchedule> for ScheduleFile {
    fn from(schedule: FaultSchedule) -> Self {
        ScheduleFile {
            faults: schedule.faults,
        }
    }
}

impl FaultSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fault, keeping the schedule ordered.  Faults due at the
    /// same time keep insertion order.
    pub fn add(&mut self, fault: ScheduledFault) {
        let at = self
            .faults
            .partition_point(|f| f.after_messages <= fault.after_messages);
        self.faults.insert(at, fault);
    }

    /// Take every fault due at or before `now`.
    pub fn drain_due(&mut self, now: u64) -> Vec<ScheduledFault> {
        let start = self.cursor;
        while self.cursor < self.faults.len() && self.faults[self.cursor].after_messages <= now {
            self.cursor += 1;
        }
        self.faults[start..self.cursor].to_vec()
    }

    pub fn next_due(&self) -> Option<u64> {
        self.faults.get(self.cursor).map(|f| f.after_messages)
    }

    pub fn remaining(&self) -> usize {
        self.faults.len() - self.cursor
    }

    pub fn total(&self) -> usize {
        self.faults.len()
    }

    /// Rewind so the next run replays from the start.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Builder for constructing fault schedules declaratively.
///
/// # Example
///
/// ```
/// use hyperkernel_fault::faults::Fault;
/// use hyperkernel_fault::schedule::FaultScheduleBuilder;
///
/// let schedule = FaultScheduleBuilder::new()
///     .at(100, Fault::NetworkPartition {
///         side_a: vec![0],
///         side_b: vec![1, 2],
///     })
///     .at(400, Fault::NetworkHeal)
///     .at(800, Fault::NodeCrash { target: 1 })
///     .build();
///
/// assert_eq!(schedule.total(), 3);
/// ```
#[derive(Default)]
pub struct FaultScheduleBuilder {
    schedule: FaultSchedule,
}

impl FaultScheduleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, after_messages: u64, fault: Fault) -> Self {
        self.schedule.add(ScheduledFault::new(after_messages, fault));
        self
    }

    pub fn at_labeled(mut self, after_messages: u64, fault: Fault, label: &str) -> Self {
        self.schedule
            .add(ScheduledFault::new(after_messages, fault).with_label(label));
        self
    }

    pub fn build(self) -> FaultSchedule {
        self.schedule
    }
}
