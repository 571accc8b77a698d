//! Property oracle: scores cluster invariants across runs.
//!
//! The cluster harness evaluates its invariant checks after every
//! workload step and reports each result here.  Once all seeds have run,
//! the oracle produces a verdict per property.
//!
//! # Property semantics
//!
//! | Kind         | Pass condition                                |
//! |--------------|-----------------------------------------------|
//! | `always`     | Condition was true every time, in every run   |
//! | `sometimes`  | Condition was true at least once, in any run  |
//!
//! `sometimes` properties are coverage probes: "a migration was refused",
//! "a stale copy was refetched".  A failing probe means the workload never
//! drove the cluster down that path, not that the cluster misbehaved.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// The kind of property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropertyKind {
    Always,
    Sometimes,
}

/// Accumulated evaluations of one named property.
#[derive(Debug, Clone, Serialize)]
pub struct PropertyRecord {
    pub kind: PropertyKind,
    pub hit_count: u64,
    pub true_count: u64,
    pub false_count: u64,
    /// Distinct runs that evaluated this property.
    pub runs_hit: u32,
    /// Distinct runs in which the condition held at least once.
    pub runs_satisfied: u32,
    pub first_failure_run: Option<u32>,
    /// Detail string from the first failing evaluation.
    pub first_failure: Option<String>,
}

impl PropertyRecord {
    fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            hit_count: 0,
            true_count: 0,
            false_count: 0,
            runs_hit: 0,
            runs_satisfied: 0,
            first_failure_run: None,
            first_failure: None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.hit_count == 0 {
            return Verdict::Unexercised;
        }
        match self.kind {
            PropertyKind::Always if self.false_count == 0 => Verdict::Passed,
            PropertyKind::Sometimes if self.true_count > 0 => Verdict::Passed,
            _ => Verdict::Failed,
        }
    }
}

/// Final verdict for a property after all runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Passed,
    Failed,
    Unexercised,
}

#[derive(Debug, Clone, Default)]
struct RunState {
    run_id: u32,
    hit: BTreeSet<String>,
    satisfied: BTreeSet<String>,
    first_violation: Option<(String, String)>,
}

/// Tracks named properties across seeded runs.
///
/// # Example
///
/// ```
/// use hyperkernel_fault::oracle::{PropertyOracle, Verdict};
///
/// let mut oracle = PropertyOracle::new();
/// for _ in 0..2 {
///     oracle.begin_run();
///     oracle.record_always("single-writer", true, "");
///     oracle.end_run();
/// }
///
/// let report = oracle.report();
/// assert_eq!(report.properties["single-writer"].verdict(), Verdict::Passed);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PropertyOracle {
    properties: BTreeMap<String, PropertyRecord>,
    current_run: Option<RunState>,
    total_runs: u32,
}

/// Summary produced after all runs.
#[derive(Debug, Clone, Serialize)]
pub struct OracleReport {
    pub properties: BTreeMap<String, PropertyRecord>,
    pub total_runs: u32,
    pub passed: usize,
    pub failed: usize,
    pub unexercised: usize,
}

impl OracleReport {
    /// Whether no `always` property was violated.
    pub fn invariants_held(&self) -> bool {
        self.properties
            .values()
            .all(|p| p.kind != PropertyKind::Always || p.false_count == 0)
    }
}

impl PropertyOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_run(&mut self) {
        self.current_run = Some(RunState {
            run_id: self.total_runs,
            ..Default::default()
        });
    }

    pub fn end_run(&mut self) {
        if let Some(run) = self.current_run.take() {
            for name in &run.hit {
                if let Some(record) = self.properties.get_mut(name) {
                    record.runs_hit += 1;
                }
            }
            for name in &run.satisfied {
                if let Some(record) = self.properties.get_mut(name) {
                    record.runs_satisfied += 1;
                }
            }
            self.total_runs += 1;
        }
    }

    /// First `always` violation of the current run, if any.
    pub fn violation(&self) -> Option<(&str, &str)> {
        self.current_run
            .as_ref()
            .and_then(|r| r.first_violation.as_ref())
            .map(|(name, detail)| (name.as_str(), detail.as_str()))
    }

    // ── Recording ───────────────────────────────────────────────

    /// Record an invariant evaluation.  Returns `condition`.
    pub fn record_always(&mut self, name: &str, condition: bool, detail: &str) -> bool {
        let run_id = self.current_run_id();
        let record = self
            .properties
            .entry(name.to_string())
            .or_insert_with(|| PropertyRecord::new(PropertyKind::Always));

        record.hit_count += 1;
        if condition {
            record.true_count += 1;
        } else {
            record.false_count += 1;
            if record.first_failure_run.is_none() {
                record.first_failure_run = Some(run_id);
                record.first_failure = Some(detail.to_string());
            }
        }

        if let Some(run) = &mut self.current_run {
            run.hit.insert(name.to_string());
            if condition {
                run.satisfied.insert(name.to_string());
            } else if run.first_violation.is_none() {
                run.first_violation = Some((name.to_string(), detail.to_string()));
            }
        }
        condition
    }

    /// Record a coverage probe.
    pub fn record_sometimes(&mut self, name: &str, condition: bool) {
        let record = self
            .properties
            .entry(name.to_string())
            .or_insert_with(|| PropertyRecord::new(PropertyKind::Sometimes));

        record.hit_count += 1;
        if condition {
            record.true_count += 1;
        } else {
            record.false_count += 1;
        }

        if let Some(run) = &mut self.current_run {
            run.hit.insert(name.to_string());
            if condition {
                run.satisfied.insert(name.to_string());
            }
        }
    }

    // ── Reporting ───────────────────────────────────────────────

    pub fn report(&self) -> OracleReport {
        let mut passed = 0;
        let mut failed = 0;
        let mut unexercised = 0;
        for record in self.properties.values() {
            match record.verdict() {
                Verdict::Passed => passed += 1,
                Verdict::Failed => failed += 1,
                Verdict::Unexercised => unexercised += 1,
            }
        }
        OracleReport {
            properties: self.properties.clone(),
            total_runs: self.total_runs,
            passed,
            failed,
            unexercised,
        }
    }

    pub fn total_runs(&self) -> u32 {
        self.total_runs
    }

    fn current_run_id(&self) -> u32 {
        self.current_run
            .as_ref()
            .map_or(self.total_runs, |r| r.run_id)
    }
}
