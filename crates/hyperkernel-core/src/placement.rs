//! Placement policy: on a remote-access fault, fetch the page to the
//! vCPU or move the vCPU to the page.
//!
//! [`decide`] is a pure function of its inputs.  The rule, in order:
//!
//! 1. placement disabled, or the page is homed here → fetch
//! 2. the home is not `Alive`, or recently refused for lack of slots → fetch
//! 3. fewer than `K` distinct pages in the vCPU's recent fault window are
//!    homed at that node → fetch
//! 4. the vCPU arrived here fewer than `min_dwell` faults ago (times
//!    `bounce_dwell_multiplier` when the candidate is where it just came
//!    from) → fetch
//! 5. otherwise → migrate to the home
//!
//! Fetching always makes progress, so rule 4 is what keeps two nodes from
//! trading a vCPU back and forth forever.

use crate::config::PlacementConfig;
use crate::membership::Liveness;
use hyperkernel_protocol::{NodeId, PageNumber};
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    FetchPage,
    MigrateVcpu { target: NodeId },
}

/// Sliding window of a vCPU's recent remote faults.
#[derive(Debug, Clone)]
pub struct AccessHistory {
    recent: VecDeque<(PageNumber, NodeId)>,
    window: usize,
    /// Faults recorded since this vCPU arrived on the node.
    clock: u64,
}

impl AccessHistory {
    pub fn new(window: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(window),
            window: window.max(1),
            clock: 0,
        }
    }

    pub fn record(&mut self, page: PageNumber, home: NodeId) {
        self.clock += 1;
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back((page, home));
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Distinct pages in the window whose home is `node`.
    pub fn distinct_pages_homed_at(&self, node: NodeId) -> usize {
        self.recent
            .iter()
            .filter(|(_, home)| *home == node)
            .map(|(page, _)| *page)
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Where a vCPU came from and when it got here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DwellState {
    /// History clock at arrival.
    pub arrived_at: u64,
    pub previous: Option<NodeId>,
    /// Migrations completed so far.
    pub hops: u32,
}

/// Everything [`decide`] looks at for one fault.
#[derive(Debug, Clone, Copy)]
pub struct PlacementInput<'a> {
    pub page: PageNumber,
    pub local: NodeId,
    pub home: NodeId,
    pub home_liveness: Option<Liveness>,
    pub home_saturated: bool,
    pub history: &'a AccessHistory,
    pub dwell: &'a DwellState,
}

pub fn decide(config: &PlacementConfig, input: &PlacementInput<'_>) -> Decision {
    debug_assert!(input.history.clock() >= input.dwell.arrived_at);

    if !config.enabled || input.home == input.local {
        return Decision::FetchPage;
    }
    if input.home_liveness != Some(Liveness::Alive) || input.home_saturated {
        return Decision::FetchPage;
    }
    if input.history.distinct_pages_homed_at(input.home) < config.hot_page_threshold {
        return Decision::FetchPage;
    }

    // Dwell only applies once the vCPU has moved at least once.
    if input.dwell.hops > 0 {
        let mut required = config.min_dwell;
        if input.dwell.previous == Some(input.home) {
            required = required.saturating_mul(config.bounce_dwell_multiplier);
        }
        let dwelt = input.history.clock().saturating_sub(input.dwell.arrived_at);
        if dwelt < required {
            return Decision::FetchPage;
        }
    }

    Decision::MigrateVcpu { target: input.home }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: NodeId = NodeId(0);
    const REMOTE: NodeId = NodeId(1);

    fn config() -> PlacementConfig {
        PlacementConfig {
            enabled: true,
            hot_page_threshold: 3,
            window: 8,
            min_dwell: 4,
            bounce_dwell_multiplier: 3,
            saturation_backoff: 8,
        }
    }

    fn history_with(pages: &[u64], home: NodeId) -> AccessHistory {
        let mut h = AccessHistory::new(8);
        for &p in pages {
            h.record(PageNumber(p), home);
        }
        h
    }

    fn input<'a>(history: &'a AccessHistory, dwell: &'a DwellState) -> PlacementInput<'a> {
        PlacementInput {
            page: PageNumber(100),
            local: LOCAL,
            home: REMOTE,
            home_liveness: Some(Liveness::Alive),
            home_saturated: false,
            history,
            dwell,
        }
    }

    #[test]
    fn hot_remote_node_attracts_vcpu() {
        let history = history_with(&[1, 2, 3], REMOTE);
        let dwell = DwellState::default();
        assert_eq!(
            decide(&config(), &input(&history, &dwell)),
            Decision::MigrateVcpu { target: REMOTE }
        );
    }

    #[test]
    fn repeated_faults_on_one_page_are_not_hot() {
        let history = history_with(&[1, 1, 1, 1, 1], REMOTE);
        let dwell = DwellState::default();
        assert_eq!(decide(&config(), &input(&history, &dwell)), Decision::FetchPage);
    }

    #[test]
    fn window_forgets_old_faults() {
        let mut history = history_with(&[1, 2, 3], REMOTE);
        for p in 10..18 {
            history.record(PageNumber(p), NodeId(2));
        }
        assert_eq!(history.distinct_pages_homed_at(REMOTE), 0);
        assert_eq!(history.clock(), 11);
    }

    #[test]
    fn unavailable_home_is_never_a_target() {
        let history = history_with(&[1, 2, 3], REMOTE);
        let dwell = DwellState::default();

        let mut i = input(&history, &dwell);
        i.home_liveness = Some(Liveness::Suspected);
        assert_eq!(decide(&config(), &i), Decision::FetchPage);

        let mut i = input(&history, &dwell);
        i.home_saturated = true;
        assert_eq!(decide(&config(), &i), Decision::FetchPage);
    }

    #[test]
    fn local_home_and_disabled_policy_fetch() {
        let history = history_with(&[1, 2, 3], REMOTE);
        let dwell = DwellState::default();

        let mut i = input(&history, &dwell);
        i.home = LOCAL;
        assert_eq!(decide(&config(), &i), Decision::FetchPage);

        let disabled = PlacementConfig {
            enabled: false,
            ..config()
        };
        assert_eq!(decide(&disabled, &input(&history, &dwell)), Decision::FetchPage);
    }

    #[test]
    fn bounce_back_needs_longer_dwell() {
        // Four faults since arriving from REMOTE: enough for a new node,
        // not enough to go back.
        let history = history_with(&[1, 2, 3, 4], REMOTE);
        let dwell = DwellState {
            arrived_at: 0,
            previous: Some(REMOTE),
            hops: 1,
        };
        assert_eq!(decide(&config(), &input(&history, &dwell)), Decision::FetchPage);

        let elsewhere = DwellState {
            previous: Some(NodeId(2)),
            ..dwell
        };
        assert_eq!(
            decide(&config(), &input(&history, &elsewhere)),
            Decision::MigrateVcpu { target: REMOTE }
        );

        let history = history_with(&[1, 2, 3, 4, 5, 6, 7, 8], REMOTE);
        let mut long = history.clone();
        for p in 20..24 {
            long.record(PageNumber(p), REMOTE);
        }
        assert_eq!(long.clock(), 12);
        assert_eq!(
            decide(&config(), &input(&long, &dwell)),
            Decision::MigrateVcpu { target: REMOTE }
        );
    }
}
