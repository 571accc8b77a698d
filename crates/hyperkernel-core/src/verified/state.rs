//! Legality of page-directory commits and vCPU state transitions.
//!
//! ```text
//! Page directory                      vCPU on one node
//! ──────────────                      ────────────────
//! Invalid ──read──→ Shared            Absent ──admit/inbound──→ Running
//! Invalid ──write─→ Exclusive (v+1)   Running ⇄ Paused
//! Shared ───read──→ Shared            Running|Paused ──→ Migrating
//! Shared ───write─→ Exclusive (v+1)   Migrating ──ack──→ Absent
//! Exclusive ─read─→ Shared            Migrating ──nack─→ Running
//! Exclusive ─write→ Exclusive (v+1)   Migrating ──silence→ Stranded
//! ```
//!
//! A stranded vCPU never becomes runnable on the source again.

/// Directory state with associated data stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Invalid,
    Shared,
    Exclusive,
}

/// Whether a directory commit from `(from, from_version)` to
/// `(to, to_version)` is allowed.  `new_owner` is true when the commit
/// hands exclusive ownership to a node that did not hold it before.
///
/// # Properties
///
/// - versions never decrease and advance by at most one per commit
/// - the version advances exactly when a new writer is granted
/// - no page returns to `Invalid` once it left it
pub fn legal_commit(
    from: PageKind,
    from_version: u64,
    to: PageKind,
    to_version: u64,
    new_owner: bool,
) -> bool {
    debug_assert!(
        !new_owner || to == PageKind::Exclusive,
        "only an exclusive commit has an owner"
    );

    let bumped = match to_version.checked_sub(from_version) {
        Some(0) => false,
        Some(1) => true,
        _ => return false,
    };

    if to == PageKind::Invalid && from != PageKind::Invalid {
        return false;
    }
    let granting = to == PageKind::Exclusive && new_owner;
    bumped == granting
}

/// Lifecycle of a vCPU as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuPhase {
    Absent,
    Running,
    Paused,
    Migrating,
    Stranded,
}

/// Whether a vCPU may move from `from` to `to` on a single node.
pub fn vcpu_transition_allowed(from: VcpuPhase, to: VcpuPhase) -> bool {
    use VcpuPhase::*;
    matches!(
        (from, to),
        (Absent, Running)
            | (Running, Paused)
            | (Paused, Running)
            | (Running, Migrating)
            | (Paused, Migrating)
            | (Migrating, Absent)
            | (Migrating, Running)
            | (Migrating, Stranded)
            | (Stranded, Migrating)
            | (Stranded, Absent)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use PageKind::*;

    #[test]
    fn read_sharing_keeps_version() {
        assert!(legal_commit(Invalid, 0, Shared, 0, false));
        assert!(legal_commit(Shared, 3, Shared, 3, false));
        assert!(legal_commit(Exclusive, 3, Shared, 3, false));
        assert!(!legal_commit(Shared, 3, Shared, 4, false));
    }

    #[test]
    fn write_grant_bumps_version_once() {
        assert!(legal_commit(Invalid, 0, Exclusive, 1, true));
        assert!(legal_commit(Shared, 0, Exclusive, 1, true));
        assert!(legal_commit(Exclusive, 1, Exclusive, 2, true));
        assert!(!legal_commit(Shared, 0, Exclusive, 0, true));
        assert!(!legal_commit(Shared, 0, Exclusive, 2, true));
    }

    #[test]
    fn regrant_to_same_owner_keeps_version() {
        assert!(legal_commit(Exclusive, 5, Exclusive, 5, false));
        assert!(!legal_commit(Exclusive, 5, Exclusive, 6, false));
    }

    #[test]
    fn versions_never_go_backwards() {
        for kind in [Invalid, Shared, Exclusive] {
            assert!(!legal_commit(kind, 4, Shared, 3, false));
            assert!(!legal_commit(kind, 4, Exclusive, 3, true));
        }
    }

    #[test]
    fn invalid_is_not_reentered() {
        assert!(legal_commit(Invalid, 0, Invalid, 0, false));
        assert!(!legal_commit(Shared, 0, Invalid, 0, false));
        assert!(!legal_commit(Exclusive, 1, Invalid, 1, false));
    }

    #[test]
    fn stranded_never_resumes() {
        use VcpuPhase::*;
        assert!(!vcpu_transition_allowed(Stranded, Running));
        assert!(!vcpu_transition_allowed(Stranded, Paused));
        assert!(vcpu_transition_allowed(Stranded, Migrating));
        assert!(vcpu_transition_allowed(Migrating, Running));
    }

    #[test]
    fn exhaustive_vcpu_table() {
        use VcpuPhase::*;
        let all = [Absent, Running, Paused, Migrating, Stranded];
        let allowed: usize = all
            .iter()
            .flat_map(|&a| all.iter().map(move |&b| (a, b)))
            .filter(|&(a, b)| vcpu_transition_allowed(a, b))
            .count();
        assert_eq!(allowed, 10);
        for phase in all {
            assert!(!vcpu_transition_allowed(phase, phase));
        }
    }
}
