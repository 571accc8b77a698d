//! Page Directory: authoritative per-page metadata for pages homed at
//! this node.
//!
//! Entries are sharded by page number; each shard has its own mutex and
//! condition variable, so transitions on different pages never contend on
//! a common lock.  Within a page, at most one transition is in flight:
//!
//! ```text
//! begin_transition ──→ TransitionToken ──→ commit(record) | abort
//!        │ busy                                   │
//!        ▼                                        ▼
//!   PendingRequest (FIFO tickets) ◄──── notify: head ticket proceeds
//! ```
//!
//! The token is an RAII guard: dropping it without committing aborts the
//! transition, so an early `?` return can never leave a page busy.
//!
//! Entries are created lazily.  A page nobody has touched is `Invalid`
//! at version 0 with zero-filled data; an entry that is still in that
//! state when its last transition or waiter goes away is dropped again.

use crate::error::DirectoryError;
use crate::lock;
use crate::snapshot::{DirectoryEntrySnapshot, DirectorySnapshot};
use crate::verified::state::{legal_commit, PageKind};
use hyperkernel_protocol::{NodeId, PageNumber, PAGE_SIZE};
use log::debug;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════
//  Page state
// ═══════════════════════════════════════════════════════════════════════

/// Coherence state of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PageState {
    /// No node caches the page; the home copy is current.
    Invalid,
    /// Read-only copies exist on `sharers`; the home copy is current.
    Shared { sharers: BTreeSet<NodeId> },
    /// `owner` may write; its copy is the only current one.
    Exclusive { owner: NodeId },
}

impl PageState {
    pub fn kind(&self) -> PageKind {
        match self {
            PageState::Invalid => PageKind::Invalid,
            PageState::Shared { .. } => PageKind::Shared,
            PageState::Exclusive { .. } => PageKind::Exclusive,
        }
    }

    pub fn owner(&self) -> Option<NodeId> {
        match self {
            PageState::Exclusive { owner } => Some(*owner),
            _ => None,
        }
    }

    /// Whether `node` is allowed to hold a copy at the current version.
    pub fn permits_copy(&self, node: NodeId) -> bool {
        match self {
            PageState::Invalid => false,
            PageState::Shared { sharers } => sharers.contains(&node),
            PageState::Exclusive { owner } => *owner == node,
        }
    }
}

/// Read-only answer to [`PageDirectory::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageView {
    pub page: PageNumber,
    pub state: PageState,
    /// Exclusive owner, or the home when no one owns the page.
    pub owner_or_home: NodeId,
    pub sharers: BTreeSet<NodeId>,
    pub version: u64,
}

/// Full entry, handed to the holder of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub state: PageState,
    pub version: u64,
    /// Home copy.  Current unless the page is `Exclusive`.
    pub data: Vec<u8>,
    /// The exclusive owner was found dead; reported once.
    pub lost: bool,
}

impl Default for PageRecord {
    fn default() -> Self {
        Self {
            state: PageState::Invalid,
            version: 0,
            data: vec![0; PAGE_SIZE],
            lost: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Directory
// ═══════════════════════════════════════════════════════════════════════

/// Requests waiting for the in-flight transition on one page, in
/// arrival order.  Exists only while someone is waiting.
#[derive(Debug, Default)]
struct PendingRequest {
    tickets: VecDeque<u64>,
}

#[derive(Debug, Default)]
struct Slot {
    record: PageRecord,
    /// Serial of the token holding the transition.
    busy: Option<u64>,
    pending: Option<PendingRequest>,
}

impl Slot {
    fn queued(&self) -> usize {
        self.pending.as_ref().map_or(0, |p| p.tickets.len())
    }

    /// Indistinguishable from a page that was never created.
    fn is_vacant(&self) -> bool {
        self.busy.is_none()
            && self.pending.is_none()
            && self.record.state == PageState::Invalid
            && self.record.version == 0
            && !self.record.lost
            && self.record.data.iter().all(|&b| b == 0)
    }
}

#[derive(Debug, Default)]
struct Shard {
    slots: Mutex<HashMap<PageNumber, Slot>>,
    released: Condvar,
}

#[derive(Debug)]
pub struct PageDirectory {
    home: NodeId,
    shards: Vec<Shard>,
    next_serial: AtomicU64,
}

/// Exclusive right to mutate one page's entry.
#[derive(Debug)]
pub struct TransitionToken<'a> {
    directory: &'a PageDirectory,
    page: PageNumber,
    serial: u64,
    finished: bool,
}

impl TransitionToken<'_> {
    pub fn page(&self) -> PageNumber {
        self.page
    }
}

impl Drop for TransitionToken<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("transition on {} abandoned", self.page);
            self.directory.release(self.page, self.serial);
        }
    }
}

impl PageDirectory {
    pub fn new(home: NodeId, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            home,
            shards: (0..shards).map(|_| Shard::default()).collect(),
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn home(&self) -> NodeId {
        self.home
    }

    fn shard(&self, page: PageNumber) -> &Shard {
        &self.shards[(page.0 % self.shards.len() as u64) as usize]
    }

    pub fn lookup(&self, page: PageNumber) -> PageView {
        let slots = lock(&self.shard(page).slots);
        let (state, version) = match slots.get(&page) {
            Some(slot) => (slot.record.state.clone(), slot.record.version),
            None => (PageState::Invalid, 0),
        };
        let owner_or_home = state.owner().unwrap_or(self.home);
        let sharers = match &state {
            PageState::Shared { sharers } => sharers.clone(),
            _ => BTreeSet::new(),
        };
        PageView {
            page,
            state,
            owner_or_home,
            sharers,
            version,
        }
    }

    /// Start a transition, or fail with `Busy` if one is in flight or
    /// others are already queued.
    pub fn begin_transition(&self, page: PageNumber) -> Result<TransitionToken<'_>, DirectoryError> {
        let mut slots = lock(&self.shard(page).slots);
        let slot = slots.entry(page).or_default();
        if slot.busy.is_some() || slot.pending.is_some() {
            return Err(DirectoryError::Busy { page });
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        slot.busy = Some(serial);
        Ok(self.token(page, serial))
    }

    /// Start a transition, waiting in FIFO order behind any in flight.
    pub fn begin_transition_queued(
        &self,
        page: PageNumber,
        wait: Duration,
    ) -> Result<TransitionToken<'_>, DirectoryError> {
        let shard = self.shard(page);
        let deadline = Instant::now() + wait;
        let ticket = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let mut slots = lock(&shard.slots);
        {
            let slot = slots.entry(page).or_default();
            if slot.busy.is_none() && slot.pending.is_none() {
                slot.busy = Some(ticket);
                return Ok(self.token(page, ticket));
            }
            slot.pending
                .get_or_insert_with(PendingRequest::default)
                .tickets
                .push_back(ticket);
            debug!("{page} busy, queued ticket {ticket} ({} waiting)", slot.queued());
        }

        loop {
            let slot = slots.entry(page).or_default();
            let at_head = slot
                .pending
                .as_ref()
                .is_some_and(|p| p.tickets.front() == Some(&ticket));
            if slot.busy.is_none() && at_head {
                Self::dequeue(slot, ticket);
                slot.busy = Some(ticket);
                return Ok(self.token(page, ticket));
            }

            let now = Instant::now();
            if now >= deadline {
                Self::dequeue(slot, ticket);
                // The head may have changed.
                shard.released.notify_all();
                Self::prune(&mut slots, page);
                return Err(DirectoryError::QueueTimeout {
                    page,
                    waited_ms: wait.as_millis() as u64,
                });
            }
            slots = shard
                .released
                .wait_timeout(slots, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Current entry, as seen by the transition holder.
    pub fn entry(&self, token: &TransitionToken<'_>) -> Result<PageRecord, DirectoryError> {
        let slots = lock(&self.shard(token.page).slots);
        match slots.get(&token.page) {
            Some(slot) if slot.busy == Some(token.serial) => Ok(slot.record.clone()),
            _ => Err(DirectoryError::StaleToken { page: token.page }),
        }
    }

    /// Install `record` and end the transition.  The transition ends
    /// even when the record is rejected.
    pub fn commit(
        &self,
        mut token: TransitionToken<'_>,
        record: PageRecord,
    ) -> Result<(), DirectoryError> {
        token.finished = true;
        let page = token.page;
        let shard = self.shard(page);
        let mut slots = lock(&shard.slots);
        let Some(slot) = slots.get_mut(&page).filter(|s| s.busy == Some(token.serial)) else {
            return Err(DirectoryError::StaleToken { page });
        };

        let result = Self::check_commit(page, &slot.record, &record);
        if result.is_ok() {
            slot.record = record;
        }
        slot.busy = None;
        shard.released.notify_all();
        Self::prune(&mut slots, page);
        result
    }

    /// End the transition without changing the entry.
    pub fn abort(&self, mut token: TransitionToken<'_>) {
        token.finished = true;
        self.release(token.page, token.serial);
    }

    /// Requests waiting behind the in-flight transition on `page`.
    pub fn queued(&self, page: PageNumber) -> usize {
        lock(&self.shard(page).slots)
            .get(&page)
            .map_or(0, Slot::queued)
    }

    /// Pages whose exclusive owner `owner` went unreachable holding the
    /// only current copy.
    pub fn lost_pages_owned_by(&self, owner: NodeId) -> Vec<PageNumber> {
        let mut pages: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                lock(&shard.slots)
                    .iter()
                    .filter(|(_, slot)| {
                        slot.record.lost && slot.record.state.owner() == Some(owner)
                    })
                    .map(|(&page, _)| page)
                    .collect::<Vec<_>>()
            })
            .collect();
        pages.sort();
        pages
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let slots = lock(&shard.slots);
            entries.extend(slots.iter().map(|(&page, slot)| DirectoryEntrySnapshot {
                page,
                state: slot.record.state.clone(),
                version: slot.record.version,
                lost: slot.record.lost,
                busy: slot.busy.is_some(),
                queued: slot.queued(),
            }));
        }
        entries.sort_by_key(|e| e.page);
        DirectorySnapshot {
            home: self.home,
            entries,
        }
    }

    // ── Internal ────────────────────────────────────────────────

    fn token(&self, page: PageNumber, serial: u64) -> TransitionToken<'_> {
        TransitionToken {
            directory: self,
            page,
            serial,
            finished: false,
        }
    }

    fn release(&self, page: PageNumber, serial: u64) {
        let shard = self.shard(page);
        let mut slots = lock(&shard.slots);
        if let Some(slot) = slots.get_mut(&page) {
            if slot.busy == Some(serial) {
                slot.busy = None;
                shard.released.notify_all();
            }
        }
        Self::prune(&mut slots, page);
    }

    fn prune(slots: &mut HashMap<PageNumber, Slot>, page: PageNumber) {
        if slots.get(&page).is_some_and(Slot::is_vacant) {
            slots.remove(&page);
        }
    }

    fn dequeue(slot: &mut Slot, ticket: u64) {
        if let Some(pending) = &mut slot.pending {
            pending.tickets.retain(|&t| t != ticket);
            if pending.tickets.is_empty() {
                slot.pending = None;
            }
        }
    }

    fn check_commit(
        page: PageNumber,
        old: &PageRecord,
        new: &PageRecord,
    ) -> Result<(), DirectoryError> {
        let new_owner = match (&old.state, &new.state) {
            (PageState::Exclusive { owner: before }, PageState::Exclusive { owner }) => {
                before != owner
            }
            (_, PageState::Exclusive { .. }) => true,
            _ => false,
        };
        let detail = if new.data.len() != PAGE_SIZE {
            format!("home copy is {} bytes", new.data.len())
        } else if !legal_commit(
            old.state.kind(),
            old.version,
            new.state.kind(),
            new.version,
            new_owner,
        ) {
            format!(
                "{:?} v{} -> {:?} v{}",
                old.state.kind(),
                old.version,
                new.state.kind(),
                new.version
            )
        } else {
            return Ok(());
        };
        Err(DirectoryError::IllegalTransition { page, detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const HOME: NodeId = NodeId(0);
    const P: PageNumber = PageNumber(7);

    fn shared(nodes: &[u32]) -> PageState {
        PageState::Shared {
            sharers: nodes.iter().map(|&n| NodeId(n)).collect(),
        }
    }

    #[test]
    fn untouched_page_is_invalid_at_home() {
        let dir = PageDirectory::new(HOME, 4);
        let view = dir.lookup(P);
        assert_eq!(view.state, PageState::Invalid);
        assert_eq!(view.version, 0);
        assert_eq!(view.owner_or_home, HOME);
        assert!(view.sharers.is_empty());
    }

    #[test]
    fn commit_updates_lookup() {
        let dir = PageDirectory::new(HOME, 4);
        let token = dir.begin_transition(P).unwrap();
        let mut record = dir.entry(&token).unwrap();
        record.state = PageState::Exclusive { owner: NodeId(2) };
        record.version = 1;
        dir.commit(token, record).unwrap();

        let view = dir.lookup(P);
        assert_eq!(view.state, PageState::Exclusive { owner: NodeId(2) });
        assert_eq!(view.owner_or_home, NodeId(2));
        assert_eq!(view.version, 1);
    }

    #[test]
    fn second_transition_is_busy() {
        let dir = PageDirectory::new(HOME, 4);
        let token = dir.begin_transition(P).unwrap();
        assert_eq!(
            dir.begin_transition(P).unwrap_err(),
            DirectoryError::Busy { page: P }
        );
        // Other pages are unaffected.
        let other = dir.begin_transition(PageNumber(8)).unwrap();
        dir.abort(other);
        dir.abort(token);
        assert!(dir.begin_transition(P).is_ok());
    }

    #[test]
    fn dropped_token_releases_page() {
        let dir = PageDirectory::new(HOME, 1);
        {
            let _token = dir.begin_transition(P).unwrap();
        }
        assert!(dir.begin_transition(P).is_ok());
    }

    #[test]
    fn illegal_commit_is_rejected_and_releases() {
        let dir = PageDirectory::new(HOME, 1);
        let token = dir.begin_transition(P).unwrap();
        let mut record = dir.entry(&token).unwrap();
        record.state = shared(&[1]);
        record.version = 3;
        assert!(matches!(
            dir.commit(token, record),
            Err(DirectoryError::IllegalTransition { .. })
        ));
        assert_eq!(dir.lookup(P).version, 0);
        assert!(dir.begin_transition(P).is_ok());
    }

    #[test]
    fn queue_times_out_and_cleans_up() {
        let dir = PageDirectory::new(HOME, 1);
        let token = dir.begin_transition(P).unwrap();
        let err = dir
            .begin_transition_queued(P, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, DirectoryError::QueueTimeout { .. }));
        assert_eq!(dir.queued(P), 0);
        dir.abort(token);
    }

    #[test]
    fn probed_pages_leave_no_entry() {
        let dir = PageDirectory::new(HOME, 2);
        let token = dir.begin_transition(P).unwrap();
        assert_eq!(dir.snapshot().entries.len(), 1);
        dir.abort(token);
        {
            let _dropped = dir
                .begin_transition_queued(PageNumber(8), Duration::from_secs(1))
                .unwrap();
        }
        let token = dir.begin_transition(PageNumber(9)).unwrap();
        let record = dir.entry(&token).unwrap();
        dir.commit(token, record).unwrap();
        assert!(dir.snapshot().entries.is_empty());

        // Same when a waiter gave up behind the holder.
        let token = dir.begin_transition(P).unwrap();
        assert!(dir
            .begin_transition_queued(P, Duration::from_millis(5))
            .is_err());
        dir.abort(token);
        assert!(dir.snapshot().entries.is_empty());

        // Entries with history stay.
        let token = dir.begin_transition(P).unwrap();
        let mut record = dir.entry(&token).unwrap();
        record.state = shared(&[1]);
        dir.commit(token, record).unwrap();
        let token = dir.begin_transition(P).unwrap();
        dir.abort(token);
        assert_eq!(dir.snapshot().entries.len(), 1);
    }

    #[test]
    fn queued_requests_are_served_in_arrival_order() {
        let dir = Arc::new(PageDirectory::new(HOME, 2));
        let order = Arc::new(Mutex::new(Vec::new()));
        let token = dir.begin_transition(P).unwrap();

        let mut handles = Vec::new();
        for requester in 1..=3u32 {
            let worker_dir = Arc::clone(&dir);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let token = worker_dir
                    .begin_transition_queued(P, Duration::from_secs(10))
                    .unwrap();
                order.lock().unwrap().push(requester);
                let mut record = worker_dir.entry(&token).unwrap();
                record.state = PageState::Exclusive {
                    owner: NodeId(requester),
                };
                record.version += 1;
                worker_dir.commit(token, record).unwrap();
            }));
            // Wait until this requester is queued before starting the next.
            while dir.queued(P) < requester as usize {
                thread::yield_now();
            }
        }

        assert!(dir.snapshot().entries[0].busy);
        dir.abort(token);
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        let view = dir.lookup(P);
        assert_eq!(view.version, 3);
        assert_eq!(view.state, PageState::Exclusive { owner: NodeId(3) });
        assert_eq!(dir.queued(P), 0);
    }

    #[test]
    fn snapshot_is_sorted() {
        let dir = PageDirectory::new(HOME, 4);
        for page in [9u64, 2, 5] {
            let token = dir.begin_transition(PageNumber(page)).unwrap();
            let mut record = dir.entry(&token).unwrap();
            record.state = shared(&[1]);
            dir.commit(token, record).unwrap();
        }
        let snap = dir.snapshot();
        let pages: Vec<_> = snap.entries.iter().map(|e| e.page.0).collect();
        assert_eq!(pages, vec![2, 5, 9]);
        assert!(snap.entries.iter().all(|e| !e.busy && e.queued == 0));
    }

    #[test]
    fn permits_copy() {
        assert!(!PageState::Invalid.permits_copy(NodeId(1)));
        assert!(shared(&[1, 2]).permits_copy(NodeId(2)));
        assert!(!shared(&[1, 2]).permits_copy(NodeId(3)));
        assert!(PageState::Exclusive { owner: NodeId(4) }.permits_copy(NodeId(4)));
    }
}
