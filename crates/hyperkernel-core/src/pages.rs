//! Local page cache: the copies of remote-homed (and home-held) pages
//! this node may access directly.
//!
//! Besides the copies themselves, each page keeps three pieces of
//! bookkeeping that make message reordering safe:
//!
//! - **fence**: the highest version the home has invalidated or
//!   recalled here.  A fetch reply at or below the fence is refused, so
//!   a grant overtaken by its own invalidation is never installed.
//! - **fetching**: at most one fetch per page is outstanding from this
//!   node; later faults wait for it and then re-check.
//! - **recalled**: the data last surrendered to a recall, kept so a
//!   retried recall gets the same answer.
//!
//! ```text
//!               install(v > fence)
//!   (no copy) ─────────────────────→ copy(access, v)
//!       ↑  invalidate / recall(v)         │ recall(downgrade)
//!       └─────────────────────────────────┤
//!                                         ▼
//!                                    copy(Read, v)
//! ```

use crate::lock;
use crate::snapshot::CachedPageSnapshot;
use hyperkernel_protocol::{PageNumber, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};

/// Kind of access a guest makes, and the right a cached copy grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    /// A writable copy also serves reads.
    pub fn covers(self, wanted: Access) -> bool {
        self >= wanted
    }
}

/// Result of offering a fetched copy to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Install {
    Installed,
    /// The home already invalidated or recalled this version.
    Fenced,
    /// A copy at least as new and as strong is already present.
    Stale,
}

#[derive(Debug)]
struct CachedPage {
    access: Access,
    version: u64,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct LocalSlot {
    copy: Option<CachedPage>,
    fence: Option<u64>,
    fetching: bool,
    poisoned: bool,
    recalled: Option<(u64, Vec<u8>)>,
}

impl LocalSlot {
    fn raise_fence(&mut self, version: u64) {
        self.fence = Some(self.fence.map_or(version, |f| f.max(version)));
    }
}

#[derive(Debug, Default)]
struct Shard {
    slots: Mutex<HashMap<PageNumber, LocalSlot>>,
    fetch_done: Condvar,
}

#[derive(Debug)]
pub struct LocalPages {
    shards: Vec<Shard>,
}

/// Marks the single outstanding fetch of one page.  Dropping it lets
/// the next waiting fault proceed.
#[derive(Debug)]
pub struct FetchGuard<'a> {
    pages: &'a LocalPages,
    page: PageNumber,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let shard = self.pages.shard(self.page);
        if let Some(slot) = lock(&shard.slots).get_mut(&self.page) {
            slot.fetching = false;
        }
        shard.fetch_done.notify_all();
    }
}

impl LocalPages {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Shard::default()).collect(),
        }
    }

    fn shard(&self, page: PageNumber) -> &Shard {
        &self.shards[(page.0 % self.shards.len() as u64) as usize]
    }

    /// Whether a local copy permits `access` right now.
    pub fn satisfies(&self, page: PageNumber, access: Access) -> bool {
        lock(&self.shard(page).slots)
            .get(&page)
            .and_then(|s| s.copy.as_ref().filter(|_| !s.poisoned))
            .is_some_and(|c| c.access.covers(access))
    }

    pub fn version(&self, page: PageNumber) -> Option<u64> {
        lock(&self.shard(page).slots)
            .get(&page)
            .and_then(|s| s.copy.as_ref())
            .map(|c| c.version)
    }

    pub fn access(&self, page: PageNumber) -> Option<Access> {
        lock(&self.shard(page).slots)
            .get(&page)
            .and_then(|s| s.copy.as_ref())
            .map(|c| c.access)
    }

    /// Claim the right to fetch `page`, waiting out any fetch already in
    /// flight.  Invalidations seen before this point no longer apply.
    pub fn begin_fetch(&self, page: PageNumber) -> FetchGuard<'_> {
        let shard = self.shard(page);
        let mut slots = lock(&shard.slots);
        while slots.get(&page).is_some_and(|s| s.fetching) {
            slots = shard
                .fetch_done
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let slot = slots.entry(page).or_default();
        slot.fetching = true;
        slot.fence = None;
        FetchGuard { pages: self, page }
    }

    pub fn install(&self, page: PageNumber, access: Access, version: u64, data: Vec<u8>) -> Install {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let mut slots = lock(&self.shard(page).slots);
        let slot = slots.entry(page).or_default();

        if slot.fence.is_some_and(|f| f >= version) {
            return Install::Fenced;
        }
        if let Some(copy) = &slot.copy {
            if copy.version > version || (copy.version == version && copy.access.covers(access)) {
                return Install::Stale;
            }
        }
        slot.copy = Some(CachedPage {
            access,
            version,
            data,
        });
        slot.recalled = None;
        Install::Installed
    }

    /// Drop any copy at or below `version`.  Returns the access of the
    /// dropped copy, if one was dropped.
    pub fn invalidate(&self, page: PageNumber, version: u64) -> Option<Access> {
        let mut slots = lock(&self.shard(page).slots);
        let slot = slots.entry(page).or_default();
        slot.raise_fence(version);
        match &slot.copy {
            Some(copy) if copy.version <= version => slot.copy.take().map(|c| c.access),
            _ => None,
        }
    }

    /// Surrender the copy at `version` to the home.  With `downgrade`
    /// the copy stays, read-only; otherwise it is dropped.
    ///
    /// `None` means this node holds no data for that version: the grant
    /// was never installed, so the home copy is still current.
    pub fn recall(&self, page: PageNumber, version: u64, downgrade: bool) -> Option<Vec<u8>> {
        let mut slots = lock(&self.shard(page).slots);
        let slot = slots.entry(page).or_default();

        match &mut slot.copy {
            Some(copy) if copy.version == version => {
                let data = copy.data.clone();
                if downgrade {
                    copy.access = Access::Read;
                } else {
                    slot.copy = None;
                    slot.raise_fence(version);
                }
                slot.recalled = Some((version, data.clone()));
                Some(data)
            }
            Some(copy) if copy.version > version => None,
            _ => {
                slot.copy = None;
                slot.raise_fence(version);
                slot.recalled
                    .as_ref()
                    .filter(|(v, _)| *v == version)
                    .map(|(_, data)| data.clone())
            }
        }
    }

    /// Drop the copy if it is still at `version`.
    pub fn drop_copy(&self, page: PageNumber, version: u64) -> bool {
        let mut slots = lock(&self.shard(page).slots);
        let Some(slot) = slots.get_mut(&page) else {
            return false;
        };
        if slot.copy.as_ref().is_some_and(|c| c.version == version) {
            slot.copy = None;
            slot.raise_fence(version);
            true
        } else {
            false
        }
    }

    /// Copy `len` bytes out of the page.  `None` if no usable copy.
    pub fn read(&self, page: PageNumber, offset: usize, len: usize) -> Option<Vec<u8>> {
        debug_assert!(offset + len <= PAGE_SIZE);
        let slots = lock(&self.shard(page).slots);
        let slot = slots.get(&page).filter(|s| !s.poisoned)?;
        slot.copy
            .as_ref()
            .map(|c| c.data[offset..offset + len].to_vec())
    }

    /// Store `bytes` into a writable copy.  False if there is none.
    pub fn write(&self, page: PageNumber, offset: usize, bytes: &[u8]) -> bool {
        debug_assert!(offset + bytes.len() <= PAGE_SIZE);
        let mut slots = lock(&self.shard(page).slots);
        match slots.get_mut(&page) {
            Some(LocalSlot {
                copy: Some(copy),
                poisoned: false,
                ..
            }) if copy.access == Access::Write => {
                copy.data[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Refuse all further local access to `page`.
    pub fn poison(&self, page: PageNumber) {
        let mut slots = lock(&self.shard(page).slots);
        slots.entry(page).or_default().poisoned = true;
    }

    pub fn is_poisoned(&self, page: PageNumber) -> bool {
        lock(&self.shard(page).slots)
            .get(&page)
            .is_some_and(|s| s.poisoned)
    }

    /// Every page with a copy, and the copy's version.
    pub fn cached_pages(&self) -> Vec<(PageNumber, u64)> {
        let mut pages: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                lock(&shard.slots)
                    .iter()
                    .filter_map(|(&p, s)| s.copy.as_ref().map(|c| (p, c.version)))
                    .collect::<Vec<_>>()
            })
            .collect();
        pages.sort();
        pages
    }

    pub fn snapshot(&self) -> Vec<CachedPageSnapshot> {
        let mut pages: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| {
                lock(&shard.slots)
                    .iter()
                    .filter_map(|(&page, s)| {
                        s.copy.as_ref().map(|c| CachedPageSnapshot {
                            page,
                            access: c.access,
                            version: c.version,
                            poisoned: s.poisoned,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        pages.sort_by_key(|p| p.page);
        pages
    }
}
