//! Coherence Engine: resolves page faults and runs the home side of the
//! invalidate-on-write protocol.
//!
//! All transitions on a page are driven by its home.  A requester never
//! talks to an owner or sharer directly:
//!
//! ```text
//! requester                 home (holds TransitionToken)        owner / sharers
//! ─────────                 ────────────────────────────        ───────────────
//! PageRequest  ──────────→  Exclusive{o}: Recall(downgrade) ──→ o keeps RO copy
//!                           Shared/Invalid: add requester
//!              ←──────────  PageReply(v)
//!
//! WriteRequest ──────────→  Exclusive{o}: Recall ────────────→  o drops copy
//!                           Shared{s}: Invalidate(v) ────────→  each s ≠ requester
//!                           Exclusive{requester}, v+1
//!              ←──────────  WriteGrant(v+1)
//! ```
//!
//! # Fault containment
//!
//! - A requester the home considers dead is answered `Nack(Fenced)`; it
//!   must rejoin and revalidate before it may fetch again.
//! - A dead sharer is evicted from the sharer set so a writer is never
//!   blocked by it ([`ClusterEvent::SharerEvicted`]).
//! - A dead exclusive owner makes the page unreadable, reported once as
//!   [`ClusterEvent::PageLost`]; the page recovers if the owner rejoins.
//! - A reply that contradicts the protocol poisons the page locally.
//!
//! # Rejoin
//!
//! A dead peer is revived only by its own `Rejoin`, never by a reply
//! that happens to get through:
//!
//! ```text
//! rejoining node                     peer
//! ──────────────                     ────
//! Rejoin ─────────────────────────→  mark alive
//!                                    recall pages it owned that were lost
//!                                    revalidate own copies of its pages
//!        ←─────────────────────────  RejoinAck
//! mark peer alive
//! revalidate copies of the peer's pages (even if no ack came back)
//! ```

use crate::config::NodeConfig;
use crate::directory::{PageDirectory, PageRecord, PageState, TransitionToken};
use crate::error::{CoherenceError, MigrationError, TransportError};
use crate::events::{ClusterEvent, EventLog};
use crate::membership::Membership;
use crate::migration::MigrationEngine;
use crate::pages::{Access, Install, LocalPages};
use crate::placement::{decide, Decision, PlacementInput};
use crate::stats::{bump, NodeStats};
use crate::transport::PeerClient;
use crate::vcpu::VcpuTable;
use hyperkernel_protocol::{Message, NackReason, NodeId, PageNumber, VcpuId};
use log::{debug, info, trace, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// How a fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A usable local copy was already present.
    Present { version: u64 },
    /// A copy was fetched and installed.
    Resolved { version: u64, access: Access },
    /// The faulting vCPU now runs on `target`; it must not resume here.
    Migrated { target: NodeId },
}

/// Why the home could not get the current data from an owner.
enum RecallFailure {
    Unreachable,
    Violation(String),
}

pub struct CoherenceEngine {
    local: NodeId,
    config: NodeConfig,
    membership: Arc<Membership>,
    directory: PageDirectory,
    pages: Arc<LocalPages>,
    vcpus: Arc<VcpuTable>,
    migration: Arc<MigrationEngine>,
    client: Arc<PeerClient>,
    events: Arc<EventLog>,
    stats: Arc<NodeStats>,
}

impl CoherenceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeConfig,
        membership: Arc<Membership>,
        pages: Arc<LocalPages>,
        vcpus: Arc<VcpuTable>,
        migration: Arc<MigrationEngine>,
        client: Arc<PeerClient>,
        events: Arc<EventLog>,
        stats: Arc<NodeStats>,
    ) -> Self {
        let local = membership.local();
        Self {
            local,
            directory: PageDirectory::new(local, config.directory_shards),
            config,
            membership,
            pages,
            vcpus,
            migration,
            client,
            events,
            stats,
        }
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    // ═══════════════════════════════════════════════════════════════
    //  Requester side
    // ═══════════════════════════════════════════════════════════════

    /// Resolve an access fault on `page`.  With a `vcpu`, the placement
    /// policy may move the vCPU instead of fetching.
    pub fn handle_fault(
        &self,
        vcpu: Option<VcpuId>,
        page: PageNumber,
        access: Access,
    ) -> Result<FaultOutcome, CoherenceError> {
        if let Some(vcpu) = vcpu {
            if !self.vcpus.may_resume(vcpu) {
                return Err(CoherenceError::NotRunnable { vcpu });
            }
        }
        bump(&self.stats.faults);
        let home = self.membership.home_of(page);
        let mut refaults = 0u32;
        let mut consulted = false;

        loop {
            if self.pages.is_poisoned(page) {
                return Err(CoherenceError::Poisoned { page });
            }
            if self.pages.satisfies(page, access) {
                if let Some(version) = self.pages.version(page) {
                    bump(&self.stats.local_hits);
                    return Ok(FaultOutcome::Present { version });
                }
            }

            if let (Some(vcpu), false) = (vcpu, consulted) {
                consulted = true;
                if let Some(target) = self.consult_placement(vcpu, page, home) {
                    match self.migration.migrate(vcpu, target) {
                        Ok(()) => return Ok(FaultOutcome::Migrated { target }),
                        Err(MigrationError::Rejected { .. }) => {
                            debug!("{}: {vcpu} refused by {target}, fetching {page}", self.local);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            let guard = self.pages.begin_fetch(page);
            if self.pages.satisfies(page, access) {
                // Someone else fetched it while we waited.
                continue;
            }
            bump(&self.stats.fetches);

            let request = match access {
                Access::Read => Message::PageRequest {
                    page,
                    requester: self.local,
                    known_version: self.pages.version(page),
                },
                Access::Write => Message::WriteRequest {
                    page,
                    requester: self.local,
                },
            };
            trace!("{}: {request} to {home}", self.local);
            let reply = self
                .deliver(home, request)
                .map_err(|_| CoherenceError::NodeUnreachable { node: home, page })?;

            let (version, data) = match (access, reply) {
                (Access::Read, Message::PageReply { page: p, version, data })
                | (Access::Write, Message::WriteGrant { page: p, version, data })
                    if p == page =>
                {
                    (version, data)
                }
                (_, Message::Nack { page: p, reason }) if p == page => {
                    drop(guard);
                    match reason {
                        NackReason::Fenced => {
                            info!("{}: fenced by {home}, rejoining", self.local);
                            self.rejoin(home)
                                .map_err(|_| CoherenceError::NodeUnreachable { node: home, page })?;
                        }
                        NackReason::OwnerUnreachable(owner) => {
                            return Err(CoherenceError::NodeUnreachable { node: owner, page });
                        }
                        NackReason::QueueTimeout => {}
                        NackReason::NotHome | NackReason::Violation => {
                            return Err(self.violation(page, format!("{home} answered {reason}")));
                        }
                    }
                    refaults += 1;
                    if refaults > self.config.max_stale_refaults {
                        return Err(match reason {
                            NackReason::QueueTimeout => CoherenceError::QueueTimeout { page },
                            _ => CoherenceError::StaleVersion { page, refaults },
                        });
                    }
                    continue;
                }
                (_, other) => {
                    return Err(self.violation(page, format!("{home} answered {other}")));
                }
            };

            match self.pages.install(page, access, version, data) {
                Install::Installed => {
                    if access == Access::Write {
                        bump(&self.stats.write_grants);
                    }
                    return Ok(FaultOutcome::Resolved { version, access });
                }
                install => {
                    if install == Install::Fenced {
                        bump(&self.stats.stale_refaults);
                    }
                    refaults += 1;
                    debug!("{}: reply for {page} v{version} went stale ({refaults})", self.local);
                    if refaults > self.config.max_stale_refaults {
                        return Err(CoherenceError::StaleVersion { page, refaults });
                    }
                }
            }
        }
    }

    fn consult_placement(&self, vcpu: VcpuId, page: PageNumber, home: NodeId) -> Option<NodeId> {
        let home_liveness = self.membership.liveness(home);
        let home_saturated = home != self.local && self.membership.consult_saturation(home);
        let placement = &self.config.placement;

        self.vcpus
            .with_placement(vcpu, |history, dwell| {
                history.record(page, home);
                let input = PlacementInput {
                    page,
                    local: self.local,
                    home,
                    home_liveness,
                    home_saturated,
                    history: &*history,
                    dwell,
                };
                match decide(placement, &input) {
                    Decision::MigrateVcpu { target } => Some(target),
                    Decision::FetchPage => None,
                }
            })
            .flatten()
    }

    /// Poison `page` locally and report the contradiction.
    fn violation(&self, page: PageNumber, detail: String) -> CoherenceError {
        self.pages.poison(page);
        self.events.push(ClusterEvent::ProtocolViolation {
            page: Some(page),
            detail: detail.clone(),
        });
        CoherenceError::ProtocolViolation { page, detail }
    }

    /// Send to a peer, or dispatch locally when the peer is this node.
    fn deliver(&self, to: NodeId, msg: Message) -> Result<Message, TransportError> {
        if to == self.local {
            Ok(self.handle(self.local, msg))
        } else {
            self.client.call(to, msg)
        }
    }

    // ═══════════════════════════════════════════════════════════════
    //  Recovery
    // ═══════════════════════════════════════════════════════════════

    /// Ask `home` to treat this node as alive again, then drop every
    /// cached copy of its pages it no longer vouches for.
    pub fn rejoin(&self, home: NodeId) -> Result<usize, TransportError> {
        let announced = if home == self.local {
            Ok(())
        } else {
            self.announce(home)
        };
        // Copies are checked even when the ack was lost: the home may
        // already count this node as alive.
        let dropped = self.revalidate(Some(home));
        announced.map(|()| dropped)
    }

    /// Send `Rejoin` to `peer`; on its ack, treat `peer` as alive again.
    pub fn announce(&self, peer: NodeId) -> Result<(), TransportError> {
        match self.client.probe(peer, Message::Rejoin { node: self.local })? {
            Message::RejoinAck { .. } => {
                if self.membership.mark_alive(peer) {
                    info!("{}: {peer} is back", self.local);
                }
            }
            other => warn!("{}: {peer} answered rejoin with {other}", self.local),
        }
        Ok(())
    }

    /// Check cached copies against their homes' directories, dropping
    /// the stale ones.  `None` checks every copy.  Returns how many
    /// copies were dropped.
    ///
    /// A read-only copy whose home cannot vouch for it is dropped too.
    /// A writable copy is kept: its home never regrants the page without
    /// first recalling it, so it is current by construction.
    pub fn revalidate(&self, home: Option<NodeId>) -> usize {
        let mut dropped = 0;
        for (page, version) in self.pages.cached_pages() {
            let page_home = self.membership.home_of(page);
            if home.is_some_and(|h| h != page_home) {
                continue;
            }
            let msg = Message::Validate {
                page,
                known_version: version,
            };
            match self.deliver(page_home, msg) {
                Ok(Message::ValidateReply { valid: true, .. }) => {}
                Ok(Message::ValidateReply { valid: false, .. }) => {
                    if self.pages.drop_copy(page, version) {
                        dropped += 1;
                        self.events
                            .push(ClusterEvent::StaleCopyDropped { page, version });
                    }
                }
                outcome => {
                    match outcome {
                        Ok(other) => warn!("{}: validating {page}: {page_home} answered {other}", self.local),
                        Err(e) => warn!("{}: cannot validate {page}: {e}", self.local),
                    }
                    if self.pages.access(page) == Some(Access::Read)
                        && self.pages.drop_copy(page, version)
                    {
                        dropped += 1;
                    }
                }
            }
        }
        dropped
    }

    // ═══════════════════════════════════════════════════════════════
    //  Inbound dispatch
    // ═══════════════════════════════════════════════════════════════

    /// Answer a coherence request from `from`.
    pub fn handle(&self, from: NodeId, msg: Message) -> Message {
        match msg {
            Message::PageRequest {
                page, requester, ..
            } => self.serve(from, requester, page, Access::Read),
            Message::WriteRequest { page, requester } => {
                self.serve(from, requester, page, Access::Write)
            }
            Message::Invalidate { page, version } => {
                bump(&self.stats.invalidations_received);
                if self.pages.invalidate(page, version) == Some(Access::Write) {
                    self.events.push(ClusterEvent::ProtocolViolation {
                        page: Some(page),
                        detail: format!("{from} invalidated a writable copy at v{version}"),
                    });
                }
                Message::InvalidateAck { page }
            }
            Message::Recall {
                page,
                version,
                downgrade,
            } => Message::RecallReply {
                page,
                version,
                data: self.pages.recall(page, version, downgrade),
            },
            Message::Validate {
                page,
                known_version,
            } => self.validate(from, page, known_version),
            Message::Rejoin { .. } => {
                if self.membership.mark_alive(from) {
                    self.events.push(ClusterEvent::NodeRejoined { node: from });
                }
                self.recover_lost_pages(from);
                self.revalidate(Some(from));
                Message::RejoinAck { node: self.local }
            }
            other => {
                warn!("{}: unexpected {other} from {from}", self.local);
                self.nack(other.page().unwrap_or(PageNumber(0)), NackReason::Violation)
            }
        }
    }

    fn nack(&self, page: PageNumber, reason: NackReason) -> Message {
        bump(&self.stats.nacks_sent);
        Message::Nack { page, reason }
    }

    fn validate(&self, from: NodeId, page: PageNumber, known_version: u64) -> Message {
        if !self.membership.is_home(page) {
            return self.nack(page, NackReason::NotHome);
        }
        let view = self.directory.lookup(page);
        Message::ValidateReply {
            page,
            version: view.version,
            valid: view.version == known_version && view.state.permits_copy(from),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    //  Home side
    // ═══════════════════════════════════════════════════════════════

    fn serve(&self, from: NodeId, requester: NodeId, page: PageNumber, access: Access) -> Message {
        if requester != from {
            return self.nack(page, NackReason::Violation);
        }
        if !self.membership.is_home(page) {
            return self.nack(page, NackReason::NotHome);
        }
        if self.membership.is_dead(requester) {
            debug!("{}: {requester} is fenced, refusing {page}", self.local);
            return self.nack(page, NackReason::Fenced);
        }

        let token = match self
            .directory
            .begin_transition_queued(page, self.config.queue_wait())
        {
            Ok(token) => token,
            Err(e) => {
                debug!("{}: {e}", self.local);
                return self.nack(page, NackReason::QueueTimeout);
            }
        };
        let mut record = match self.directory.entry(&token) {
            Ok(record) => record,
            Err(e) => {
                warn!("{}: {e}", self.local);
                return self.nack(page, NackReason::Violation);
            }
        };

        // Bring the home copy up to date and settle who keeps a copy.
        let keep = match record.state.clone() {
            // The owner's last copy may only exist in its recall buffer;
            // it is fetched back when the owner rejoins.
            PageState::Exclusive { owner } if owner == requester && record.lost => {
                self.directory.abort(token);
                return self.nack(page, NackReason::Fenced);
            }
            PageState::Exclusive { owner } if owner == requester => BTreeSet::new(),
            PageState::Exclusive { owner } => {
                let downgrade = access == Access::Read;
                match self.recall(owner, page, record.version, downgrade) {
                    Ok(Some(data)) => {
                        record.data = data;
                        if downgrade {
                            BTreeSet::from([owner])
                        } else {
                            BTreeSet::new()
                        }
                    }
                    // The owner never installed its grant.
                    Ok(None) => BTreeSet::new(),
                    Err(RecallFailure::Unreachable) => {
                        return self.owner_lost(token, record, page, owner);
                    }
                    Err(RecallFailure::Violation(detail)) => {
                        self.events.push(ClusterEvent::ProtocolViolation {
                            page: Some(page),
                            detail,
                        });
                        return self.nack(page, NackReason::Violation);
                    }
                }
            }
            PageState::Shared { sharers } if access == Access::Write => {
                if let Err(detail) =
                    self.invalidate_sharers(page, record.version, &sharers, requester)
                {
                    self.events.push(ClusterEvent::ProtocolViolation {
                        page: Some(page),
                        detail,
                    });
                    self.directory.abort(token);
                    return self.nack(page, NackReason::Violation);
                }
                BTreeSet::new()
            }
            PageState::Shared { sharers } => sharers,
            PageState::Invalid => BTreeSet::new(),
        };

        let reply = match access {
            Access::Read => {
                let mut sharers = keep;
                sharers.insert(requester);
                record.state = PageState::Shared { sharers };
                Message::PageReply {
                    page,
                    version: record.version,
                    data: record.data.clone(),
                }
            }
            Access::Write => {
                if record.state != (PageState::Exclusive { owner: requester }) {
                    record.state = PageState::Exclusive { owner: requester };
                    record.version += 1;
                }
                Message::WriteGrant {
                    page,
                    version: record.version,
                    data: record.data.clone(),
                }
            }
        };
        record.lost = false;

        match self.directory.commit(token, record) {
            Ok(()) => {
                trace!("{}: {page} -> {reply}", self.local);
                reply
            }
            Err(e) => {
                self.events.push(ClusterEvent::ProtocolViolation {
                    page: Some(page),
                    detail: e.to_string(),
                });
                self.nack(page, NackReason::Violation)
            }
        }
    }

    fn recall(
        &self,
        owner: NodeId,
        page: PageNumber,
        version: u64,
        downgrade: bool,
    ) -> Result<Option<Vec<u8>>, RecallFailure> {
        bump(&self.stats.recalls_sent);
        let msg = Message::Recall {
            page,
            version,
            downgrade,
        };
        match self.deliver(owner, msg) {
            Ok(Message::RecallReply {
                page: p,
                version: v,
                data,
            }) if p == page && v == version => Ok(data),
            Ok(other) => Err(RecallFailure::Violation(format!(
                "{owner} answered recall of {page} with {other}"
            ))),
            Err(e) => {
                warn!("{}: recall of {page} from {owner}: {e}", self.local);
                Err(RecallFailure::Unreachable)
            }
        }
    }

    /// Invalidate every sharer except `requester`.  Sharers that cannot
    /// be reached are evicted.  A sharer that answers with anything but
    /// an ack may still hold a readable copy, so the write must not
    /// proceed.
    fn invalidate_sharers(
        &self,
        page: PageNumber,
        version: u64,
        sharers: &BTreeSet<NodeId>,
        requester: NodeId,
    ) -> Result<(), String> {
        for &sharer in sharers.iter().filter(|&&s| s != requester) {
            bump(&self.stats.invalidations_sent);
            match self.deliver(sharer, Message::Invalidate { page, version }) {
                Ok(Message::InvalidateAck { page: p }) if p == page => {}
                Ok(other) => return Err(format!("{sharer} answered invalidate with {other}")),
                Err(_) => {
                    self.events
                        .push(ClusterEvent::SharerEvicted { page, sharer });
                }
            }
        }
        Ok(())
    }

    /// Pull back the data of every page lost with `owner`, now that it
    /// answers again.  The owner keeps a read-only copy.
    fn recover_lost_pages(&self, owner: NodeId) {
        for page in self.directory.lost_pages_owned_by(owner) {
            let Ok(token) = self
                .directory
                .begin_transition_queued(page, self.config.queue_wait())
            else {
                continue;
            };
            let mut record = match self.directory.entry(&token) {
                Ok(record) if record.lost && record.state.owner() == Some(owner) => record,
                _ => {
                    self.directory.abort(token);
                    continue;
                }
            };
            match self.recall(owner, page, record.version, true) {
                Ok(Some(data)) => {
                    record.data = data;
                    record.state = PageState::Shared {
                        sharers: BTreeSet::from([owner]),
                    };
                }
                // Never installed; the home copy is current.
                Ok(None) => {}
                Err(_) => {
                    self.directory.abort(token);
                    continue;
                }
            }
            record.lost = false;
            match self.directory.commit(token, record) {
                Ok(()) => info!("{}: {page} recovered from {owner}", self.local),
                Err(e) => warn!("{}: recovering {page}: {e}", self.local),
            }
        }
    }

    /// The exclusive owner is unreachable: the only current copy is out
    /// of reach.  Reported once per loss.
    fn owner_lost(
        &self,
        token: TransitionToken<'_>,
        mut record: PageRecord,
        page: PageNumber,
        owner: NodeId,
    ) -> Message {
        if record.lost {
            self.directory.abort(token);
        } else {
            record.lost = true;
            self.events.push(ClusterEvent::PageLost { page, owner });
            if let Err(e) = self.directory.commit(token, record) {
                warn!("{}: recording loss of {page}: {e}", self.local);
            }
        }
        self.nack(page, NackReason::OwnerUnreachable(owner))
    }
}
