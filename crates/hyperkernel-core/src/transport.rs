//! Request/reply transport and the retrying client every engine sends
//! through.
//!
//! [`Transport`] is the raw channel: one attempt, one reply or one error.
//! [`PeerClient`] layers the retry policy and liveness bookkeeping on
//! top:
//!
//! ```text
//! call(to) ─→ attempt ─ok─→ reply (peer marked Alive if it was Suspected)
//!               │ timeout
//!               ▼
//!           Suspected, back off, retry ... max_attempts
//!               │ exhausted
//!               ▼
//!           Dead + NodeUnreachable event ─→ Err(Unreachable)
//! ```
//!
//! Calls to a peer already marked `Dead` fail immediately; only
//! [`PeerClient::probe`] talks to a dead peer, which is how a node
//! re-announces itself after a partition heals.

use crate::config::RetryPolicy;
use crate::error::TransportError;
use crate::events::{ClusterEvent, EventLog};
use crate::membership::{Liveness, Membership};
use crate::verified::backoff::backoff_delay;
use hyperkernel_protocol::{Message, NodeId};
use log::{debug, trace};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A synchronous request/reply channel between nodes.
pub trait Transport: Send + Sync {
    /// Deliver `msg` to `to` and wait up to `timeout` for its reply.
    fn call(
        &self,
        from: NodeId,
        to: NodeId,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError>;
}

/// Receiving side: every request gets exactly one reply.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, from: NodeId, msg: Message) -> Message;
}

pub struct PeerClient {
    local: NodeId,
    transport: Arc<dyn Transport>,
    membership: Arc<Membership>,
    policy: RetryPolicy,
    events: Arc<EventLog>,
}

impl PeerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        membership: Arc<Membership>,
        policy: RetryPolicy,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            local: membership.local(),
            transport,
            membership,
            policy,
            events,
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Send `msg` to `to` under the retry policy.
    pub fn call(&self, to: NodeId, msg: Message) -> Result<Message, TransportError> {
        match self.membership.liveness(to) {
            None => Err(TransportError::UnknownNode(to)),
            Some(Liveness::Dead) => Err(TransportError::PeerDead { to }),
            Some(_) => self.call_with_retry(to, msg),
        }
    }

    /// Like [`call`](Self::call), but also reaches peers marked dead.
    pub fn probe(&self, to: NodeId, msg: Message) -> Result<Message, TransportError> {
        if !self.membership.is_member(to) {
            return Err(TransportError::UnknownNode(to));
        }
        self.call_with_retry(to, msg)
    }

    fn call_with_retry(&self, to: NodeId, msg: Message) -> Result<Message, TransportError> {
        let timeout = self.policy.timeout();
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 0..attempts {
            match self.transport.call(self.local, to, msg.clone(), timeout) {
                Ok(reply) => {
                    // A dead peer comes back only through Rejoin.
                    if self.membership.liveness(to) == Some(Liveness::Suspected)
                        && self.membership.mark_alive(to)
                    {
                        debug!("{}: {to} answered again", self.local);
                    }
                    return Ok(reply);
                }
                Err(TransportError::Timeout { .. }) => {
                    if self.membership.suspect(to) {
                        self.events.push(ClusterEvent::NodeSuspected { node: to });
                    }
                    if attempt + 1 < attempts {
                        let delay = backoff_delay(
                            attempt,
                            self.policy.base_backoff_us,
                            self.policy.max_backoff_us,
                        );
                        trace!("{}: {msg} to {to} timed out, retry in {delay}us", self.local);
                        thread::sleep(Duration::from_micros(delay));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if self.membership.declare_dead(to) {
            self.events.push(ClusterEvent::NodeUnreachable { node: to });
        }
        Err(TransportError::Unreachable { to, attempts })
    }
}
