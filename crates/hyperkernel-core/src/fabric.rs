//! In-process simulated network.
//!
//! Every request and reply is encoded with the wire codec, passed
//! through the fault model, checked and decoded again before the
//! receiver sees it:
//!
//! ```text
//! sender ─→ encode ─→ + FCS ─→ crashed? partition? loss? corruption?
//!                                              │
//! handler ←─ decode ←─ FCS check ←─────────────┘
//! ```
//!
//! A frame lost to any of these surfaces to the sender as
//! [`TransportError::Timeout`], exactly as a dropped packet would.  The
//! simulated link appends a frame check sequence, so a corrupted frame
//! is always discarded rather than delivered with flipped payload bytes.
//!
//! Node index `i` in a [`Fault`] is `NodeId(i)`.  Fault decisions draw
//! from a seeded `ChaCha20Rng`, so a run is reproducible for a given seed
//! and message order.

use crate::error::TransportError;
use crate::transport::{MessageHandler, Transport};
use crate::verified::home::mix64;
use crate::{lock, read, write};
use hyperkernel_fault::Fault;
use hyperkernel_protocol::{codec, Envelope, Message, NodeId};
use log::{debug, info, trace};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, Weak};
use std::time::Duration;

/// Domain separator for the fabric RNG, `"NETFAB"`.
const FABRIC_SEED_SALT: u64 = 0x4E45_5446_4142;

/// Length of the link-level frame check sequence.
const FCS_LEN: usize = 8;

struct FabricState {
    /// Active partition rules, (side_a, side_b) pairs.
    partitions: Vec<(Vec<usize>, Vec<usize>)>,
    /// Per-node packet loss in parts per million.
    loss_rate_ppm: HashMap<usize, u32>,
    /// Per-node packet corruption in parts per million.
    corruption_rate_ppm: HashMap<usize, u32>,
    crashed: HashSet<usize>,
    rng: ChaCha20Rng,
}

impl FabricState {
    fn can_reach(&self, from: usize, to: usize) -> bool {
        self.partitions.iter().all(|(side_a, side_b)| {
            let across = |x: &Vec<usize>, y: &Vec<usize>| x.contains(&from) && y.contains(&to);
            !across(side_a, side_b) && !across(side_b, side_a)
        })
    }

    fn rate(rates: &HashMap<usize, u32>, from: usize, to: usize) -> u32 {
        let of = |n| rates.get(&n).copied().unwrap_or(0);
        of(from).max(of(to))
    }

    fn roll(&mut self, ppm: u32) -> bool {
        ppm > 0 && (self.rng.next_u64() % 1_000_000) < u64::from(ppm)
    }
}

pub struct SimNetwork {
    state: Mutex<FabricState>,
    handlers: RwLock<HashMap<NodeId, Weak<dyn MessageHandler>>>,
    messages_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Self {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&seed.wrapping_add(FABRIC_SEED_SALT).to_le_bytes());
        Self {
            state: Mutex::new(FabricState {
                partitions: Vec::new(),
                loss_rate_ppm: HashMap::new(),
                corruption_rate_ppm: HashMap::new(),
                crashed: HashSet::new(),
                rng: ChaCha20Rng::from_seed(key),
            }),
            handlers: RwLock::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Route frames addressed to `node` to `handler`.  The fabric holds
    /// only a weak reference, so nodes and fabric may reference each
    /// other.
    pub fn register(&self, node: NodeId, handler: Weak<dyn MessageHandler>) {
        write(&self.handlers).insert(node, handler);
    }

    /// Apply a network or node fault.  Returns false for faults the
    /// fabric does not model (resource faults).
    pub fn apply_fault(&self, fault: &Fault) -> bool {
        let mut state = lock(&self.state);
        match fault {
            Fault::NetworkPartition { side_a, side_b } => {
                info!("partition: {side_a:?} | {side_b:?}");
                state.partitions.push((side_a.clone(), side_b.clone()));
            }
            Fault::PacketLoss { target, rate_ppm } => {
                debug!("node{target} packet loss set to {rate_ppm} ppm");
                state.loss_rate_ppm.insert(*target, *rate_ppm);
            }
            Fault::PacketCorruption { target, rate_ppm } => {
                debug!("node{target} packet corruption set to {rate_ppm} ppm");
                state.corruption_rate_ppm.insert(*target, *rate_ppm);
            }
            Fault::NetworkHeal => {
                info!("network healed: partitions and packet faults removed");
                state.partitions.clear();
                state.loss_rate_ppm.clear();
                state.corruption_rate_ppm.clear();
            }
            Fault::NodeCrash { target } => {
                info!("node{target} crashed");
                state.crashed.insert(*target);
            }
            Fault::NodeRecover { target } => {
                info!("node{target} recovered");
                state.crashed.remove(target);
            }
            Fault::SlotExhaustion { .. } | Fault::SlotRestore { .. } => return false,
        }
        true
    }

    pub fn heal(&self) {
        self.apply_fault(&Fault::NetworkHeal);
    }

    pub fn crash(&self, node: NodeId) {
        self.apply_fault(&Fault::NodeCrash {
            target: node.0 as usize,
        });
    }

    pub fn recover(&self, node: NodeId) {
        self.apply_fault(&Fault::NodeRecover {
            target: node.0 as usize,
        });
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        lock(&self.state).crashed.contains(&(node.0 as usize))
    }

    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        lock(&self.state).can_reach(from.0 as usize, to.0 as usize)
    }

    /// Frames handed to the fabric so far.  The cluster's logical clock.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Carry one envelope across the fabric.  `None` if it was lost.
    fn send(&self, envelope: Envelope) -> Option<Envelope> {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let (from, to) = (envelope.from.0 as usize, envelope.to.0 as usize);

        let mut frame = codec::encode(&envelope);
        frame.extend_from_slice(&frame_check(&frame).to_le_bytes());

        let delivered = self.transmit(from, to, frame).and_then(|frame| {
            let (body, fcs) = frame.split_at(frame.len().checked_sub(FCS_LEN)?);
            if fcs != frame_check(body).to_le_bytes() {
                trace!("node{from} -> node{to}: frame check failed");
                return None;
            }
            match codec::decode(body) {
                Ok(decoded) if decoded.to == envelope.to => Some(decoded),
                Ok(decoded) => {
                    trace!("node{from} -> node{to}: misaddressed frame for {}", decoded.to);
                    None
                }
                Err(e) => {
                    trace!("node{from} -> node{to}: undecodable frame: {e}");
                    None
                }
            }
        });

        if delivered.is_none() {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Apply packet-level faults in order: crash, partition, loss,
    /// corruption.
    fn transmit(&self, from: usize, to: usize, mut frame: Vec<u8>) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);

        if state.crashed.contains(&from) || state.crashed.contains(&to) {
            trace!("node{from} -> node{to}: endpoint crashed");
            return None;
        }
        if !state.can_reach(from, to) {
            trace!("node{from} -> node{to}: dropped by partition");
            return None;
        }

        let loss = FabricState::rate(&state.loss_rate_ppm, from, to);
        if state.roll(loss) {
            trace!("node{from} -> node{to}: dropped by packet loss ({loss}ppm)");
            return None;
        }

        let corruption = FabricState::rate(&state.corruption_rate_ppm, from, to);
        if !frame.is_empty() && state.roll(corruption) {
            let index = (state.rng.next_u64() as usize) % frame.len();
            let flip = (state.rng.next_u64() & 0xFF) as u8 | 1;
            frame[index] ^= flip;
            trace!("node{from} -> node{to}: corrupted at byte {index}");
        }
        Some(frame)
    }
}

impl Transport for SimNetwork {
    fn call(
        &self,
        from: NodeId,
        to: NodeId,
        msg: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let timed_out = || TransportError::Timeout {
            to,
            timeout_ms: timeout.as_millis() as u64,
        };

        let request = self.send(Envelope::new(from, to, msg)).ok_or_else(timed_out)?;
        let handler = read(&self.handlers)
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(timed_out)?;

        // No fabric lock is held while the receiver runs: it may call
        // other nodes itself.
        let reply = handler.handle(request.from, request.body);
        let reply = self.send(Envelope::new(to, from, reply)).ok_or_else(timed_out)?;
        Ok(reply.body)
    }
}

/// Link-level check over a frame.  Any single corrupted byte changes
/// the result.
fn frame_check(frame: &[u8]) -> u64 {
    frame.chunks(8).fold(FABRIC_SEED_SALT, |acc, chunk| {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        mix64(acc ^ u64::from_le_bytes(word))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperkernel_protocol::PageNumber;
    use std::sync::Arc;

    struct Echo;

    impl MessageHandler for Echo {
        fn handle(&self, _from: NodeId, msg: Message) -> Message {
            Message::InvalidateAck {
                page: msg.page().unwrap_or(PageNumber(0)),
            }
        }
    }

    fn network() -> (SimNetwork, Arc<dyn MessageHandler>) {
        let net = SimNetwork::new(42);
        let echo: Arc<dyn MessageHandler> = Arc::new(Echo);
        for n in 0..3 {
            net.register(NodeId(n), Arc::downgrade(&echo));
        }
        (net, echo)
    }

    fn ping(net: &SimNetwork, from: u32, to: u32) -> Result<Message, TransportError> {
        net.call(
            NodeId(from),
            NodeId(to),
            Message::Invalidate {
                page: PageNumber(5),
                version: 1,
            },
            Duration::from_millis(1),
        )
    }

    #[test]
    fn delivers_and_replies() {
        let (net, _echo) = network();
        assert_eq!(
            ping(&net, 0, 1).unwrap(),
            Message::InvalidateAck { page: PageNumber(5) }
        );
        assert_eq!(net.messages_sent(), 2);
        assert_eq!(net.frames_dropped(), 0);
    }

    #[test]
    fn partition_blocks_both_directions() {
        let (net, _echo) = network();
        net.apply_fault(&Fault::NetworkPartition {
            side_a: vec![0],
            side_b: vec![1, 2],
        });
        assert!(!net.can_reach(NodeId(0), NodeId(2)));
        assert!(!net.can_reach(NodeId(2), NodeId(0)));
        assert!(net.can_reach(NodeId(1), NodeId(2)));
        assert!(matches!(ping(&net, 0, 1), Err(TransportError::Timeout { .. })));
        assert!(ping(&net, 1, 2).is_ok());

        net.heal();
        assert!(ping(&net, 0, 1).is_ok());
    }

    #[test]
    fn crashed_node_times_out() {
        let (net, _echo) = network();
        net.crash(NodeId(2));
        assert!(net.is_crashed(NodeId(2)));
        assert!(ping(&net, 0, 2).is_err());
        assert!(ping(&net, 2, 0).is_err());
        net.recover(NodeId(2));
        assert!(ping(&net, 0, 2).is_ok());
    }

    #[test]
    fn total_loss_drops_everything() {
        let (net, _echo) = network();
        net.apply_fault(&Fault::PacketLoss {
            target: 1,
            rate_ppm: 1_000_000,
        });
        for _ in 0..10 {
            assert!(ping(&net, 0, 1).is_err());
        }
        assert!(ping(&net, 0, 2).is_ok());
    }

    #[test]
    fn corrupted_frames_are_never_delivered() {
        let (net, _echo) = network();
        net.apply_fault(&Fault::PacketCorruption {
            target: 1,
            rate_ppm: 1_000_000,
        });
        for _ in 0..50 {
            assert!(ping(&net, 0, 1).is_err());
        }
        assert_eq!(net.frames_dropped(), 50);
    }

    #[test]
    fn unregistered_node_times_out() {
        let net = SimNetwork::new(1);
        assert!(matches!(ping(&net, 0, 1), Err(TransportError::Timeout { .. })));
    }

    #[test]
    fn resource_faults_are_not_network_faults() {
        let (net, _echo) = network();
        assert!(!net.apply_fault(&Fault::SlotExhaustion { target: 0 }));
    }

    #[test]
    fn frame_check_detects_single_byte_flips() {
        let frame: Vec<u8> = (0..40).collect();
        let good = frame_check(&frame);
        for i in 0..frame.len() {
            let mut bad = frame.clone();
            bad[i] ^= 0x01;
            assert_ne!(frame_check(&bad), good, "flip at {i}");
        }
    }
}
