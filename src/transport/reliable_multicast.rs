use std::collections::{BTreeMap, VecDeque};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::channel::connector::{Connect, Connection};
use crate::channel::core::{ChannelCore, InFlight};
use crate::channel::manager::{ChannelManager, OpenSecurityObjectFactory};
use crate::channel::state::SubState;
use crate::channel::ConnectorChannel;
use crate::config::ReliableMulticastConfig;
use crate::transport::datagram::{datagram_frame, deliver_frame, MAX_DATAGRAM};
use crate::transport::multicast::bind_multicast;
use crate::wire::message::DisposalState;

const KIND_DATA: u8 = 1;
const KIND_NAK: u8 = 2;
const KIND_HEARTBEAT: u8 = 3;

/// The reliability layer's envelope around a frame. Sequence numbers start at 1 per sender, so a
///  heartbeat announcing 0 means nothing was sent yet.
///
/// ```ascii
/// kind (u8) | sender node id (u64 LE) | kind specific, integers varint encoded
///   DATA:      sequence, frame
///   NAK:       target node id (u64 LE), count, sequences
///   HEARTBEAT: highest sequence sent, oldest sequence still available for resending
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Envelope {
    Data { sender: u64, sequence: u64, frame: Bytes },
    Nak { sender: u64, target: u64, missing: Vec<u64> },
    Heartbeat { sender: u64, highest: u64, oldest_available: u64 },
}

impl Envelope {
    pub fn sender(&self) -> u64 {
        match self {
            Envelope::Data { sender, .. } => *sender,
            Envelope::Nak { sender, .. } => *sender,
            Envelope::Heartbeat { sender, .. } => *sender,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Envelope::Data { sender, sequence, frame } => {
                buf.put_u8(KIND_DATA);
                buf.put_u64_le(*sender);
                buf.put_u64_varint(*sequence);
                buf.put_slice(frame);
            }
            Envelope::Nak { sender, target, missing } => {
                buf.put_u8(KIND_NAK);
                buf.put_u64_le(*sender);
                buf.put_u64_le(*target);
                buf.put_u64_varint(missing.len() as u64);
                for sequence in missing {
                    buf.put_u64_varint(*sequence);
                }
            }
            Envelope::Heartbeat { sender, highest, oldest_available } => {
                buf.put_u8(KIND_HEARTBEAT);
                buf.put_u64_le(*sender);
                buf.put_u64_varint(*highest);
                buf.put_u64_varint(*oldest_available);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> anyhow::Result<Envelope> {
        if buf.remaining() < 9 {
            bail!("datagram of {} bytes is too short for an envelope", buf.remaining());
        }
        let kind = buf.get_u8();
        let sender = buf.get_u64_le();

        match kind {
            KIND_DATA => {
                let sequence = get_varint(&mut buf)?;
                Ok(Envelope::Data { sender, sequence, frame: buf })
            }
            KIND_NAK => {
                if buf.remaining() < 8 {
                    bail!("NAK without target");
                }
                let target = buf.get_u64_le();
                let count = get_varint(&mut buf)? as usize;
                if count > buf.remaining() {
                    bail!("NAK announces {} sequence numbers in {} bytes", count, buf.remaining());
                }
                let mut missing = Vec::with_capacity(count);
                for _ in 0..count {
                    missing.push(get_varint(&mut buf)?);
                }
                Ok(Envelope::Nak { sender, target, missing })
            }
            KIND_HEARTBEAT => {
                let highest = get_varint(&mut buf)?;
                let oldest_available = get_varint(&mut buf)?;
                Ok(Envelope::Heartbeat { sender, highest, oldest_available })
            }
            other => bail!("unknown envelope kind {}", other),
        }
    }
}

fn get_varint(buf: &mut Bytes) -> anyhow::Result<u64> {
    buf.get_u64_varint()
        .map_err(|e| anyhow!("varint error: {:?}", e))
}

/// A node id derived from the operator id, so it is stable across restarts. Without an operator
///  id, the node id is random.
pub fn derive_node_id(operator_id: &str, channel: &str) -> u64 {
    if operator_id.is_empty() {
        return rand::random();
    }
    let mut sha256 = Sha256::default();
    sha256.update(operator_id.as_bytes());
    sha256.update([0u8]);
    sha256.update(channel.as_bytes());
    let digest = sha256.finalize();

    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(id)
}

/// What the receiver does with a datagram: frames to deliver, in order, and datagrams to send
///  to the group in response
#[derive(Debug, Default)]
pub struct Reaction {
    pub frames: Vec<Bytes>,
    pub replies: Vec<Bytes>,
}

struct PeerState {
    /// `None` until the first DATA or HEARTBEAT tells us where the peer's stream is
    next_expected: Option<u64>,
    /// received out of order, waiting for the gap before them to be filled
    pending: BTreeMap<u64, Bytes>,
    last_heard: Instant,
    last_nak: Option<Instant>,
}
impl PeerState {
    fn new(now: Instant) -> PeerState {
        PeerState {
            next_expected: None,
            pending: BTreeMap::new(),
            last_heard: now,
            last_nak: None,
        }
    }

    /// moves everything that is now in sequence to `frames`
    fn drain(&mut self, frames: &mut Vec<Bytes>) {
        let Some(mut next) = self.next_expected else {
            return;
        };
        while let Some(frame) = self.pending.remove(&next) {
            frames.push(frame);
            next += 1;
        }
        self.next_expected = Some(next);
    }

    /// the sequence numbers missing up to and including `up_to`
    fn missing(&self, up_to: u64, limit: usize) -> Vec<u64> {
        let Some(next) = self.next_expected else {
            return Vec::new();
        };
        (next..=up_to)
            .filter(|s| !self.pending.contains_key(s))
            .take(limit)
            .collect()
    }

    /// gives up on everything before `sequence`
    fn skip_to(&mut self, sequence: u64) {
        self.pending = self.pending.split_off(&sequence);
        self.next_expected = Some(sequence);
    }
}

/// Sequencing, retransmission and membership for one node of a multicast group.
///
/// Every node numbers the frames it sends and keeps the most recent ones for resending. A
///  receiver delivers each sender's frames in sequence: frames after a gap are held back, and
///  the missing ones are requested with a NAK. Heartbeats announce the sender's highest sequence
///  number, so losses at the end of a burst are detected as well.
pub struct ReliableGroup {
    node_id: u64,
    config: ReliableMulticastConfig,
    next_sequence: u64,
    /// encoded DATA datagrams, oldest first
    sent: VecDeque<(u64, Bytes)>,
    peers: FxHashMap<u64, PeerState>,
}

impl ReliableGroup {
    pub fn new(node_id: u64, config: ReliableMulticastConfig) -> ReliableGroup {
        ReliableGroup {
            node_id,
            config,
            next_sequence: 1,
            sent: VecDeque::new(),
            peers: FxHashMap::default(),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// the nodes currently in the view, excluding ourselves
    pub fn members(&self) -> Vec<u64> {
        let mut result: Vec<_> = self.peers.keys().copied().collect();
        result.sort();
        result
    }

    /// Numbers a frame and keeps it for resending, returning the datagram to send
    pub fn wrap(&mut self, frame: Bytes) -> Bytes {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let datagram = Envelope::Data { sender: self.node_id, sequence, frame }.encode();
        if self.sent.len() >= self.config.retransmit_buffer_size {
            self.sent.pop_front();
        }
        self.sent.push_back((sequence, datagram.clone()));
        datagram
    }

    pub fn heartbeat(&self) -> Bytes {
        Envelope::Heartbeat {
            sender: self.node_id,
            highest: self.next_sequence - 1,
            oldest_available: self.sent.front().map(|(s, _)| *s).unwrap_or(self.next_sequence),
        }.encode()
    }

    pub fn on_datagram(&mut self, datagram: Bytes, now: Instant) -> anyhow::Result<Reaction> {
        let envelope = Envelope::decode(datagram)?;
        let mut reaction = Reaction::default();

        let sender = envelope.sender();
        if sender == self.node_id {
            trace!("dropping own datagram");
            return Ok(reaction);
        }

        let peer = self.peers.entry(sender).or_insert_with(|| {
            info!("node {:016x} joined the group", sender);
            PeerState::new(now)
        });
        peer.last_heard = now;

        match envelope {
            Envelope::Data { sequence, frame, .. } => {
                let next = *peer.next_expected.get_or_insert(sequence);
                if sequence < next || peer.pending.contains_key(&sequence) {
                    trace!("duplicate {} from {:016x}", sequence, sender);
                    return Ok(reaction);
                }
                peer.pending.insert(sequence, frame);
                peer.drain(&mut reaction.frames);

                if peer.pending.len() > self.config.max_reorder_buffer {
                    let first_pending = peer.pending.keys().next().copied();
                    if let Some(first) = first_pending {
                        warn!("reorder buffer for {:016x} overflowed - giving up on frames before {}", sender, first);
                        peer.skip_to(first);
                        peer.drain(&mut reaction.frames);
                    }
                }

                let last_pending = peer.pending.keys().next_back().copied();
                if let Some(last) = last_pending {
                    self.request_missing(sender, last, now, &mut reaction);
                }
            }
            Envelope::Heartbeat { highest, oldest_available, .. } => {
                let next = *peer.next_expected.get_or_insert(highest.saturating_add(1));
                if next < oldest_available {
                    warn!("frames {}..{} from {:016x} are no longer available", next, oldest_available, sender);
                    peer.skip_to(oldest_available);
                    peer.drain(&mut reaction.frames);
                }
                if highest >= peer.next_expected.unwrap_or(u64::MAX) {
                    self.request_missing(sender, highest, now, &mut reaction);
                }
            }
            Envelope::Nak { target, missing, .. } => {
                if target != self.node_id {
                    return Ok(reaction);
                }
                for sequence in missing {
                    match self.sent.iter().find(|(s, _)| *s == sequence) {
                        Some((_, datagram)) => reaction.replies.push(datagram.clone()),
                        None => debug!("{:016x} requested {}, which is no longer available", sender, sequence),
                    }
                }
                if !reaction.replies.is_empty() {
                    debug!("resending {} frames for {:016x}", reaction.replies.len(), sender);
                }
            }
        }
        Ok(reaction)
    }

    fn request_missing(&mut self, sender: u64, up_to: u64, now: Instant, reaction: &mut Reaction) {
        let Some(peer) = self.peers.get_mut(&sender) else {
            return;
        };
        if let Some(last) = peer.last_nak {
            if now.duration_since(last) < self.config.nak_interval {
                return;
            }
        }

        let missing = peer.missing(up_to, self.config.retransmit_buffer_size);
        if missing.is_empty() {
            return;
        }
        debug!("requesting {:?} from {:016x}", missing, sender);
        peer.last_nak = Some(now);
        reaction.replies.push(Envelope::Nak { sender: self.node_id, target: sender, missing }.encode());
    }

    /// removes members that were silent for longer than the membership timeout
    pub fn expire_members(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.config.membership_timeout;
        let expired: Vec<u64> = self.peers.iter()
            .filter(|(_, p)| now.duration_since(p.last_heard) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.peers.remove(id);
            info!("node {:016x} left the group (silent for more than {:?})", id, timeout);
        }
        if !expired.is_empty() {
            info!("group view is now {:x?}", self.members());
        }
        expired
    }
}

type SharedGroup = Arc<Mutex<ReliableGroup>>;

fn lock(group: &SharedGroup) -> std::sync::MutexGuard<'_, ReliableGroup> {
    group.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_reliable_sender(core: Arc<ChannelCore>, group: SharedGroup, socket: Arc<UdpSocket>, target: SocketAddr) {
    debug!("reliable multicast sender started");
    loop {
        core.state.set_sender(SubState::Taking);
        let message = core.take().await;
        let in_flight = InFlight::new(core.name(), message);
        core.state.set_sender(SubState::Sending);

        let frame = match in_flight.message().map(|m| datagram_frame(&core, m)) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("discarding message: {}", e);
                in_flight.fail(DisposalState::Bad);
                continue;
            }
            None => continue,
        };
        let datagram = lock(&group).wrap(frame);

        match socket.send_to(&datagram, target).await {
            Ok(_) => {
                if let Some(message) = in_flight.finish() {
                    core.frame_sent(&message, datagram.len());
                }
            }
            Err(e) => {
                warn!("send failed: {}", e);
                in_flight.fail(DisposalState::Rejected);
                core.state.set_sender(SubState::Interrupted);
                core.socket_operation_failed();
                return;
            }
        }
    }
}

async fn run_reliable_receiver(core: Arc<ChannelCore>, group: SharedGroup, socket: Arc<UdpSocket>, target: SocketAddr) {
    debug!("reliable multicast receiver started");
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        core.state.set_receiver(SubState::Start);
        let len = match socket.recv_from(&mut buf).await {
            Ok((len, _)) => len,
            Err(e) => {
                warn!("receive failed: {}", e);
                break;
            }
        };
        core.stats.record_bytes_read(len);

        let reaction = lock(&group).on_datagram(Bytes::copy_from_slice(&buf[..len]), Instant::now());
        let reaction = match reaction {
            Ok(r) => r,
            Err(e) => {
                debug!("dropping datagram: {}", e);
                core.stats.record_corrupt(1);
                continue;
            }
        };

        for reply in reaction.replies {
            if let Err(e) = socket.send_to(&reply, target).await {
                warn!("send failed: {}", e);
            }
        }
        for frame in reaction.frames {
            deliver_frame(&core, &frame).await;
        }
    }

    core.state.set_receiver(SubState::Interrupted);
    core.socket_operation_failed();
}

/// announces our highest sequence number and maintains the group view
async fn run_group_heartbeat(group: SharedGroup, socket: Arc<UdpSocket>, target: SocketAddr, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    loop {
        ticks.tick().await;
        let heartbeat = {
            let mut group = lock(&group);
            group.expire_members(Instant::now());
            group.heartbeat()
        };
        if let Err(e) = socket.send_to(&heartbeat, target).await {
            warn!("sending heartbeat failed: {}", e);
        }
    }
}

fn spawn_group_tasks(connection: &mut Connection, core: &Arc<ChannelCore>, group: SharedGroup, socket: Arc<UdpSocket>, target: SocketAddr, interval: Duration) {
    connection.spawn("sender", core.name(), run_reliable_sender(core.clone(), group.clone(), socket.clone(), target));
    connection.spawn("receiver", core.name(), run_reliable_receiver(core.clone(), group.clone(), socket.clone(), target));
    connection.spawn("heartbeat", core.name(), run_group_heartbeat(group, socket, target, interval));
}

pub struct ReliableMulticastTransport {
    config: ReliableMulticastConfig,
}

#[async_trait]
impl Connect for ReliableMulticastTransport {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection> {
        let socket = Arc::new(bind_multicast(&self.config.multicast)?);

        let node_id = match self.config.node_id {
            Some(id) => id,
            None => derive_node_id(&core.manager().operator_id(), core.name()),
        };
        info!("joining group {}:{} as node {:016x}", self.config.multicast.group, self.config.multicast.port, node_id);
        // a new connection starts a new sequence, peers resync from its first frame
        let group = Arc::new(Mutex::new(ReliableGroup::new(node_id, self.config.clone())));

        let target = SocketAddr::V4(SocketAddrV4::new(self.config.multicast.group, self.config.multicast.port));
        let mut connection = Connection::new(format!("reliable multicast {} as {:016x}", target, node_id));
        spawn_group_tasks(&mut connection, core, group, socket, target, self.config.heartbeat_interval);
        Ok(connection)
    }
}

/// A multicast channel with per-sender ordered delivery, NAK based retransmission and a view of
///  the group's members
pub fn channel(name: &str, config: ReliableMulticastConfig, manager: Arc<dyn ChannelManager>) -> anyhow::Result<ConnectorChannel> {
    config.validate()?;
    let core = ChannelCore::new(name, config.multicast.channel.clone(), manager, Arc::new(OpenSecurityObjectFactory))?;
    Ok(ConnectorChannel::start(core, ReliableMulticastTransport { config }))
}
