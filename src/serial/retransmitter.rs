use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use bytes::{BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::RetransmitterConfig;
use crate::serial::connectivity::{bits_to_list, ConnectivityMatrix};
use crate::wire::codec::terse_uid;
use crate::wire::message::{Message, PacketType, Version};

/// A resend or relay packet carries the uid of the original transmission in front of the
///  original payload: index in slot, slot, hyperperiod (LE)
pub const UID_PREFIX_LEN: usize = 4;

/// A frame is only worth resending if it fits with its uid prefix and the terse header
const RESEND_OVERHEAD: usize = 20;

type RecordKey = u64;

/// A packet we sent (or relay) and may have to send again
struct PacketRecord {
    uid: u32,
    packet: Message,
    /// the slots whose acks we wait for
    expect_to_hear_from: u32,
    heard_from: u32,
    resends: u8,
    hop_count: u8,
    /// someone else's packet that we pass on
    relay: bool,
}

/// Bookkeeping for one hyperperiod: the packets we sent in our slot, in transmission order,
///  and what we received from every slot
struct SlotRecord {
    hyperperiod: Option<u16>,
    sent: Vec<RecordKey>,
    /// per slot, bit `i` is set if we received that slot's packet with index `i`
    acks: Vec<u8>,
}
impl SlotRecord {
    fn new(slots: usize) -> SlotRecord {
        SlotRecord {
            hyperperiod: None,
            sent: Vec::new(),
            acks: vec![0; slots],
        }
    }

    fn reset(&mut self, hyperperiod: u16) {
        self.hyperperiod = Some(hyperperiod);
        self.sent.clear();
        self.acks.iter_mut().for_each(|a| *a = 0);
    }

    fn has_ack(&self, slot: usize, index: u8) -> bool {
        index < 7 && slot < self.acks.len() && self.acks[slot] & (1 << index) != 0
    }

    fn set_ack(&mut self, slot: usize, index: u8) {
        // bit 7 is the connectivity flag
        if index < 7 && slot < self.acks.len() {
            self.acks[slot] |= 1 << index;
        }
    }
}

struct RetransmitterState {
    records: FxHashMap<RecordKey, PacketRecord>,
    next_key: RecordKey,
    ring: Vec<SlotRecord>,
    current: usize,
    connectivity: ConnectivityMatrix,
    resend_queue: VecDeque<RecordKey>,
}

impl RetransmitterState {
    fn previous_idx(&self) -> usize {
        (self.current + self.ring.len() - 1) % self.ring.len()
    }

    fn find_record(&self, hyperperiod: u16) -> Option<usize> {
        self.ring.iter().position(|r| r.hyperperiod == Some(hyperperiod))
    }

    /// the ring entry `hp_delta` hyperperiods before the current one
    fn idx_before_current(&self, hp_delta: usize) -> usize {
        (self.current + self.ring.len() - hp_delta % self.ring.len()) % self.ring.len()
    }

    fn insert(&mut self, record: PacketRecord) -> RecordKey {
        let key = self.next_key;
        self.next_key += 1;
        self.records.insert(key, record);
        key
    }
}

/// Reliable delivery on the TDMA radio link.
///
/// Every hyperperiod each node sends an ack packet telling the others which of their packets it
///  received in the previous hyperperiod, and which slots it hears directly. Packets that not
///  every expected neighbour acked are resent (a bounded number of times), and packets from
///  others are relayed to neighbours that cannot hear the original sender. Relaying is limited
///  by a hop count, and suppressed if the sender's known neighbourhood already covers ours.
///
/// Sender and receiver task both use the retransmitter, and all of its state is guarded by a
///  single mutex that is held for the duration of each operation.
pub struct Retransmitter {
    my_slot: usize,
    config: RetransmitterConfig,
    state: Mutex<RetransmitterState>,
}

impl Retransmitter {
    pub fn new(my_slot: usize, config: RetransmitterConfig) -> anyhow::Result<Retransmitter> {
        config.validate()?;
        if my_slot >= config.max_slots {
            anyhow::bail!("slot {} is out of range for {} slots", my_slot, config.max_slots);
        }

        let state = RetransmitterState {
            records: FxHashMap::default(),
            next_key: 0,
            ring: (0..config.slot_history).map(|_| SlotRecord::new(config.max_slots)).collect(),
            current: 0,
            connectivity: ConnectivityMatrix::new(my_slot, config.max_slots),
            resend_queue: VecDeque::new(),
        };
        Ok(Retransmitter {
            my_slot,
            config,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetransmitterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn switch_hyperperiods_if_needed(&self, hyperperiod: u16) {
        let mut state = self.lock();
        self.swap(&mut state, hyperperiod);
    }

    fn swap(&self, state: &mut RetransmitterState, hyperperiod: u16) {
        if state.ring[state.current].hyperperiod == Some(hyperperiod) {
            return;
        }
        trace!("switching hyperperiod from {:?} to {}", state.ring[state.current].hyperperiod, hyperperiod);

        let len = state.ring.len();
        let steps = match state.ring[state.current].hyperperiod {
            Some(old) => (hyperperiod.wrapping_sub(old) as usize).clamp(1, len),
            None => 1,
        };

        let previous = state.previous_idx();
        self.finalize(state, previous);
        if steps > 1 {
            // the acks for the current hyperperiod would have arrived in a skipped one
            debug!("skipping {} hyperperiods", steps - 1);
            let current = state.current;
            self.finalize(state, current);
        }

        let expired = state.connectivity.expire(hyperperiod, self.config.connectivity_expiry_hyperperiods);
        if expired != 0 {
            debug!("no longer hearing directly from slots {:?}", bits_to_list(expired));
        }

        // skipped hyperperiods get (empty) entries, so ring positions stay aligned with hyperperiods
        for step in (0..steps).rev() {
            state.current = (state.current + 1) % len;
            let current = state.current;
            state.ring[current].reset(hyperperiod.wrapping_sub(step as u16));
        }
    }

    /// Decides the fate of the packets sent in the hyperperiod of ring entry `idx`, whose acks
    ///  have had a full hyperperiod to arrive
    fn finalize(&self, state: &mut RetransmitterState, idx: usize) {
        let keys = std::mem::take(&mut state.ring[idx].sent);

        for key in keys {
            let Some(record) = state.records.get(&key) else {
                continue;
            };

            if record.expect_to_hear_from == 0 {
                state.records.remove(&key);
            }
            else if record.expect_to_hear_from & record.heard_from == record.expect_to_hear_from {
                trace!("packet {:08x} was acked by all of {:?}", record.uid, bits_to_list(record.expect_to_hear_from));
                state.records.remove(&key);
            }
            else if record.resends > 0 {
                debug!("packet {:08x}: expected acks from {:?}, heard from {:?} - resending",
                    record.uid, bits_to_list(record.expect_to_hear_from), bits_to_list(record.heard_from));
                state.resend_queue.push_back(key);
            }
            else {
                let missing = record.expect_to_hear_from & !record.heard_from;
                debug!("packet {:08x}: giving up, no acks from {:?}", record.uid, bits_to_list(missing));
                state.records.remove(&key);
                for slot in bits_to_list(missing) {
                    state.connectivity.forget(slot);
                }
            }
        }
    }

    /// Processes a packet received in `hyperperiod`, returning the messages to deliver
    pub fn process_received_message(&self, message: Message, hyperperiod: u16) -> Vec<Message> {
        let packet_type = message.annotations.packet_type;
        let slot = match message.annotations.slot_id {
            Some(slot) if (slot as usize) < self.config.max_slots => slot as usize,
            other => {
                warn!("received {:?} packet from invalid slot {:?}", packet_type, other);
                return if packet_type == PacketType::Normal { vec![message] } else { Vec::new() };
            }
        };
        let index = message.annotations.index_in_slot.unwrap_or(u8::MAX);
        trace!("received {:?} packet in hyperperiod {} from slot {} index {}", packet_type, hyperperiod, slot, index);

        let mut state = self.lock();
        self.swap(&mut state, hyperperiod);
        let current = state.current;
        state.ring[current].set_ack(slot, index);

        match packet_type {
            PacketType::Ack => {
                self.process_ack(&mut state, &message, slot, hyperperiod);
                Vec::new()
            }
            PacketType::Normal => {
                if state.connectivity.needs_relay(state.connectivity.row(slot)) {
                    let uid = terse_uid(message.annotations.hyperperiod.unwrap_or(hyperperiod), slot as u8, index);
                    self.queue_relay(&mut state, uid, message.clone());
                }
                vec![message]
            }
            PacketType::Resend | PacketType::Relay => {
                self.process_resend(&mut state, message, slot, hyperperiod)
                    .into_iter()
                    .collect()
            }
        }
    }

    fn process_ack(&self, state: &mut RetransmitterState, message: &Message, sender: usize, hyperperiod: u16) {
        let payload = message.payload();
        if payload.len() < self.config.max_slots {
            warn!("ack packet from slot {} is too short: {} bytes", sender, payload.len());
            return;
        }

        let their_acks_for_me = payload[self.my_slot] & 0x7F;
        if their_acks_for_me != 0 {
            state.connectivity.heard_directly(sender, hyperperiod);
        }

        let their_row = (0..self.config.max_slots)
            .filter(|&i| payload[i] & 0x80 != 0)
            .fold(0u32, |row, i| row | (1 << i));
        state.connectivity.update_row(sender, their_row);

        // an ack sent in hyperperiod n describes what its sender received in n-1
        let Some(ack_hyperperiod) = message.annotations.hyperperiod else {
            return;
        };
        if hyperperiod != ack_hyperperiod && hyperperiod != ack_hyperperiod.wrapping_add(1) {
            debug!("ignoring stale ack from hyperperiod {} in hyperperiod {}", ack_hyperperiod, hyperperiod);
            return;
        }
        let Some(acked) = state.find_record(ack_hyperperiod.wrapping_sub(1)) else {
            return;
        };

        trace!("slot {} acked our packets {:?}", sender, bits_to_list(their_acks_for_me as u32));
        let keys = state.ring[acked].sent.clone();
        for (i, key) in keys.iter().enumerate().take(7) {
            if their_acks_for_me & (1 << i) != 0 {
                if let Some(record) = state.records.get_mut(key) {
                    record.heard_from |= 1 << sender;
                }
            }
        }
    }

    fn process_resend(&self, state: &mut RetransmitterState, message: Message, relayer: usize, hyperperiod: u16) -> Option<Message> {
        let payload = message.payload();
        if payload.len() < UID_PREFIX_LEN {
            warn!("resend packet from slot {} is too short: {} bytes", relayer, payload.len());
            return None;
        }
        let original_index = payload[0];
        let original_slot = payload[1] as usize;
        let original_hyperperiod = u16::from_le_bytes([payload[2], payload[3]]);

        let hp_delta = hyperperiod.wrapping_sub(original_hyperperiod) as usize;
        if hp_delta >= self.config.slot_history {
            debug!("dropping resend of {}/{}/{}: outside the duplicate detection window", original_hyperperiod, original_slot, original_index);
            return None;
        }
        if original_slot == self.my_slot {
            trace!("dropping resend of our own packet");
            return None;
        }
        if original_slot >= self.config.max_slots {
            warn!("dropping resend from invalid original slot {}", original_slot);
            return None;
        }

        let idx = state.idx_before_current(hp_delta);
        if state.ring[idx].hyperperiod != Some(original_hyperperiod) {
            // only entries from before our first hyperperiod are unclaimed, they have no packets of ours
            debug!("starting receive history for hyperperiod {}", original_hyperperiod);
            state.ring[idx].reset(original_hyperperiod);
        }
        if state.ring[idx].has_ack(original_slot, original_index) {
            trace!("dropping duplicate {}/{}/{}", original_hyperperiod, original_slot, original_index);
            return None;
        }
        state.ring[idx].set_ack(original_slot, original_index);

        let original = match message.strip_prefix(UID_PREFIX_LEN) {
            Ok(m) => m,
            Err(e) => {
                warn!("unable to strip uid prefix: {}", e);
                return None;
            }
        };

        let audience = state.connectivity.row(relayer) | state.connectivity.row(original_slot);
        if state.connectivity.needs_relay(audience) {
            let uid = terse_uid(original_hyperperiod, original_slot as u8, original_index);
            self.queue_relay(state, uid, original.clone());
        }
        Some(original)
    }

    fn queue_relay(&self, state: &mut RetransmitterState, uid: u32, packet: Message) {
        let hop_count = packet.annotations.hop_count.saturating_sub(1);
        if hop_count == 0 {
            trace!("not relaying {:08x}: hop count exhausted", uid);
            return;
        }
        let record = PacketRecord {
            uid,
            expect_to_hear_from: state.connectivity.expected_receivers(),
            heard_from: 0,
            resends: self.config.default_resends,
            hop_count,
            relay: true,
            packet,
        };
        debug!("queueing {:08x} for relay with hop count {}", uid, hop_count);
        let key = state.insert(record);
        state.resend_queue.push_back(key);
    }

    /// Registers a packet that is about to be sent in our slot. Resent and relayed packets are
    ///  registered by [Retransmitter::create_resend_packet] instead.
    pub fn sending_packet(&self, message: &Message, hyperperiod: u16, slot: u8, index_in_slot: u8) {
        let packet_type = message.annotations.packet_type;
        if matches!(packet_type, PacketType::Resend | PacketType::Relay) {
            return;
        }

        let mut state = self.lock();
        let current = state.current;
        if state.ring[current].sent.len() >= self.config.max_packets_per_slot {
            warn!("already sent {} packets in this slot - not tracking {:?}", state.ring[current].sent.len(), message);
            return;
        }

        let tracked = message.need_ack() && packet_type != PacketType::Ack;
        let record = PacketRecord {
            uid: terse_uid(hyperperiod, slot, index_in_slot),
            packet: message.clone(),
            expect_to_hear_from: if tracked { state.connectivity.expected_receivers() } else { 0 },
            heard_from: 0,
            resends: if tracked { self.config.default_resends } else { 0 },
            hop_count: message.annotations.hop_count,
            relay: false,
        };
        trace!("tracking packet {:08x}, expecting acks from {:?}", record.uid, bits_to_list(record.expect_to_hear_from));
        let key = state.insert(record);
        state.ring[current].sent.push(key);
    }

    /// The next resend or relay packet that fits into `bytes_available`, if any
    pub fn create_resend_packet(&self, bytes_available: i64) -> Option<Message> {
        let mut guard = self.lock();
        let state = &mut *guard;
        loop {
            let key = *state.resend_queue.front()?;
            let Some(record) = state.records.get(&key) else {
                state.resend_queue.pop_front();
                continue;
            };
            if (record.packet.size() + RESEND_OVERHEAD) as i64 > bytes_available {
                return None;
            }
            let current = state.current;
            if state.ring[current].sent.len() >= self.config.max_packets_per_slot {
                return None;
            }

            state.resend_queue.pop_front();
            state.ring[current].sent.push(key);
            let record = state.records.get_mut(&key)?;
            record.resends = record.resends.saturating_sub(1);

            let mut payload = BytesMut::with_capacity(UID_PREFIX_LEN + record.packet.size());
            payload.put_u32_le(record.uid);
            payload.put_slice(record.packet.payload());

            let packet_type = if record.relay { PacketType::Relay } else { PacketType::Resend };
            let message = Message::builder()
                .version(Version::Terse)
                .priority(record.packet.priority())
                .payload(payload.freeze())
                .packet_type(packet_type)
                .hop_count(record.hop_count)
                .build();
            match message {
                Ok(m) => {
                    debug!("resending {:08x} as {:?}, {} resends left", record.uid, packet_type, record.resends);
                    return Some(m);
                }
                Err(e) => {
                    warn!("unable to build resend packet: {}", e);
                    return None;
                }
            }
        }
    }

    /// The ack packet for the previous hyperperiod, or `None` if we have no record of it
    pub fn create_ack_packet(&self, hyperperiod: u16) -> Option<Message> {
        let mut state = self.lock();
        let previous = state.previous_idx();
        if state.ring[previous].hyperperiod != Some(hyperperiod.wrapping_sub(1)) {
            debug!("no ack for hyperperiod {}: previous record is for {:?}", hyperperiod, state.ring[previous].hyperperiod);
            return None;
        }

        let my_row = state.connectivity.my_row();
        let acks = &mut state.ring[previous].acks;
        for (i, ack) in acks.iter_mut().enumerate() {
            *ack |= (((my_row >> i) & 1) as u8) << 7;
        }
        trace!("ack for hyperperiod {}: {:02x?}", hyperperiod.wrapping_sub(1), acks);

        let message = Message::builder()
            .version(Version::Terse)
            .payload(acks.clone())
            .packet_type(PacketType::Ack)
            .build();
        match message {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("unable to build ack packet: {}", e);
                None
            }
        }
    }

    pub fn reset_receiving_me_directly(&self) {
        self.lock().connectivity.reset_my_row();
    }

    pub fn resend_queue_len(&self) -> usize {
        self.lock().resend_queue.len()
    }

    /// the slots we currently hear directly, as a bitmask
    pub fn receiving_directly(&self) -> u32 {
        self.lock().connectivity.my_row()
    }

    pub fn connectivity_row(&self, slot: usize) -> u32 {
        self.lock().connectivity.row(slot)
    }

    /// number of packet records that are still waiting for acks or resends
    pub fn tracked_records(&self) -> usize {
        self.lock().records.len()
    }
}
