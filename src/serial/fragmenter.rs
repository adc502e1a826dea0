use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bit_set::BitSet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::core::ChannelCore;
use crate::channel::send_queue::SendOutcome;
use crate::config::FragmenterConfig;
use crate::wire::checksum::Checksum;
use crate::wire::message::{DisposalState, Message, Version};

const FLAG_ACK_FAMILY: u8 = 0x80;
const FLAG_RESET: u8 = 0x40;
const FLAG_SHOULD_ACK: u8 = 0x20;
const FLAG_FROM_HANDHELD: u8 = 0x10;

const DATA_PACKET: u8 = FLAG_SHOULD_ACK | FLAG_FROM_HANDHELD;
const FRAGMENT_PACKET: u8 = DATA_PACKET | 0x01;
const TOKEN_BIT: u16 = 0x8000;

/// flags, sequence number, fragment index, fragment count
pub const DATA_HEADER_LEN: usize = 7;

const SEQUENCE_MODULUS: u16 = 0x7FFF;

/// number of recently delivered sequence numbers remembered to suppress redelivery of
///  reliable messages that are resent on every token
const DELIVERED_HISTORY: usize = 64;

/// Where the fragmenter's packets go: the channel's send queue
#[async_trait]
pub trait FragmentSink: Send + Sync + 'static {
    async fn enqueue(&self, packet: Message);
}

#[async_trait]
impl FragmentSink for ChannelCore {
    async fn enqueue(&self, packet: Message) {
        let (outcome, change) = self.queue.put_from_distributor(packet).await;
        self.apply_busy_change(change);
        if !matches!(outcome, SendOutcome::Queued) {
            warn!(channel = %self.name(), "send queue refused fragmenter packet: {:?}", outcome.disposal_state());
        }
    }
}

/// a small reliable message that is resent on every token until the peer acks it
struct WaitingForAck {
    sequence: u16,
    packet: Message,
    original: Message,
}

/// the large message currently being sent, one fragment at a time
struct LargeTransfer {
    message: Message,
    base_sequence: u16,
    fragment_count: usize,
    unacked: BitSet,
}

/// the large message currently being received
struct Reassembly {
    base_sequence: u16,
    fragments: Vec<Bytes>,
    missing: BitSet,
}
impl Reassembly {
    fn new(base_sequence: u16, count: usize) -> Reassembly {
        Reassembly {
            base_sequence,
            fragments: vec![Bytes::new(); count],
            missing: (0..count).collect(),
        }
    }
}

struct FragmenterState {
    synced: bool,
    sequence: u16,
    last_token: u16,
    small_queue: VecDeque<Message>,
    large_queue: VecDeque<Message>,
    waiting_for_ack: Vec<WaitingForAck>,
    current_large: Option<LargeTransfer>,
    marked_for_ack: Vec<u16>,
    reassembly: Option<Reassembly>,
    recently_delivered: VecDeque<u16>,
    reset_timer: Option<JoinHandle<()>>,
    token_timer: Option<JoinHandle<()>>,
}

impl FragmenterState {
    fn next_sequence(&mut self, amount: usize) -> u16 {
        let result = self.sequence;
        self.sequence = ((self.sequence as usize + amount) % SEQUENCE_MODULUS as usize) as u16;
        result
    }

    fn stop_reset_timer(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }

    fn stop_token_timer(&mut self) {
        if let Some(timer) = self.token_timer.take() {
            timer.abort();
        }
    }
}

/// Token passing over a half duplex satellite modem, with fragmentation of large messages.
///
/// A handheld (even slot number) and a gateway (odd slot number) pass a token back and forth:
///  only the holder of the token sends. The handheld starts out sending RESET packets until the
///  gateway acks one, then hands over the first token. Whoever receives a token acks what it
///  received, sends its queued small messages, resends the reliable ones that are not acked yet,
///  sends the next fragments of the current large message, and passes the token back.
pub struct Fragmenter {
    channel: Arc<str>,
    config: FragmenterConfig,
    handheld: bool,
    operator_crc: u32,
    sink: Arc<dyn FragmentSink>,
    state: Mutex<FragmenterState>,
}

impl Drop for Fragmenter {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.stop_reset_timer();
        state.stop_token_timer();
    }
}

impl Fragmenter {
    pub fn new(channel: &str, slot_number: u32, config: FragmenterConfig, sink: Arc<dyn FragmentSink>) -> anyhow::Result<Fragmenter> {
        config.validate()?;
        let handheld = slot_number % 2 == 0;
        info!(channel = %channel, "SATCOM fragmenter in {} role", if handheld { "handheld" } else { "gateway" });

        Ok(Fragmenter {
            channel: channel.into(),
            operator_crc: Checksum::compute(config.operator_id.as_bytes()).0,
            config,
            handheld,
            sink,
            state: Mutex::new(FragmenterState {
                synced: false,
                sequence: 0,
                last_token: 0,
                small_queue: VecDeque::new(),
                large_queue: VecDeque::new(),
                waiting_for_ack: Vec::new(),
                current_large: None,
                marked_for_ack: Vec::new(),
                reassembly: None,
                recently_delivered: VecDeque::new(),
                reset_timer: None,
                token_timer: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FragmenterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_handheld(&self) -> bool {
        self.handheld
    }

    pub fn is_synced(&self) -> bool {
        self.lock().synced
    }

    /// Starts the handshake: a handheld repeats RESET packets until the gateway answers, a
    ///  gateway waits for them.
    pub fn start_sending(&self) {
        if !self.handheld {
            return;
        }
        let reset = match self.reset_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!(channel = %self.channel, "unable to build reset packet: {}", e);
                return;
            }
        };
        debug!(channel = %self.channel, "sending reset packets every {:?}", self.config.reset_interval);
        let timer = spawn_repeating(self.sink.clone(), reset, self.config.reset_interval);

        let mut state = self.lock();
        state.stop_reset_timer();
        state.reset_timer = Some(timer);
    }

    /// Queues a message for the next token. Until the handshake completes, or while the
    ///  respective queue is full, the message is handed back as BUSY.
    pub fn put_from_distributor(&self, message: Message) -> SendOutcome {
        let mut state = self.lock();
        if !state.synced {
            debug!(channel = %self.channel, "not synced - busy");
            return SendOutcome::Busy(message);
        }

        if message.size() > self.config.max_fragment_payload {
            if state.large_queue.len() >= self.config.queue_capacity {
                return SendOutcome::Busy(message);
            }
            state.large_queue.push_back(message);
            if state.current_large.is_none() {
                self.start_next_large(&mut state);
            }
        }
        else {
            if state.small_queue.len() >= self.config.queue_capacity {
                return SendOutcome::Busy(message);
            }
            state.small_queue.push_back(message);
        }
        SendOutcome::Queued
    }

    fn start_next_large(&self, state: &mut FragmenterState) {
        let Some(message) = state.large_queue.pop_front() else {
            return;
        };
        let fragment_count = message.size().div_ceil(self.config.max_fragment_payload);
        let base_sequence = state.next_sequence(fragment_count);
        debug!(channel = %self.channel, "starting large message of {} bytes in {} fragments, base sequence {}",
            message.size(), fragment_count, base_sequence);

        state.current_large = Some(LargeTransfer {
            message,
            base_sequence,
            fragment_count,
            unacked: (0..fragment_count).collect(),
        });
    }

    /// Processes a packet received from the modem. Returns the messages that are complete and
    ///  can be handed to the channel manager, or an error for a corrupt packet.
    pub async fn deliver(&self, message: Message) -> anyhow::Result<Vec<Message>> {
        if !message.has_valid_checksum() {
            bail!("invalid payload checksum");
        }
        let payload = message.payload().clone();
        if payload.is_empty() {
            bail!("empty SATCOM packet");
        }

        let (outgoing, delivered) = {
            let mut state = self.lock();
            state.stop_token_timer();

            let mut outgoing = Vec::new();
            let mut delivered = Vec::new();
            let flags = payload[0];

            if flags & FLAG_ACK_FAMILY == 0 {
                if flags & FLAG_RESET != 0 {
                    self.received_reset(&mut state, &payload, &mut outgoing)?;
                }
                else {
                    self.received_data(&mut state, &message, &mut delivered)?;
                }
            }
            else {
                let mut buf = &payload[1..];
                if buf.remaining() < 2 {
                    bail!("ack/token packet without count");
                }
                let count = buf.get_u16_le();
                if count & TOKEN_BIT != 0 {
                    self.received_token(&mut state, count & SEQUENCE_MODULUS, &mut outgoing)?;
                }
                else if !state.synced {
                    info!(channel = %self.channel, "handshake complete - sending first token");
                    state.stop_reset_timer();
                    state.synced = true;
                    self.pass_token(&mut state)?;
                }
                else {
                    self.received_ack(&mut state, count as usize, buf)?;
                }
            }
            (outgoing, delivered)
        };

        for packet in outgoing {
            self.sink.enqueue(packet).await;
        }
        Ok(delivered)
    }

    fn received_reset(&self, state: &mut FragmenterState, payload: &[u8], outgoing: &mut Vec<Message>) -> anyhow::Result<()> {
        if payload.len() < 7 {
            bail!("reset packet too short");
        }
        let theirs = u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]);
        info!(channel = %self.channel, "received reset from operator {:08x}", theirs);

        if !self.handheld {
            outgoing.push(control_packet(vec![FLAG_ACK_FAMILY | FLAG_FROM_HANDHELD, 0, 0])?);
        }
        state.synced = true;
        state.recently_delivered.clear();
        Ok(())
    }

    fn received_data(&self, state: &mut FragmenterState, message: &Message, delivered: &mut Vec<Message>) -> anyhow::Result<()> {
        let mut header = &message.payload()[1..];
        if header.remaining() < DATA_HEADER_LEN - 1 {
            bail!("data packet too short");
        }
        let sequence = header.get_u16_le();
        let index = header.get_u16_le() as usize;
        let count = header.get_u16_le() as usize;
        state.marked_for_ack.push(sequence);

        if count > 1 {
            if index >= count {
                bail!("fragment {} of {}", index, count);
            }
            if let Some(complete) = self.received_fragment(state, message, sequence, index, count)? {
                delivered.push(complete);
            }
        }
        else if state.recently_delivered.contains(&sequence) {
            trace!(channel = %self.channel, "dropping redelivered sequence {}", sequence);
        }
        else {
            if state.recently_delivered.len() >= DELIVERED_HISTORY {
                state.recently_delivered.pop_front();
            }
            state.recently_delivered.push_back(sequence);
            delivered.push(message.strip_prefix(DATA_HEADER_LEN)?);
        }
        Ok(())
    }

    fn received_fragment(&self, state: &mut FragmenterState, message: &Message, sequence: u16, index: usize, count: usize) -> anyhow::Result<Option<Message>> {
        let base_sequence = sequence_sub(sequence, index);
        let matches_current = state.reassembly.as_ref()
            .map(|r| r.base_sequence == base_sequence && r.fragments.len() == count)
            .unwrap_or(false);
        if !matches_current {
            if state.reassembly.is_some() {
                warn!(channel = %self.channel, "discarding incomplete large message - a new one started");
            }
            state.reassembly = Some(Reassembly::new(base_sequence, count));
        }

        let Some(reassembly) = state.reassembly.as_mut() else {
            return Ok(None);
        };
        reassembly.fragments[index] = message.payload().slice(DATA_HEADER_LEN..);
        reassembly.missing.remove(index);
        debug!(channel = %self.channel, "received fragment {} of {}, {} missing", index + 1, count, reassembly.missing.len());

        if !reassembly.missing.is_empty() {
            return Ok(None);
        }

        let Some(reassembly) = state.reassembly.take() else {
            return Ok(None);
        };
        let mut payload = BytesMut::with_capacity(reassembly.fragments.iter().map(|f| f.len()).sum());
        for fragment in &reassembly.fragments {
            payload.put_slice(fragment);
        }
        info!(channel = %self.channel, "received complete large message of {} bytes", payload.len());

        let complete = Message::builder()
            .version(Version::Terse)
            .priority(message.priority())
            .payload(payload.freeze())
            .build()?;
        Ok(Some(complete))
    }

    fn received_token(&self, state: &mut FragmenterState, token: u16, outgoing: &mut Vec<Message>) -> anyhow::Result<()> {
        if token == state.last_token {
            trace!(channel = %self.channel, "duplicate token {}", token);
            return Ok(());
        }
        trace!(channel = %self.channel, "received token {}", token);
        state.last_token = token;

        outgoing.push(self.ack_packet(state)?);

        while let Some(message) = state.small_queue.pop_front() {
            let sequence = state.next_sequence(1);
            if message.need_ack() {
                let packet = wrap(DATA_PACKET, sequence, 0, 1, message.payload(), None)?;
                state.waiting_for_ack.push(WaitingForAck {
                    sequence,
                    packet,
                    original: message,
                });
            }
            else {
                // unreliable messages are done once they are written
                outgoing.push(wrap(DATA_PACKET, sequence, 0, 1, message.payload(), Some(&message))?);
            }
        }
        outgoing.extend(state.waiting_for_ack.iter().map(|w| w.packet.clone()));

        if let Some(large) = &state.current_large {
            for index in large.unacked.iter().take(self.config.fragments_per_token) {
                let begin = index * self.config.max_fragment_payload;
                let end = (begin + self.config.max_fragment_payload).min(large.message.size());
                let sequence = sequence_add(large.base_sequence, index);
                trace!(channel = %self.channel, "sending fragment {} of {}", index + 1, large.fragment_count);
                outgoing.push(wrap(FRAGMENT_PACKET, sequence, index as u16, large.fragment_count as u16,
                    &large.message.payload()[begin..end], None)?);
            }
        }

        self.pass_token(state)
    }

    fn received_ack(&self, state: &mut FragmenterState, count: usize, mut buf: &[u8]) -> anyhow::Result<()> {
        if buf.remaining() < 2 * count {
            bail!("ack packet announces {} sequence numbers but has room for {}", count, buf.remaining() / 2);
        }
        for _ in 0..count {
            let sequence = buf.get_u16_le();

            if let Some(large) = state.current_large.as_mut() {
                let index = sequence_diff(sequence, large.base_sequence);
                if index < large.fragment_count {
                    large.unacked.remove(index);
                    if large.unacked.is_empty() {
                        info!(channel = %self.channel, "large message of {} bytes acked completely", large.message.size());
                        large.message.ack(&self.channel, DisposalState::Sent);
                        state.current_large = None;
                        self.start_next_large(state);
                    }
                    continue;
                }
            }

            if let Some(pos) = state.waiting_for_ack.iter().position(|w| w.sequence == sequence) {
                let acked = state.waiting_for_ack.remove(pos);
                trace!(channel = %self.channel, "sequence {} acked", sequence);
                acked.original.ack(&self.channel, DisposalState::Sent);
            }
        }
        Ok(())
    }

    /// passes the token on, repeating it until the peer sends anything
    fn pass_token(&self, state: &mut FragmenterState) -> anyhow::Result<()> {
        let token = (state.last_token + 1) % SEQUENCE_MODULUS;
        let packet = control_packet(token_payload(token))?;
        trace!(channel = %self.channel, "passing token {}", token);

        state.stop_token_timer();
        state.token_timer = Some(spawn_repeating(self.sink.clone(), packet, self.config.token_interval));
        Ok(())
    }

    fn ack_packet(&self, state: &mut FragmenterState) -> anyhow::Result<Message> {
        let marked = std::mem::take(&mut state.marked_for_ack);
        let mut payload = BytesMut::with_capacity(3 + 2 * marked.len());
        payload.put_u8(if self.handheld { FLAG_ACK_FAMILY | FLAG_FROM_HANDHELD } else { FLAG_ACK_FAMILY });
        payload.put_u16_le(marked.len() as u16);
        for sequence in marked {
            payload.put_u16_le(sequence);
        }
        control_packet(payload.freeze())
    }

    fn reset_packet(&self) -> anyhow::Result<Message> {
        let mut payload = vec![DATA_PACKET | FLAG_RESET, 0, 0];
        payload.extend_from_slice(&self.operator_crc.to_be_bytes());
        control_packet(payload)
    }
}

fn token_payload(token: u16) -> Vec<u8> {
    let [low, high] = (TOKEN_BIT | (token & SEQUENCE_MODULUS)).to_le_bytes();
    vec![FLAG_ACK_FAMILY | FLAG_SHOULD_ACK | FLAG_FROM_HANDHELD, low, high]
}

fn control_packet(payload: impl Into<Bytes>) -> anyhow::Result<Message> {
    Message::builder()
        .version(Version::Terse)
        .payload(payload)
        .build()
}

/// Wraps data in a data packet. If `original` is given, the packet takes over its handler, so
///  the original is acked when the packet is written.
fn wrap(flags: u8, sequence: u16, index: u16, count: u16, data: &[u8], original: Option<&Message>) -> anyhow::Result<Message> {
    let mut payload = BytesMut::with_capacity(DATA_HEADER_LEN + data.len());
    payload.put_u8(flags);
    payload.put_u16_le(sequence);
    payload.put_u16_le(index);
    payload.put_u16_le(count);
    payload.put_slice(data);

    let builder = Message::builder()
        .version(Version::Terse)
        .payload(payload.freeze());
    match original.and_then(|o| o.handler()) {
        Some(handler) => builder.handler(handler).build(),
        None => builder.build(),
    }
}

fn sequence_add(base: u16, offset: usize) -> u16 {
    ((base as usize + offset) % SEQUENCE_MODULUS as usize) as u16
}

fn sequence_sub(sequence: u16, offset: usize) -> u16 {
    let m = SEQUENCE_MODULUS as usize;
    ((sequence as usize + m - offset % m) % m) as u16
}

/// the offset of `sequence` after `base`, modulo the sequence range
fn sequence_diff(sequence: u16, base: u16) -> usize {
    let m = SEQUENCE_MODULUS as usize;
    (sequence as usize + m - base as usize) % m
}

fn spawn_repeating(sink: Arc<dyn FragmentSink>, packet: Message, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            sink.enqueue(packet.clone()).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use mockall::predicate::eq;
    use tokio::runtime::Builder;
    use crate::wire::message::MockDisposalHandler;

    #[derive(Default)]
    struct RecordingSink {
        packets: Mutex<Vec<Message>>,
    }
    impl RecordingSink {
        fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.packets.lock().unwrap())
        }
    }
    #[async_trait]
    impl FragmentSink for RecordingSink {
        async fn enqueue(&self, packet: Message) {
            self.packets.lock().unwrap().push(packet);
        }
    }

    fn fragmenter(slot: u32) -> (Fragmenter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let config = FragmenterConfig::default_satcom("operator");
        (Fragmenter::new("satcom", slot, config, sink.clone()).unwrap(), sink)
    }

    fn packet(payload: Vec<u8>) -> Message {
        Message::builder().version(Version::Terse).payload(payload).build().unwrap()
    }

    fn token(n: u16) -> Message {
        packet(token_payload(n))
    }

    /// a gateway that received a reset, so it is synced
    async fn synced_gateway() -> (Fragmenter, Arc<RecordingSink>) {
        let (f, sink) = fragmenter(1);
        f.deliver(packet(vec![0x70, 0, 0, 1, 2, 3, 4])).await.unwrap();
        sink.take();
        (f, sink)
    }

    fn payloads(packets: &[Message]) -> Vec<Vec<u8>> {
        packets.iter().map(|p| p.payload().to_vec()).collect()
    }

    #[test]
    fn test_roles() {
        assert!(fragmenter(0).0.is_handheld());
        assert!(!fragmenter(3).0.is_handheld());
    }

    #[test]
    fn test_handheld_handshake() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, sink) = fragmenter(2);
            f.start_sending();
            tokio::time::sleep(Duration::from_millis(5100)).await;

            let crc = Checksum::compute(b"operator").0.to_be_bytes();
            let resets = sink.take();
            assert_eq!(resets.len(), 2);
            assert_eq!(resets[0].payload().as_ref(), &[0x70, 0, 0, crc[0], crc[1], crc[2], crc[3]]);
            assert!(!f.is_synced());

            // the gateway's empty ack completes the handshake, and the first token goes out
            let delivered = f.deliver(packet(vec![0x90, 0, 0])).await.unwrap();
            assert!(delivered.is_empty());
            assert!(f.is_synced());
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(payloads(&sink.take()), vec![vec![0xb0, 0x01, 0x80]]);

            // no more resets, but the token is repeated until the peer answers
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(payloads(&sink.take()), vec![vec![0xb0, 0x01, 0x80]]);

            f.deliver(packet(vec![0x80, 0, 0])).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            assert!(sink.take().is_empty());
        });
    }

    #[test]
    fn test_gateway_answers_reset() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, sink) = fragmenter(1);
            f.start_sending();
            assert!(!f.is_synced());

            f.deliver(packet(vec![0x70, 0, 0, 1, 2, 3, 4])).await.unwrap();
            assert!(f.is_synced());
            assert_eq!(payloads(&sink.take()), vec![vec![0x90, 0, 0]]);
        });
    }

    #[test]
    fn test_busy_until_synced() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, _sink) = fragmenter(1);
            assert!(matches!(f.put_from_distributor(packet(vec![1])), SendOutcome::Busy(_)));

            let (f, _sink) = synced_gateway().await;
            assert!(matches!(f.put_from_distributor(packet(vec![1])), SendOutcome::Queued));
        });
    }

    #[test]
    fn test_queues_are_bounded() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, _sink) = synced_gateway().await;
            for _ in 0..19 {
                assert!(matches!(f.put_from_distributor(packet(vec![1])), SendOutcome::Queued));
            }
            assert!(matches!(f.put_from_distributor(packet(vec![1])), SendOutcome::Busy(_)));
            // the large queue is separate
            assert!(matches!(f.put_from_distributor(packet(vec![0; 1500])), SendOutcome::Queued));
        });
    }

    #[test]
    fn test_token_sends_ack_messages_and_passes_token() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, sink) = synced_gateway().await;

            // a small data packet from the peer, to be acked with the next token
            let delivered = f.deliver(packet(vec![0x30, 0x05, 0x00, 0, 0, 1, 0, 0xaa, 0xbb])).await.unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].payload().as_ref(), &[0xaa, 0xbb]);
            assert!(delivered[0].has_valid_checksum());

            let mut handler = MockDisposalHandler::new();
            handler.expect_ack()
                .with(eq("satcom"), eq(DisposalState::Sent))
                .times(1)
                .return_const(());
            let unreliable = Message::builder().payload(vec![7, 7]).handler(Arc::new(handler)).build().unwrap();
            f.put_from_distributor(unreliable);

            f.deliver(token(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let sent = sink.take();
            assert_eq!(payloads(&sent), vec![
                vec![0x80, 1, 0, 0x05, 0x00],
                vec![0x30, 0, 0, 0, 0, 1, 0, 7, 7],
                vec![0xb0, 0x02, 0x80],
            ]);
            // written by the channel's sender, which acks the original's handler
            sent[1].ack("satcom", DisposalState::Sent);

            // a repeated token is ignored, only the own token repeats
            f.deliver(token(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(sink.take().is_empty());
        });
    }

    #[test]
    fn test_reliable_message_is_resent_until_acked() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, sink) = synced_gateway().await;

            let mut handler = MockDisposalHandler::new();
            handler.expect_ack()
                .with(eq("satcom"), eq(DisposalState::Sent))
                .times(1)
                .return_const(());
            let reliable = Message::builder().payload(vec![1, 2, 3]).need_ack(true).handler(Arc::new(handler)).build().unwrap();
            f.put_from_distributor(reliable);

            f.deliver(token(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let first = payloads(&sink.take());
            assert_eq!(first[1], vec![0x30, 0, 0, 0, 0, 1, 0, 1, 2, 3]);
            assert_eq!(first.len(), 3);

            f.deliver(token(3)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let second = payloads(&sink.take());
            assert_eq!(second[1], vec![0x30, 0, 0, 0, 0, 1, 0, 1, 2, 3]);

            f.deliver(packet(vec![0x90, 1, 0, 0, 0])).await.unwrap();
            f.deliver(token(5)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let third = payloads(&sink.take());
            assert_eq!(third.len(), 2);
        });
    }

    #[test]
    fn test_large_message_fragments() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, sink) = synced_gateway().await;

            let mut handler = MockDisposalHandler::new();
            handler.expect_ack()
                .with(eq("satcom"), eq(DisposalState::Sent))
                .times(1)
                .return_const(());
            let data: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
            let large = Message::builder().payload(data.clone()).handler(Arc::new(handler)).build().unwrap();
            assert!(matches!(f.put_from_distributor(large), SendOutcome::Queued));

            // one fragment per token, the exact multiple gives a full last fragment
            f.deliver(token(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let sent = sink.take();
            assert_eq!(sent.len(), 3);
            assert_eq!(&sent[1].payload()[..7], &[0x31, 0, 0, 0, 0, 2, 0]);
            assert_eq!(&sent[1].payload()[7..], &data[..1000]);

            f.deliver(packet(vec![0x90, 1, 0, 0, 0])).await.unwrap();
            f.deliver(token(3)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            let sent = sink.take();
            assert_eq!(&sent[1].payload()[..7], &[0x31, 1, 0, 1, 0, 2, 0]);
            assert_eq!(sent[1].payload().len(), 1007);

            f.deliver(packet(vec![0x90, 1, 0, 1, 0])).await.unwrap();
            f.deliver(token(5)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(sink.take().len(), 2);
        });
    }

    #[test]
    fn test_fragments_are_reassembled() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, sink) = synced_gateway().await;

            let mut second = vec![0x31, 11, 0, 1, 0, 2, 0];
            second.extend_from_slice(&[2; 500]);
            let mut first = vec![0x31, 10, 0, 0, 0, 2, 0];
            first.extend_from_slice(&[1; 1000]);

            assert!(f.deliver(packet(second)).await.unwrap().is_empty());
            let delivered = f.deliver(packet(first)).await.unwrap();
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].size(), 1500);
            assert_eq!(&delivered[0].payload()[995..1005], &[1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);

            f.deliver(token(1)).await.unwrap();
            assert_eq!(sink.take()[0].payload().as_ref(), &[0x80, 2, 0, 11, 0, 10, 0]);
        });
    }

    #[test]
    fn test_duplicate_small_packet_is_delivered_once() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, _sink) = synced_gateway().await;
            let data = vec![0x30, 3, 0, 0, 0, 1, 0, 9];
            assert_eq!(f.deliver(packet(data.clone())).await.unwrap().len(), 1);
            assert!(f.deliver(packet(data)).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_corrupt_packets_are_rejected() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (f, _sink) = synced_gateway().await;
            let corrupt = Message::builder().payload(vec![0x30, 1]).checksum(Checksum(0)).build().unwrap();
            assert!(f.deliver(corrupt).await.is_err());
            assert!(f.deliver(packet(vec![0x30, 1])).await.is_err());
            assert!(f.deliver(packet(vec![0x90, 2, 0, 1, 0])).await.is_err());
        });
    }

    #[test]
    fn test_sequence_arithmetic_wraps() {
        assert_eq!(sequence_add(0x7FFE, 2), 1);
        assert_eq!(sequence_sub(1, 2), 0x7FFE);
        assert_eq!(sequence_diff(1, 0x7FFE), 2);
    }
}
