use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::bail;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;
use uuid::Uuid;

use crate::wire::checksum::Checksum;
use crate::wire::priority::{GatewayError, PriorityLevel};

/// Packet types of the slotted serial protocol, transmitted in the terse header
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    #[default]
    Normal = 1,
    Resend = 2,
    Ack = 3,
    Relay = 4,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Version {
    #[default]
    Full,
    Terse,
}

/// The outcome of handing a message to a channel, reported back to the message's originator
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisposalState {
    Pending,
    Queued,
    Busy,
    Rejected,
    Bad,
    Sent,
}

/// Completion callback attached to an outgoing message. It is called when the message leaves
///  the channel (or fails to).
#[cfg_attr(test, automock)]
pub trait DisposalHandler: Send + Sync + 'static {
    fn ack(&self, channel: &str, status: DisposalState);
}

/// Per-transmission framing data. This is set by the serial channel just before a message goes
///  out and read from the terse header on receipt. It is kept apart from the logical message,
///  which does not change after it is built.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WireAnnotations {
    pub packet_type: PacketType,
    pub hyperperiod: Option<u16>,
    pub slot_id: Option<u8>,
    pub index_in_slot: Option<u8>,
    pub hop_count: u8,
    pub clock_offset_millis: i64,
}
impl Default for WireAnnotations {
    fn default() -> Self {
        WireAnnotations {
            packet_type: PacketType::Normal,
            hyperperiod: None,
            slot_id: None,
            index_in_slot: None,
            hop_count: 1,
            clock_offset_millis: 0,
        }
    }
}

/// The unit of transfer: an opaque payload plus the metadata needed to queue and frame it.
#[derive(Clone)]
pub struct Message {
    priority: i8,
    version: Version,
    payload: Bytes,
    checksum: Checksum,
    build_time: u64,
    need_ack: bool,
    correlation_id: Uuid,
    handler: Option<Arc<dyn DisposalHandler>>,
    channel: Option<Arc<str>>,
    gateway_error: GatewayError,
    pub annotations: WireAnnotations,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{size:{}, priority:{}, version:{:?}, checksum:{:?}, build_time:{}, annotations:{:?}}}",
               self.payload.len(), self.priority, self.version, self.checksum, self.build_time, self.annotations)
    }
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
    pub fn priority(&self) -> i8 {
        self.priority
    }
    pub fn version(&self) -> Version {
        self.version
    }
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
    pub fn checksum(&self) -> Checksum {
        self.checksum
    }
    pub fn build_time(&self) -> u64 {
        self.build_time
    }
    pub fn need_ack(&self) -> bool {
        self.need_ack
    }
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }
    pub fn gateway_error(&self) -> GatewayError {
        self.gateway_error
    }
    pub fn handler(&self) -> Option<Arc<dyn DisposalHandler>> {
        self.handler.clone()
    }
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Recomputes the payload CRC and compares it to the checksum the message carries. For
    ///  terse messages only the low two bytes are compared since that is all the wire carries.
    pub fn has_valid_checksum(&self) -> bool {
        match self.version {
            Version::Full => self.checksum.matches_full(&self.payload),
            Version::Terse => self.checksum.matches_terse(&self.payload),
        }
    }

    /// reports the outcome of sending this message to its originator, if it registered a handler
    pub fn ack(&self, channel: &str, status: DisposalState) {
        if let Some(handler) = &self.handler {
            trace!(?status, correlation_id = ?self.correlation_id, "acking message to handler");
            handler.ack(channel, status);
        }
    }

    /// a copy of this message with the first `n` payload bytes removed and the checksum
    ///  recomputed for the remaining payload
    pub fn strip_prefix(&self, n: usize) -> anyhow::Result<Message> {
        if n > self.payload.len() {
            bail!("cannot strip {} bytes from a payload of {} bytes", n, self.payload.len());
        }
        let payload = self.payload.slice(n..);
        Ok(Message {
            checksum: Checksum::compute(&payload),
            payload,
            handler: self.handler.clone(),
            channel: self.channel.clone(),
            ..*self
        })
    }

    pub fn with_priority(mut self, priority: i8) -> Message {
        self.priority = priority;
        self
    }

    /// tags a received message with the name of the channel it arrived on
    pub fn with_channel(mut self, channel: &str) -> Message {
        self.channel = Some(channel.into());
        self
    }

    /// The order the send queue drains in: higher priority first, and within the same
    ///  priority earlier build time first.
    pub fn priority_order(a: &Message, b: &Message) -> Ordering {
        b.priority.cmp(&a.priority)
            .then_with(|| a.build_time.cmp(&b.build_time))
    }
}

/// This is the 'natural' order of messages. Higher priority is greater, and within the same
///  priority a *later* build time is greater - which is the opposite tie break direction from
///  [Message::priority_order] if the two are used for the same purpose. Both are kept as they are.
impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority)
            .then_with(|| self.build_time.cmp(&other.build_time))
            .then_with(|| other.payload.len().cmp(&self.payload.len()))
            .then_with(|| self.checksum.0.cmp(&other.checksum.0))
    }
}
impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Message {}


/// Strictly increasing nanosecond timestamps, so messages built in quick succession still have
///  distinct build times and keep their FIFO order within a priority.
fn next_build_time() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now = START.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let prev = LAST.fetch_max(now, AtomicOrdering::SeqCst);
    if prev >= now {
        LAST.fetch_add(1, AtomicOrdering::SeqCst) + 1
    }
    else {
        now
    }
}

#[derive(Default)]
pub struct MessageBuilder {
    size: Option<usize>,
    priority: i8,
    version: Version,
    payload: Option<Bytes>,
    checksum: Option<Checksum>,
    build_time: Option<u64>,
    need_ack: bool,
    correlation_id: Option<Uuid>,
    handler: Option<Arc<dyn DisposalHandler>>,
    channel: Option<Arc<str>>,
    gateway_error: GatewayError,
    annotations: WireAnnotations,
}

impl MessageBuilder {
    /// the intended size - [MessageBuilder::build] verifies it against the payload's actual size
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
    pub fn priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }
    /// sets a data priority, degrading requests in the AUTH / CTRL band
    pub fn data_priority(mut self, priority: i8) -> Self {
        self.priority = PriorityLevel::for_data(priority);
        self
    }
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }
    /// a checksum received on the wire - if none is set, it is computed from the payload
    pub fn checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }
    pub fn build_time(mut self, build_time: u64) -> Self {
        self.build_time = Some(build_time);
        self
    }
    pub fn need_ack(mut self, need_ack: bool) -> Self {
        self.need_ack = need_ack;
        self
    }
    pub fn correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
    pub fn handler(mut self, handler: Arc<dyn DisposalHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.into());
        self
    }
    pub fn gateway_error(mut self, gateway_error: GatewayError) -> Self {
        self.gateway_error = gateway_error;
        self
    }
    pub fn annotations(mut self, annotations: WireAnnotations) -> Self {
        self.annotations = annotations;
        self
    }
    pub fn packet_type(mut self, packet_type: PacketType) -> Self {
        self.annotations.packet_type = packet_type;
        self
    }
    pub fn hop_count(mut self, hop_count: u8) -> Self {
        self.annotations.hop_count = hop_count;
        self
    }

    pub fn build(self) -> anyhow::Result<Message> {
        let payload = match self.payload {
            Some(p) => p,
            None => bail!("message has no payload"),
        };
        if let Some(size) = self.size {
            if size != payload.len() {
                bail!("declared size {} does not match payload size {}", size, payload.len());
            }
        }

        let checksum = self.checksum
            .unwrap_or_else(|| Checksum::compute(&payload));

        Ok(Message {
            priority: self.priority,
            version: self.version,
            payload,
            checksum,
            build_time: self.build_time.unwrap_or_else(next_build_time),
            need_ack: self.need_ack,
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            handler: self.handler,
            channel: self.channel,
            gateway_error: self.gateway_error,
            annotations: self.annotations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::*;

    fn msg(priority: i8, build_time: u64) -> Message {
        Message::builder()
            .priority(priority)
            .build_time(build_time)
            .payload(vec![priority as u8, build_time as u8])
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let m = Message::builder()
            .payload(vec![1, 2, 3])
            .build()
            .unwrap();

        assert_eq!(m.priority(), PriorityLevel::NORMAL);
        assert_eq!(m.version(), Version::Full);
        assert_eq!(m.size(), 3);
        assert!(!m.need_ack());
        assert_eq!(m.annotations, WireAnnotations::default());
        assert_eq!(m.annotations.hop_count, 1);
        assert!(m.annotations.hyperperiod.is_none());
        assert!(m.has_valid_checksum());
    }

    #[rstest]
    #[case::matching(Some(3), true)]
    #[case::too_small(Some(2), false)]
    #[case::too_big(Some(4), false)]
    #[case::unspecified(None, true)]
    fn test_builder_size_validation(#[case] size: Option<usize>, #[case] expected_ok: bool) {
        let mut builder = Message::builder().payload(vec![1, 2, 3]);
        if let Some(size) = size {
            builder = builder.size(size);
        }
        assert_eq!(builder.build().is_ok(), expected_ok);
    }

    #[test]
    fn test_builder_without_payload() {
        assert!(Message::builder().size(0).build().is_err());
    }

    #[test]
    fn test_priority_order() {
        let a = msg(10, 5);
        let b = msg(10, 3);
        let c = msg(20, 100);

        let mut sorted = vec![a.clone(), b.clone(), c.clone()];
        sorted.sort_by(Message::priority_order);

        assert_eq!(sorted.iter().map(|m| m.build_time()).collect::<Vec<_>>(), vec![100, 3, 5]);
    }

    #[test]
    fn test_natural_order() {
        let a = msg(10, 5);
        let b = msg(10, 3);
        let c = msg(20, 100);

        // higher priority is greater, within a priority later build time is greater
        assert!(c > a);
        assert!(a > b);

        let mut sorted = vec![a, b, c];
        sorted.sort();
        assert_eq!(sorted.iter().map(|m| m.build_time()).collect::<Vec<_>>(), vec![3, 5, 100]);
    }

    #[test]
    fn test_natural_order_size_tie_break() {
        let small = Message::builder().build_time(1).payload(vec![1]).build().unwrap();
        let big = Message::builder().build_time(1).payload(vec![1, 2]).build().unwrap();
        assert!(small > big);
    }

    #[test]
    fn test_build_times_are_increasing() {
        let first = Message::builder().payload(vec![1]).build().unwrap();
        let second = Message::builder().payload(vec![1]).build().unwrap();
        assert!(second.build_time() > first.build_time());
    }

    #[rstest]
    #[case::full(Version::Full, false)]
    #[case::terse(Version::Terse, true)]
    fn test_checksum_upper_half(#[case] version: Version, #[case] expected_valid: bool) {
        let payload = b"123456789".to_vec();
        let wrong_upper_half = Checksum(Checksum::compute(&payload).0 ^ 0xffff_0000);

        let m = Message::builder()
            .version(version)
            .payload(payload)
            .checksum(wrong_upper_half)
            .build()
            .unwrap();
        assert_eq!(m.has_valid_checksum(), expected_valid);
    }

    #[test]
    fn test_strip_prefix() {
        let m = Message::builder()
            .priority(5)
            .payload(vec![9, 9, 9, 9, 1, 2, 3])
            .build()
            .unwrap();

        let stripped = m.strip_prefix(4).unwrap();
        assert_eq!(stripped.payload().as_ref(), &[1, 2, 3]);
        assert_eq!(stripped.checksum(), Checksum::compute(&[1, 2, 3]));
        assert_eq!(stripped.priority(), 5);
        assert!(stripped.has_valid_checksum());

        assert!(m.strip_prefix(8).is_err());
    }

    #[test]
    fn test_ack_calls_handler() {
        let mut handler = MockDisposalHandler::new();
        handler.expect_ack()
            .with(eq("tcp"), eq(DisposalState::Sent))
            .times(1)
            .return_const(());

        let m = Message::builder()
            .payload(vec![1])
            .handler(Arc::new(handler))
            .build()
            .unwrap();
        m.ack("tcp", DisposalState::Sent);
    }
}
