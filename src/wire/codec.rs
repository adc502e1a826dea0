use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::wire::checksum::Checksum;
use crate::wire::message::{Message, PacketType, Version, WireAnnotations};
use crate::wire::priority::GatewayError;

/// The magic sequence as it appears on the wire
pub const MAGIC: [u8; 3] = [0xef, 0xbe, 0xed];
pub const VERSION_1_FULL: u8 = 0xfe;

/// terse frames are marked by `01` in the top two bits of the version byte, the remaining six
///  bits carry the sender's phone id
const TERSE_MARKER_MASK: u8 = 0xc0;
const TERSE_MARKER: u8 = 0x40;
const PHONE_ID_MASK: u8 = 0x3f;

/// magic, version, size, priority, reserved, payload checksum - i.e. everything covered by
///  the header checksum
pub const FULL_HEADER_DATA_LEN: usize = 16;
pub const FULL_HEADER_LEN: usize = FULL_HEADER_DATA_LEN + 4;

pub const TERSE_HEADER_DATA_LEN: usize = 14;
pub const TERSE_HEADER_LEN: usize = TERSE_HEADER_DATA_LEN + 2;

/// The header of a frame, parsed and validated, before its payload has arrived
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PartialMessage {
    pub version: Version,
    pub size: usize,
    pub priority: i8,
    /// for terse frames, only the lower half is transmitted
    pub checksum: Checksum,
    pub gateway_error: GatewayError,
    pub annotations: WireAnnotations,
}
impl PartialMessage {
    pub fn header_len(&self) -> usize {
        match self.version {
            Version::Full => FULL_HEADER_LEN,
            Version::Terse => TERSE_HEADER_LEN,
        }
    }

    /// Combines the header with its payload. The payload checksum is *not* verified here,
    ///  callers check [Message::has_valid_checksum] so they can count corrupt frames.
    pub fn build(self, payload: Bytes) -> anyhow::Result<Message> {
        Message::builder()
            .size(self.size)
            .version(self.version)
            .priority(self.priority)
            .checksum(self.checksum)
            .gateway_error(self.gateway_error)
            .annotations(self.annotations)
            .payload(payload)
            .build()
    }
}

/// Serializes a message, header and payload, into a single buffer. All multi-byte values are
///  little endian.
///
/// `phone_id` goes into the terse version byte and UID. It is ignored for the full encoding.
pub fn serialize(message: &Message, version: Version, phone_id: u8) -> anyhow::Result<Bytes> {
    match version {
        Version::Full => serialize_full(message),
        Version::Terse => serialize_terse(message, phone_id),
    }
}

fn serialize_full(message: &Message) -> anyhow::Result<Bytes> {
    let size: u32 = match message.size().try_into() {
        Ok(s) => s,
        Err(_) => bail!("payload of {} bytes is too big for a full header", message.size()),
    };

    let mut buf = BytesMut::with_capacity(FULL_HEADER_LEN + message.size());
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION_1_FULL);
    buf.put_u32_le(size);
    buf.put_i8(message.priority());
    buf.put_u8(message.gateway_error().into());
    buf.put_u16_le(0);
    buf.put_slice(&message.checksum().to_le_bytes());

    let header_checksum = Checksum::compute(&buf[..FULL_HEADER_DATA_LEN]);
    buf.put_slice(&header_checksum.to_le_bytes());

    buf.put_slice(message.payload());
    trace!(size, priority = message.priority(), checksum = ?message.checksum(), "serialized full frame");
    Ok(buf.freeze())
}

fn serialize_terse(message: &Message, phone_id: u8) -> anyhow::Result<Bytes> {
    let size: u16 = match message.size().try_into() {
        Ok(s) => s,
        Err(_) => bail!("payload of {} bytes is too big for a terse header", message.size()),
    };
    let annotations = &message.annotations;

    let mut buf = BytesMut::with_capacity(TERSE_HEADER_LEN + message.size());
    buf.put_slice(&MAGIC);
    buf.put_u8(TERSE_MARKER | (phone_id & PHONE_ID_MASK));
    buf.put_u16_le(size);
    buf.put_u16_le(message.checksum().low_half());
    buf.put_u32_le(terse_uid(
        annotations.hyperperiod.unwrap_or(u16::MAX),
        phone_id,
        annotations.index_in_slot.unwrap_or(u8::MAX),
    ));
    buf.put_u8(annotations.packet_type.into());
    buf.put_u8(annotations.hop_count);

    let header_checksum = Checksum::compute(&buf[..TERSE_HEADER_DATA_LEN]);
    buf.put_u16_le(header_checksum.low_half());

    buf.put_slice(message.payload());
    trace!(size, ?annotations, "serialized terse frame");
    Ok(buf.freeze())
}

/// hyperperiod in the upper 16 bits, then slot, then index in slot
pub fn terse_uid(hyperperiod: u16, slot: u8, index_in_slot: u8) -> u32 {
    ((hyperperiod as u32) << 16) | ((slot as u32) << 8) | index_in_slot as u32
}

/// Scans `buf` for the next valid frame header.
///
/// On success, the buffer is advanced past the header so that it starts with the payload. Bytes
///  that can not be part of a frame are dropped from the buffer as they are scanned. Headers
///  with a checksum mismatch are counted in `corrupt_headers` and skipped, scanning resumes
///  at the byte after their first magic byte.
///
/// `None` means there is no complete header in the buffer (yet). A trailing partial candidate
///  header is left in the buffer so the caller can append more data and retry.
pub fn extract_header(buf: &mut BytesMut, corrupt_headers: &mut u64) -> Option<PartialMessage> {
    let mut from = 0;
    loop {
        let start = match find_magic_candidate(buf, from) {
            Some(start) => start,
            None => {
                buf.clear();
                return None;
            }
        };

        // garbage before the candidate is of no further use
        buf.advance(start);
        from = 0;

        if buf.len() <= MAGIC.len() {
            return None;
        }
        if buf[..MAGIC.len()] != MAGIC {
            // a partial match that turned out not to be the magic sequence
            from = 1;
            continue;
        }

        let version = buf[MAGIC.len()];
        let parsed = if version == VERSION_1_FULL {
            if buf.len() < FULL_HEADER_LEN {
                return None;
            }
            parse_full(&buf[..FULL_HEADER_LEN])
        }
        else if version & TERSE_MARKER_MASK == TERSE_MARKER {
            if buf.len() < TERSE_HEADER_LEN {
                return None;
            }
            parse_terse(&buf[..TERSE_HEADER_LEN])
        }
        else {
            debug!("apparent magic number but invalid version {:02x} - resyncing", version);
            from = 1;
            continue;
        };

        match parsed {
            Some(header) => {
                buf.advance(header.header_len());
                return Some(header);
            }
            None => {
                *corrupt_headers += 1;
                warn!("corrupt header - resyncing");
                from = 1;
            }
        }
    }
}

/// the first position at or after `from` where the magic sequence (or the start of it, if the
///  buffer ends early) begins
fn find_magic_candidate(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len())
        .find(|&i| {
            let end = buf.len().min(i + MAGIC.len());
            MAGIC.starts_with(&buf[i..end])
        })
}

fn parse_full(header: &[u8]) -> Option<PartialMessage> {
    let expected = Checksum::compute(&header[..FULL_HEADER_DATA_LEN]);

    let mut b = &header[MAGIC.len() + 1..];
    let size = b.get_u32_le() as usize;
    let priority = b.get_i8();
    let gateway_error = GatewayError::from_wire(b.get_u8());
    b.advance(2);
    let checksum = Checksum(b.get_u32_le());
    let header_checksum = Checksum(b.get_u32_le());

    if header_checksum != expected {
        return None;
    }

    trace!(size, priority, ?checksum, ?gateway_error, "extracted full header");
    Some(PartialMessage {
        version: Version::Full,
        size,
        priority,
        checksum,
        gateway_error,
        annotations: WireAnnotations::default(),
    })
}

fn parse_terse(header: &[u8]) -> Option<PartialMessage> {
    let expected = Checksum::compute(&header[..TERSE_HEADER_DATA_LEN]);

    let phone_id = header[MAGIC.len()] & PHONE_ID_MASK;
    let mut b = &header[MAGIC.len() + 1..];
    let size = b.get_u16_le() as usize;
    let checksum = Checksum::from_low_half(b.get_u16_le());
    let uid = b.get_u32_le();
    let raw_packet_type = b.get_u8();
    let hop_count = b.get_u8();
    let header_checksum = b.get_u16_le();

    if header_checksum != expected.low_half() {
        return None;
    }

    let packet_type = match PacketType::try_from(raw_packet_type) {
        Ok(t) => t,
        Err(_) => {
            debug!("terse header with unknown packet type {} - treating as normal", raw_packet_type);
            PacketType::Normal
        }
    };

    let annotations = WireAnnotations {
        packet_type,
        hyperperiod: Some((uid >> 16) as u16),
        slot_id: Some(phone_id),
        index_in_slot: Some((uid & 0xff) as u8),
        hop_count,
        clock_offset_millis: 0,
    };
    trace!(size, ?checksum, ?annotations, "extracted terse header");

    Some(PartialMessage {
        version: Version::Terse,
        size,
        priority: 0,
        checksum,
        gateway_error: GatewayError::NoError,
        annotations,
    })
}

/// Datagram transports carry exactly one frame per datagram
pub fn decode_datagram(datagram: &[u8]) -> anyhow::Result<Message> {
    let mut buf = BytesMut::from(datagram);
    let mut corrupt_headers = 0;

    let header = match extract_header(&mut buf, &mut corrupt_headers) {
        Some(h) => h,
        None => bail!("no valid frame header in datagram of {} bytes", datagram.len()),
    };
    if buf.len() < header.size {
        bail!("datagram truncated: header announces {} bytes of payload, {} present", header.size, buf.len());
    }
    if buf.len() > header.size {
        debug!("ignoring {} trailing bytes after frame", buf.len() - header.size);
    }

    let payload = buf.split_to(header.size).freeze();
    header.build(payload)
}
