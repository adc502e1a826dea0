use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::wire::codec::{extract_header, PartialMessage};
use crate::wire::message::Message;
use crate::wire::priority::GatewayError;

/// Reassembles frames from a byte stream (TCP, SSL, serial) where reads can split or coalesce
///  frames arbitrarily.
///
/// Bytes are appended to the decoder's buffer (typically through `read_buf` on
///  [StreamDecoder::buffer_mut]), complete messages are then pulled with
///  [StreamDecoder::next_message].
pub struct StreamDecoder {
    buf: BytesMut,
    read_chunk: usize,
    max_message_size: usize,
    pending_header: Option<PartialMessage>,
    /// remaining bytes of an oversized frame that are skipped as they arrive
    draining: usize,
    corrupt_frames: u64,
}

impl StreamDecoder {
    pub fn new(read_chunk: usize, max_message_size: usize) -> StreamDecoder {
        StreamDecoder {
            buf: BytesMut::with_capacity(read_chunk),
            read_chunk,
            max_message_size,
            pending_header: None,
            draining: 0,
            corrupt_frames: 0,
        }
    }

    /// The buffer to read into. There is always room for at least one read chunk.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        self.buf.reserve(self.read_chunk);
        &mut self.buf
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// number of frames discarded as corrupt since the last call
    pub fn take_corrupt_count(&mut self) -> u64 {
        std::mem::take(&mut self.corrupt_frames)
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    ///
    /// Frames with a gateway error code are passed on with their (empty) payload so the caller
    ///  can act on the error.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if self.draining > 0 {
                let n = self.draining.min(self.buf.len());
                self.buf.advance(n);
                self.draining -= n;
                if self.draining > 0 {
                    return None;
                }
                debug!("finished draining oversized frame");
            }

            let header = match self.pending_header.take() {
                Some(h) => h,
                None => extract_header(&mut self.buf, &mut self.corrupt_frames)?,
            };

            if header.gateway_error != GatewayError::NoError && header.size == 0 {
                match header.build(Default::default()) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        warn!("unable to build gateway error frame: {}", e);
                        continue;
                    }
                }
            }

            if header.size < 1 {
                debug!("discarding frame with empty payload");
                self.corrupt_frames += 1;
                continue;
            }
            if header.size > self.max_message_size {
                warn!("discarding frame of {} bytes, maximum is {} - draining", header.size, self.max_message_size);
                self.corrupt_frames += 1;
                self.draining = header.size;
                continue;
            }

            if self.buf.len() < header.size {
                trace!("waiting for payload: {} of {} bytes buffered", self.buf.len(), header.size);
                self.pending_header = Some(header);
                return None;
            }

            let payload = self.buf.split_to(header.size).freeze();
            let msg = match header.build(payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("discarding malformed frame: {}", e);
                    self.corrupt_frames += 1;
                    continue;
                }
            };

            if !msg.has_valid_checksum() {
                warn!("discarding frame with invalid payload checksum");
                self.corrupt_frames += 1;
                continue;
            }

            trace!(size = msg.size(), priority = msg.priority(), "decoded frame");
            return Some(msg);
        }
    }
}
