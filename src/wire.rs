//! Framing of messages on the wire: the full and terse header encodings, their checksums, and
//!  reassembly of frames from byte streams.

pub mod checksum;
pub mod codec;
pub mod message;
pub mod priority;
pub mod stream_decoder;
