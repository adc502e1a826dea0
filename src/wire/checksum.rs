use std::fmt::{Debug, Formatter};

use crc::Crc;

/// CRC32 as used in all frame headers - this is the 'standard' zlib / Ethernet CRC32
pub const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
impl Checksum {
    pub fn compute(data: &[u8]) -> Checksum {
        Checksum(CRC32.checksum(data))
    }

    /// little endian, which is the order the checksum is written to the wire
    pub fn to_le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// the terse encoding transmits only bytes 0 and 1 of the little endian representation
    pub fn low_half(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn from_low_half(low: u16) -> Checksum {
        Checksum(low as u32)
    }

    pub fn matches_full(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    /// NB: Only the lower two bytes are compared. This trades collision resistance for two bytes
    ///  of header on bandwidth constrained links.
    pub fn matches_terse(&self, data: &[u8]) -> bool {
        Self::compute(data).low_half() == self.low_half()
    }
}
