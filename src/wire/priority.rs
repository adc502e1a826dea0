use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Well-known message priorities. Priorities are signed bytes, higher values are more urgent.
///
/// AUTH and CTRL are reserved for authentication and control traffic (subscribe, pull,
///  heartbeat); data messages must not use them.
pub struct PriorityLevel;
impl PriorityLevel {
    pub const AUTH: i8 = 127;
    pub const CTRL: i8 = 112;
    pub const FLASH: i8 = 96;
    pub const URGENT: i8 = 64;
    pub const IMPORTANT: i8 = 32;
    pub const NORMAL: i8 = 0;
    pub const BACKGROUND: i8 = -32;

    /// degrades data messages that ask for a priority in the AUTH / CTRL band to FLASH
    pub fn for_data(requested: i8) -> i8 {
        if requested > Self::FLASH {
            Self::FLASH
        }
        else {
            requested
        }
    }
}

/// Reason code a gateway sends in the first reserved byte of a full header before it
///  disconnects. If the code is non-zero, size and payload checksum are zero.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, TryFromPrimitive, IntoPrimitive)]
pub enum GatewayError {
    #[default]
    NoError = 0,
    InvalidMagicNumber = 1,
    InvalidHeaderChecksum = 2,
    InvalidMessageChecksum = 3,
    MessageTooLarge = 4,
    InvalidVersion = 5,
}
impl GatewayError {
    /// unknown codes are mapped to `InvalidVersion` - the header passed its checksum, so the
    ///  peer speaks a protocol revision we do not know
    pub fn from_wire(code: u8) -> GatewayError {
        GatewayError::try_from(code)
            .unwrap_or(GatewayError::InvalidVersion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::auth(PriorityLevel::AUTH, PriorityLevel::FLASH)]
    #[case::ctrl(PriorityLevel::CTRL, PriorityLevel::FLASH)]
    #[case::just_above_flash(97, PriorityLevel::FLASH)]
    #[case::flash(PriorityLevel::FLASH, PriorityLevel::FLASH)]
    #[case::normal(PriorityLevel::NORMAL, PriorityLevel::NORMAL)]
    #[case::background(PriorityLevel::BACKGROUND, PriorityLevel::BACKGROUND)]
    fn test_for_data(#[case] requested: i8, #[case] expected: i8) {
        assert_eq!(PriorityLevel::for_data(requested), expected);
    }

    #[rstest]
    #[case(0, GatewayError::NoError)]
    #[case(3, GatewayError::InvalidMessageChecksum)]
    #[case(5, GatewayError::InvalidVersion)]
    #[case(77, GatewayError::InvalidVersion)]
    fn test_gateway_error_from_wire(#[case] code: u8, #[case] expected: GatewayError) {
        assert_eq!(GatewayError::from_wire(code), expected);
    }
}
