use std::time::Duration;

/// Where "now" is relative to this node's transmit window
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotPosition {
    /// the window of the current cycle has not started yet
    TooEarly { wake_at: i64 },
    /// the window of the current cycle is over, the next one starts at `wake_at`
    TooLate { wake_at: i64 },
    InSlot { hyperperiod: u16, slot_begin: i64, slot_end: i64 },
}

/// The TDMA timing math. All times are GPS milliseconds.
///
/// A cycle (hyperperiod) consists of one slot per radio in the group, and every node transmits
///  only within its own slot. The transmit window is a little shorter than the slot, leaving a
///  guard interval for clock skew between radios.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SlotSchedule {
    pub slot_number: u32,
    pub radios_in_group: u32,
    pub slot_duration_ms: i64,
    pub transmit_duration_ms: i64,
    pub bytes_per_ms: f64,
}

impl SlotSchedule {
    pub fn new(slot_number: u32, radios_in_group: u32, slot_duration: Duration, transmit_duration: Duration, baud_rate: u32) -> SlotSchedule {
        SlotSchedule {
            slot_number,
            radios_in_group: radios_in_group.max(1),
            slot_duration_ms: (slot_duration.as_millis() as i64).max(1),
            transmit_duration_ms: transmit_duration.as_millis() as i64,
            // ten bits per byte on the wire, including start and stop bits
            bytes_per_ms: baud_rate as f64 / 10_000.0,
        }
    }

    pub fn cycle_ms(&self) -> i64 {
        self.slot_duration_ms * self.radios_in_group as i64
    }

    pub fn offset_ms(&self) -> i64 {
        (self.slot_number % self.radios_in_group) as i64 * self.slot_duration_ms
    }

    /// the low 16 bits of the number of cycles since the epoch
    pub fn hyperperiod(&self, gps_now: i64) -> u16 {
        (gps_now.div_euclid(self.cycle_ms()) & 0xFFFF) as u16
    }

    /// the transmit duration plus a little slack, at most 50ms
    pub fn tweaked_transmit_ms(&self) -> i64 {
        let slack = (0.1 * self.transmit_duration_ms as f64) as i64;
        self.transmit_duration_ms + slack.min(50)
    }

    /// the largest frame (header included) that fits into a transmit window at all
    pub fn max_send_size(&self) -> usize {
        (self.transmit_duration_ms as f64 * self.bytes_per_ms) as usize
    }

    pub fn position(&self, gps_now: i64) -> SlotPosition {
        let cycle = self.cycle_ms();
        let cycle_start = gps_now.div_euclid(cycle) * cycle;
        let slot_begin = cycle_start + self.offset_ms();
        let slot_end = slot_begin + self.tweaked_transmit_ms();

        if gps_now < slot_begin {
            SlotPosition::TooEarly { wake_at: slot_begin }
        }
        else if gps_now > slot_end {
            SlotPosition::TooLate { wake_at: slot_begin + cycle }
        }
        else {
            SlotPosition::InSlot {
                hyperperiod: self.hyperperiod(gps_now),
                slot_begin,
                slot_end,
            }
        }
    }

    /// the slot (of any radio) that is on the air at `gps_now`
    pub fn current_slot(&self, gps_now: i64) -> i64 {
        gps_now.rem_euclid(self.cycle_ms()) / self.slot_duration_ms
    }

    /// how many bytes can still be sent before `slot_end`, given that `consumed_ms` of the window
    ///  are already taken by frames written earlier
    pub fn bytes_that_fit(&self, slot_end: i64, gps_now: i64, consumed_ms: f64) -> i64 {
        let time_left = (slot_end - gps_now) as f64 - consumed_ms;
        (time_left * self.bytes_per_ms) as i64
    }

    /// the air time of a frame of `bytes` bytes
    pub fn transmit_time_ms(&self, bytes: usize) -> f64 {
        bytes as f64 / self.bytes_per_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn schedule(slot: u32) -> SlotSchedule {
        SlotSchedule::new(slot, 16, Duration::from_millis(750), Duration::from_millis(500), 9600)
    }

    #[test]
    fn test_derived_values() {
        let s = schedule(3);
        assert_eq!(s.cycle_ms(), 12_000);
        assert_eq!(s.offset_ms(), 2_250);
        assert_eq!(s.tweaked_transmit_ms(), 550);
        assert_eq!(s.bytes_per_ms, 0.96);
        assert_eq!(s.max_send_size(), 480);
    }

    #[test]
    fn test_tweak_is_capped() {
        let s = SlotSchedule::new(0, 4, Duration::from_millis(2000), Duration::from_millis(1000), 9600);
        assert_eq!(s.tweaked_transmit_ms(), 1050);
        let s = SlotSchedule::new(0, 4, Duration::from_millis(2000), Duration::from_millis(200), 9600);
        assert_eq!(s.tweaked_transmit_ms(), 220);
    }

    #[test]
    fn test_slot_number_wraps_around_group() {
        assert_eq!(schedule(17).offset_ms(), schedule(1).offset_ms());
    }

    #[rstest]
    #[case::before_window(120_000 + 1_000, SlotPosition::TooEarly { wake_at: 120_000 + 2_250 })]
    #[case::window_start(120_000 + 2_250, SlotPosition::InSlot { hyperperiod: 10, slot_begin: 122_250, slot_end: 122_800 })]
    #[case::window_end(120_000 + 2_800, SlotPosition::InSlot { hyperperiod: 10, slot_begin: 122_250, slot_end: 122_800 })]
    #[case::after_window(120_000 + 2_801, SlotPosition::TooLate { wake_at: 132_000 + 2_250 })]
    fn test_position(#[case] now: i64, #[case] expected: SlotPosition) {
        assert_eq!(schedule(3).position(now), expected);
    }

    #[test]
    fn test_hyperperiod_wraps() {
        let s = schedule(0);
        assert_eq!(s.hyperperiod(0x10000 * 12_000 + 5), 0);
        assert_eq!(s.hyperperiod(0x10001 * 12_000 + 5), 1);
    }

    #[test]
    fn test_current_slot() {
        let s = schedule(0);
        assert_eq!(s.current_slot(120_000), 0);
        assert_eq!(s.current_slot(120_000 + 749), 0);
        assert_eq!(s.current_slot(120_000 + 750), 1);
        assert_eq!(s.current_slot(120_000 + 11_999), 15);
    }

    #[test]
    fn test_bytes_that_fit() {
        let s = schedule(0);
        assert_eq!(s.bytes_that_fit(1_000, 500, 0.0), 480);
        assert_eq!(s.bytes_that_fit(1_000, 500, 250.0), 240);
        assert!(s.bytes_that_fit(1_000, 1_200, 0.0) < 0);
        assert_eq!(s.transmit_time_ms(96), 100.0);
    }
}
