use std::fmt::{Debug, Formatter};

/// Who receives directly from whom: row `s` is the bitmask of slots that slot `s` hears
///  directly. This node's own row is maintained from received acks, the other rows are copied
///  from what their owners report in their acks.
///
/// A node always hears itself, so its own bit in its own row is never cleared.
pub struct ConnectivityMatrix {
    my_slot: usize,
    rows: Vec<u32>,
    /// hyperperiod of the last ack that showed mutual reception, per slot
    last_heard: Vec<Option<u16>>,
}

impl Debug for ConnectivityMatrix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectivityMatrix{{me:{}, rows:[", self.my_slot)?;
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{:04x}", row)?;
        }
        write!(f, "]}}")
    }
}

impl ConnectivityMatrix {
    pub fn new(my_slot: usize, slots: usize) -> ConnectivityMatrix {
        ConnectivityMatrix {
            my_slot,
            rows: (0..slots).map(|i| 1u32 << i).collect(),
            last_heard: vec![None; slots],
        }
    }

    pub fn slots(&self) -> usize {
        self.rows.len()
    }

    pub fn my_row(&self) -> u32 {
        self.rows[self.my_slot]
    }

    pub fn row(&self, slot: usize) -> u32 {
        self.rows.get(slot).copied().unwrap_or(0)
    }

    /// the slots whose reception of our packets we can count on, i.e. everybody we hear except
    ///  ourselves
    pub fn expected_receivers(&self) -> u32 {
        self.my_row() & !(1 << self.my_slot)
    }

    /// `slot` acked something of ours in `hyperperiod`, so we are direct neighbours
    pub fn heard_directly(&mut self, slot: usize, hyperperiod: u16) {
        if slot >= self.rows.len() {
            return;
        }
        self.rows[self.my_slot] |= 1 << slot;
        self.last_heard[slot] = Some(hyperperiod);
    }

    /// replaces the row of `slot` with what that slot reported about itself
    pub fn update_row(&mut self, slot: usize, row: u32) {
        if slot == self.my_slot || slot >= self.rows.len() {
            return;
        }
        self.rows[slot] = row;
    }

    /// We expected `slot` to ack a packet and it did not: it is no longer a direct neighbour,
    ///  and what it reported about its own neighbours is no longer trusted.
    pub fn forget(&mut self, slot: usize) {
        if slot == self.my_slot || slot >= self.rows.len() {
            return;
        }
        self.rows[self.my_slot] &= !(1 << slot);
        self.rows[slot] = 0;
        self.last_heard[slot] = None;
    }

    /// Forgets direct neighbours that have not acked anything for more than `max_age`
    ///  hyperperiods. Returns the bitmask of forgotten slots.
    pub fn expire(&mut self, hyperperiod: u16, max_age: u16) -> u32 {
        let mut expired = 0;
        for slot in 0..self.rows.len() {
            if slot == self.my_slot || self.rows[self.my_slot] & (1 << slot) == 0 {
                continue;
            }
            let stale = match self.last_heard[slot] {
                Some(last) => hyperperiod.wrapping_sub(last) > max_age,
                None => true,
            };
            if stale {
                self.forget(slot);
                expired |= 1 << slot;
            }
        }
        expired
    }

    /// Whether a packet heard by the slots in `audience` still needs relaying: true if we hear
    ///  somebody other than ourselves who is not part of that audience.
    pub fn needs_relay(&self, audience: u32) -> bool {
        self.expected_receivers() & !audience != 0
    }

    pub fn reset_my_row(&mut self) {
        self.rows[self.my_slot] = 1 << self.my_slot;
        for (slot, last) in self.last_heard.iter_mut().enumerate() {
            if slot != self.my_slot {
                *last = None;
            }
        }
    }
}

pub fn bits_to_list(bits: u32) -> Vec<usize> {
    (0..32).filter(|i| bits & (1 << i) != 0).collect()
}
