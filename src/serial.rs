//! The serial radio channel. Radios of a group share the air in TDMA fashion: time is divided
//!  into cycles with one slot per radio, and every radio transmits in its own slot only. On top
//!  of that, the retransmitter acks, resends and relays packets. Alternatively the channel runs
//!  token passing with fragmentation over a SATCOM modem.

pub mod channel;
pub mod clock;
pub mod connectivity;
pub mod device;
pub mod fragmenter;
pub mod retransmitter;
pub mod schedule;
