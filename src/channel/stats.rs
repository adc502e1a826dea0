use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::trace;

/// Traffic counters of a channel. Bytes per second are recomputed periodically by
///  [spawn_bps_ticker] rather than on every read.
#[derive(Default)]
pub struct ChannelStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_read: AtomicU64,
    corrupt_messages: AtomicU64,

    last_bytes_sent: AtomicU64,
    last_bytes_read: AtomicU64,
    bps_sent: AtomicU64,
    bps_read: AtomicU64,
}

impl ChannelStats {
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt(&self, count: u64) {
        self.corrupt_messages.fetch_add(count, Ordering::Relaxed);
    }

    /// zeroes all counters, e.g. when a channel starts over on a new device
    pub fn reset(&self) {
        for counter in [
            &self.messages_sent, &self.messages_received, &self.bytes_sent, &self.bytes_read, &self.corrupt_messages,
            &self.last_bytes_sent, &self.last_bytes_read, &self.bps_sent, &self.bps_read,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
    pub fn corrupt_messages(&self) -> u64 {
        self.corrupt_messages.load(Ordering::Relaxed)
    }

    /// recomputes bytes per second from the traffic since the previous call
    pub fn update_bps(&self, elapsed: Duration) {
        let secs = elapsed.as_secs().max(1);

        let sent = self.bytes_sent();
        let last_sent = self.last_bytes_sent.swap(sent, Ordering::Relaxed);
        self.bps_sent.store(sent.saturating_sub(last_sent) / secs, Ordering::Relaxed);

        let read = self.bytes_read();
        let last_read = self.last_bytes_read.swap(read, Ordering::Relaxed);
        self.bps_read.store(read.saturating_sub(last_read) / secs, Ordering::Relaxed);

        trace!("updated BPS stats: sent {}, read {}", self.bps_sent.load(Ordering::Relaxed), self.bps_read.load(Ordering::Relaxed));
    }

    pub fn reset_bps(&self) {
        self.bps_sent.store(0, Ordering::Relaxed);
        self.bps_read.store(0, Ordering::Relaxed);
    }

    pub fn send_receive_stats(&self) -> String {
        format!("S:{} R:{}", self.messages_sent(), self.messages_received())
    }

    /// the serial channel reports corrupt frames as well
    pub fn send_receive_stats_with_corrupt(&self) -> String {
        format!("{} C:{}", self.send_receive_stats(), self.corrupt_messages())
    }

    pub fn send_bit_stats(&self) -> String {
        format!("S: {}, BPS:{}", human_readable_byte_count(self.bytes_sent(), true), self.bps_sent.load(Ordering::Relaxed))
    }

    pub fn receive_bit_stats(&self) -> String {
        format!("R: {}, BPS:{}", human_readable_byte_count(self.bytes_read(), true), self.bps_read.load(Ordering::Relaxed))
    }
}

pub fn human_readable_byte_count(bytes: u64, si: bool) -> String {
    let unit: u64 = if si { 1000 } else { 1024 };
    if bytes < unit {
        return format!("{} B", bytes);
    }

    let mut exp = 0;
    let mut scaled = bytes as f64;
    while scaled >= unit as f64 && exp < 6 {
        scaled /= unit as f64;
        exp += 1;
    }

    let prefixes = if si { "kMGTPE" } else { "KMGTPE" };
    let prefix = &prefixes[exp - 1..exp];
    let binary_marker = if si { "" } else { "i" };
    format!("{:.2} {}{}B", scaled, prefix, binary_marker)
}

pub fn spawn_bps_ticker(stats: Arc<ChannelStats>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            stats.update_bps(period);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::zero(0, true, "0 B")]
    #[case::below_unit(999, true, "999 B")]
    #[case::kilo(1000, true, "1.00 kB")]
    #[case::kilo_fraction(1536, true, "1.54 kB")]
    #[case::mega(2_500_000, true, "2.50 MB")]
    #[case::binary_below_unit(1023, false, "1023 B")]
    #[case::kibi(1536, false, "1.50 KiB")]
    #[case::mebi(1024 * 1024, false, "1.00 MiB")]
    fn test_human_readable_byte_count(#[case] bytes: u64, #[case] si: bool, #[case] expected: &str) {
        assert_eq!(human_readable_byte_count(bytes, si), expected);
    }

    #[test]
    fn test_stats_strings() {
        let stats = ChannelStats::default();
        stats.record_sent(1500);
        stats.record_sent(500);
        stats.record_received();
        stats.record_bytes_read(42);
        stats.record_corrupt(3);

        assert_eq!(stats.send_receive_stats(), "S:2 R:1");
        assert_eq!(stats.send_receive_stats_with_corrupt(), "S:2 R:1 C:3");
        assert_eq!(stats.send_bit_stats(), "S: 2.00 kB, BPS:0");
        assert_eq!(stats.receive_bit_stats(), "R: 42 B, BPS:0");
    }

    #[test]
    fn test_update_bps() {
        let stats = ChannelStats::default();
        stats.record_sent(6000);
        stats.record_bytes_read(120);
        stats.update_bps(Duration::from_secs(60));
        assert_eq!(stats.send_bit_stats(), "S: 6.00 kB, BPS:100");
        assert_eq!(stats.receive_bit_stats(), "R: 120 B, BPS:2");

        stats.update_bps(Duration::from_secs(60));
        assert_eq!(stats.send_bit_stats(), "S: 6.00 kB, BPS:0");

        stats.record_sent(600);
        stats.update_bps(Duration::from_secs(60));
        stats.reset_bps();
        assert_eq!(stats.send_bit_stats(), "S: 6.60 kB, BPS:0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker() {
        let stats = Arc::new(ChannelStats::default());
        let ticker = spawn_bps_ticker(stats.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(1)).await;
        stats.record_sent(60_000);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(stats.send_bit_stats(), "S: 60.00 kB, BPS:1000");
        ticker.abort();
    }
}
