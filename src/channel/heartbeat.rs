use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Decides when a connected channel sends its next heartbeat
pub struct Heartbeat {
    interval: Duration,
    last_sent: Option<Instant>,
}
impl Heartbeat {
    pub fn new(interval: Duration) -> Heartbeat {
        Heartbeat {
            interval,
            last_sent: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// a new connection gets its first heartbeat right away
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

/// Detects a flatlined connection: something was sent, but nothing came back for too long.
///
/// The clock starts with the first send after a read, and any read stops it.
pub struct Watchdog {
    timeout: Option<Duration>,
    unanswered_send_since: Mutex<Option<Instant>>,
}
impl Watchdog {
    pub fn new(timeout: Option<Duration>) -> Watchdog {
        Watchdog {
            timeout,
            unanswered_send_since: Mutex::new(None),
        }
    }

    pub fn on_send(&self) {
        let mut since = self.unanswered_send_since.lock().unwrap_or_else(PoisonError::into_inner);
        if since.is_none() {
            *since = Some(Instant::now());
        }
    }

    pub fn on_read(&self) {
        *self.unanswered_send_since.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn clear(&self) {
        self.on_read();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        let Some(timeout) = self.timeout else {
            return false;
        };
        match *self.unanswered_send_since.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(since) => now.saturating_duration_since(since) > timeout,
            None => false,
        }
    }
}
