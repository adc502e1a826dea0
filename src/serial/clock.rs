use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};

/// The number of GPS offset samples averaged into the published offset
pub const OFFSET_WINDOW: usize = 10;

/// Wall clock time in milliseconds since the epoch. Slot timing is derived from it, so tests
///  replace it with a manually advanced clock.
#[cfg_attr(test, automock)]
pub trait TimeSource: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

pub struct SystemTimeSource;
impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }
}

/// The offset between the system clock and GPS time, as measured by some external time sync
///  source. Slots are scheduled on `system time - delta`, so all radios in a group agree on slot
///  boundaries even if their system clocks drift.
///
/// The published delta is a moving average over the last [OFFSET_WINDOW] samples. It is an
///  atomic so that the sender and receiver read it without locking.
pub struct ClockOffset {
    delta: AtomicI64,
    samples: Mutex<SampleWindow>,
}

struct SampleWindow {
    samples: [i64; OFFSET_WINDOW],
    count: usize,
}

impl Default for ClockOffset {
    fn default() -> Self {
        ClockOffset {
            delta: AtomicI64::new(0),
            samples: Mutex::new(SampleWindow {
                samples: [0; OFFSET_WINDOW],
                count: 0,
            }),
        }
    }
}

impl ClockOffset {
    pub fn delta_millis(&self) -> i64 {
        self.delta.load(Ordering::Acquire)
    }

    /// Adds a measured offset. The published delta becomes the mean of the samples collected
    ///  so far (at most the last [OFFSET_WINDOW]), and only then is the new sample stored.
    pub fn add_sample(&self, delta_millis: i64) {
        let mut window = self.samples.lock().unwrap_or_else(PoisonError::into_inner);

        let stored = window.count.min(OFFSET_WINDOW);
        if stored > 0 {
            let sum: i64 = window.samples.iter().sum();
            self.delta.store(sum / stored as i64, Ordering::Release);
        }

        let slot = window.count % OFFSET_WINDOW;
        window.samples[slot] = delta_millis;
        window.count += 1;
        trace!("clock offset sample {} ms, published delta {} ms", delta_millis, self.delta_millis());
    }

    /// The system clock was set (e.g. by a time sync service), so earlier samples are meaningless
    pub fn system_time_changed(&self) {
        debug!("system time changed - discarding clock offset samples");
        let mut window = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        window.samples = [0; OFFSET_WINDOW];
        window.count = 0;
    }

    /// GPS time according to the given time source
    pub fn gps_now(&self, time: &dyn TimeSource) -> i64 {
        time.now_millis() - self.delta_millis()
    }
}
