use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::channel::manager::ChannelManager;

/// The connection lifecycle of a channel. DISABLED is only left through an explicit enable,
///  every failure goes through STALE and from there to LINK_WAIT and DISCONNECTED.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Pending,
    Disabled,
    Stale,
    LinkWait,
    Disconnected,
    Connecting,
    /// a server channel waiting for a client
    WaitConnect,
    Connected,
    /// connected, but the send queue is full
    Busy,
    Interrupted,
    Exception,
}
impl ConnState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnState::Connected | ConnState::Busy)
    }
}
impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Pending => "PENDING",
            ConnState::Disabled => "DISABLED",
            ConnState::Stale => "STALE",
            ConnState::LinkWait => "LINK_WAIT",
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Connecting => "CONNECTING",
            ConnState::WaitConnect => "WAIT_CONNECT",
            ConnState::Connected => "CONNECTED",
            ConnState::Busy => "BUSY",
            ConnState::Interrupted => "INTERRUPTED",
            ConnState::Exception => "EXCEPTION",
        };
        write!(f, "{}", s)
    }
}

/// What the sender or receiver task of a channel is doing
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubState {
    Start,
    Taking,
    Sending,
    Deliver,
    Interrupted,
}

/// The full status of a channel as reported to the channel manager
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChannelStatus {
    pub conn: ConnState,
    pub sender: SubState,
    pub receiver: SubState,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Snapshot {
    state: ConnState,
    attempt: u64,
}

/// The connection state of a channel together with its attempt counter.
///
/// Every reset increments the attempt counter. Failure reports carry the attempt they belong
///  to, and are ignored if the counter has moved on since - so a late failure from a superseded
///  connection can never tear down a newer one.
///
/// Changes are published through a `watch` channel so the connector can wait for them.
pub struct ChannelState {
    channel: Arc<str>,
    cell: watch::Sender<Snapshot>,
    sub_states: Mutex<(SubState, SubState)>,
    manager: Arc<dyn ChannelManager>,
}

impl ChannelState {
    pub fn new(channel: Arc<str>, manager: Arc<dyn ChannelManager>, initial: ConnState) -> ChannelState {
        let (cell, _) = watch::channel(Snapshot { state: initial, attempt: 0 });
        ChannelState {
            channel,
            cell,
            sub_states: Mutex::new((SubState::Start, SubState::Start)),
            manager,
        }
    }

    pub fn get(&self) -> ConnState {
        self.cell.borrow().state
    }

    pub fn attempt(&self) -> u64 {
        self.cell.borrow().attempt
    }

    /// state and attempt, read atomically
    pub fn get_with_attempt(&self) -> (ConnState, u64) {
        let s = *self.cell.borrow();
        (s.state, s.attempt)
    }

    pub fn status(&self) -> ChannelStatus {
        let (sender, receiver) = *self.sub_states.lock().unwrap_or_else(PoisonError::into_inner);
        ChannelStatus {
            conn: self.get(),
            sender,
            receiver,
        }
    }

    fn modify(&self, f: impl FnOnce(Snapshot) -> Option<Snapshot>) -> bool {
        let mut change = None;
        let modified = self.cell.send_if_modified(|s| {
            match f(*s) {
                Some(new) if new != *s => {
                    change = Some((s.state, new.state));
                    *s = new;
                    true
                }
                _ => false,
            }
        });

        if let Some((old, new)) = change {
            if old != new {
                debug!(channel = %self.channel, "{} -> {}", old, new);
                self.manager.status_change(&self.channel, old, self.status());
            }
        }
        modified
    }

    pub fn set(&self, state: ConnState) {
        self.modify(|s| Some(Snapshot { state, ..s }));
    }

    pub fn set_unless_disabled(&self, state: ConnState) -> bool {
        self.modify(|s| {
            if s.state == ConnState::Disabled {
                None
            }
            else {
                Some(Snapshot { state, ..s })
            }
        })
    }

    /// Sets `new` only if the current state is `expected`, regardless of the attempt
    pub fn compare_and_set(&self, expected: ConnState, new: ConnState) -> bool {
        self.modify(|s| {
            if s.state == expected {
                Some(Snapshot { state: new, ..s })
            }
            else {
                None
            }
        })
    }

    /// Moves from `expected` to `new` only if no reset happened since `attempt` was read. This is
    ///  how the connector advances through the lifecycle without racing resets.
    pub fn advance(&self, attempt: u64, expected: ConnState, new: ConnState) -> bool {
        self.modify(|s| {
            if s.attempt == attempt && s.state == expected {
                Some(Snapshot { state: new, ..s })
            }
            else {
                None
            }
        })
    }

    /// Starts a new attempt, sending the connector back to STALE. A disabled channel stays
    ///  disabled, but the attempt still advances so that everything belonging to the previous
    ///  attempt is invalidated.
    pub fn reset(&self) -> u64 {
        let mut attempt = 0;
        self.modify(|s| {
            attempt = s.attempt + 1;
            let state = if s.state == ConnState::Disabled { ConnState::Disabled } else { ConnState::Stale };
            Some(Snapshot { state, attempt })
        });
        attempt
    }

    /// A failure report for a given attempt - ignored if the attempt is no longer current
    pub fn failure(&self, attempt: u64) -> bool {
        if self.attempt() != attempt {
            debug!(channel = %self.channel, "ignoring failure of superseded attempt {}", attempt);
            return false;
        }
        self.modify(|s| {
            if s.attempt == attempt {
                Some(Snapshot { state: ConnState::Stale, attempt: attempt + 1 })
            }
            else {
                None
            }
        })
    }

    pub fn failure_unless_disabled(&self, attempt: u64) -> bool {
        self.modify(|s| {
            if s.attempt == attempt && s.state != ConnState::Disabled {
                Some(Snapshot { state: ConnState::Stale, attempt: attempt + 1 })
            }
            else {
                None
            }
        })
    }

    pub fn enable(&self) -> bool {
        self.modify(|s| {
            if s.state == ConnState::Disabled || s.state == ConnState::Pending {
                Some(Snapshot { state: ConnState::Stale, attempt: s.attempt + 1 })
            }
            else {
                None
            }
        })
    }

    pub fn disable(&self) {
        self.modify(|s| Some(Snapshot { state: ConnState::Disabled, attempt: s.attempt + 1 }));
    }

    /// wakes everybody waiting for a change without changing anything, e.g. after a link came up
    pub fn poke(&self) {
        self.cell.send_modify(|_| {});
    }

    pub fn set_sender(&self, sub_state: SubState) {
        self.set_sub_state(|s| s.0 = sub_state);
    }

    pub fn set_receiver(&self, sub_state: SubState) {
        self.set_sub_state(|s| s.1 = sub_state);
    }

    fn set_sub_state(&self, f: impl FnOnce(&mut (SubState, SubState))) {
        {
            let mut sub_states = self.sub_states.lock().unwrap_or_else(PoisonError::into_inner);
            let before = *sub_states;
            f(&mut sub_states);
            if before == *sub_states {
                return;
            }
        }
        let state = self.get();
        self.manager.status_change(&self.channel, state, self.status());
    }

    pub fn watch(&self) -> StateWatcher {
        StateWatcher(self.cell.subscribe())
    }

    /// Waits for up to `max`, returning early with `true` if the attempt moved on or the channel
    ///  was disabled
    pub async fn wait_superseded(&self, attempt: u64, max: Duration) -> bool {
        let mut watcher = self.watch();
        let deadline = Instant::now() + max;
        loop {
            {
                let s = watcher.0.borrow_and_update();
                if s.attempt != attempt || s.state == ConnState::Disabled {
                    return true;
                }
            }
            match tokio::time::timeout_at(deadline, watcher.0.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }
}

impl ChannelState {
    /// completes once the attempt moved on or the channel was disabled
    pub async fn until_superseded(&self, attempt: u64) {
        let mut watcher = self.watch();
        loop {
            {
                let s = watcher.0.borrow_and_update();
                if s.attempt != attempt || s.state == ConnState::Disabled {
                    return;
                }
            }
            if watcher.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A subscription to a channel's state changes
pub struct StateWatcher(watch::Receiver<Snapshot>);
impl StateWatcher {
    /// marks the current state as seen, so that only subsequent changes wake a wait
    pub fn mark_seen(&mut self) {
        self.0.borrow_and_update();
    }

    /// `true` if something changed within `max`
    pub async fn changed_within(&mut self, max: Duration) -> bool {
        matches!(timeout(max, self.0.changed()).await, Ok(Ok(())))
    }
}
