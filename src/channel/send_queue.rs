use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::wire::message::{DisposalState, Message};

/// The result of submitting a message to a channel. A message that was not accepted is handed
///  back so the caller can retry it elsewhere.
#[derive(Debug)]
pub enum SendOutcome {
    Queued,
    Busy(Message),
    Rejected(Message),
}
impl SendOutcome {
    pub fn disposal_state(&self) -> DisposalState {
        match self {
            SendOutcome::Queued => DisposalState::Queued,
            SendOutcome::Busy(_) => DisposalState::Busy,
            SendOutcome::Rejected(_) => DisposalState::Rejected,
        }
    }
}

/// heap entry in send order: the 'greatest' entry is the one to send next
struct Queued(Message);
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        Message::priority_order(&other.0, &self.0)
    }
}
impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Queued {}

/// Change of the queue's fill level that the channel reports as BUSY / CONNECTED
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusyChange {
    BecameBusy,
    BecameIdle,
}

struct QueueInner {
    distributor: BinaryHeap<Queued>,
    authentication: VecDeque<Message>,
    authorized: bool,
    was_busy: bool,
}

/// A bounded priority queue for application traffic plus a FIFO for the authentication
///  handshake. Until the channel is authorized, takers only ever see handshake messages.
pub struct SenderQueue {
    channel: String,
    capacity: usize,
    low_water: usize,
    offer_timeout: Duration,
    inner: Mutex<QueueInner>,
    available: Notify,
    space: Notify,
}

impl SenderQueue {
    pub fn new(channel: &str, capacity: usize, low_water: usize, offer_timeout: Duration) -> SenderQueue {
        SenderQueue {
            channel: channel.to_string(),
            capacity,
            low_water,
            offer_timeout,
            inner: Mutex::new(QueueInner {
                distributor: BinaryHeap::with_capacity(capacity),
                authentication: VecDeque::new(),
                authorized: false,
                was_busy: false,
            }),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to the offer timeout for room in the queue. On timeout the message is handed
    ///  back as BUSY.
    ///
    /// The second element is set if this call filled the queue up.
    pub async fn put_from_distributor(&self, message: Message) -> (SendOutcome, Option<BusyChange>) {
        let deadline = Instant::now() + self.offer_timeout;
        loop {
            let space = self.space.notified();
            {
                let mut inner = self.lock();
                if inner.distributor.len() < self.capacity {
                    trace!(channel = %self.channel, "queueing {:?}", message);
                    inner.distributor.push(Queued(message));
                    let change = if inner.distributor.len() >= self.capacity && !inner.was_busy {
                        inner.was_busy = true;
                        Some(BusyChange::BecameBusy)
                    }
                    else {
                        None
                    };
                    drop(inner);
                    self.available.notify_waiters();
                    return (SendOutcome::Queued, change);
                }
            }

            if timeout_at(deadline, space).await.is_err() {
                debug!(channel = %self.channel, "send queue full - returning BUSY");
                return (SendOutcome::Busy(message), None);
            }
        }
    }

    pub fn put_from_security_object(&self, message: Message) {
        trace!(channel = %self.channel, "queueing authentication message {:?}", message);
        self.lock().authentication.push_back(message);
        self.available.notify_waiters();
    }

    pub fn finished_putting_from_security_object(&self) {
        self.available.notify_waiters();
    }

    pub fn mark_as_authorized(&self) {
        debug!(channel = %self.channel, "authorized");
        self.lock().authorized = true;
        self.available.notify_waiters();
    }

    pub fn is_authorized(&self) -> bool {
        self.lock().authorized
    }

    /// Blocks while the channel is not authorized and there is no handshake message, then
    ///  returns a handshake message (before authorization) or the highest priority
    ///  application message (after).
    pub async fn take(&self) -> (Message, Option<BusyChange>) {
        loop {
            let available = self.available.notified();
            if let Some(result) = self.try_take() {
                return result;
            }
            available.await;
        }
    }

    /// the non-blocking version of [SenderQueue::take]
    pub fn try_take(&self) -> Option<(Message, Option<BusyChange>)> {
        self.try_take_if(|_| true)
    }

    /// Takes the next message only if `accept` approves of it. The decision and the removal
    ///  happen under the same lock, so a message queued concurrently can not slip in between.
    pub fn try_take_if(&self, accept: impl FnOnce(&Message) -> bool) -> Option<(Message, Option<BusyChange>)> {
        let mut inner = self.lock();
        if !inner.authorized {
            if !accept(inner.authentication.front()?) {
                return None;
            }
            return inner.authentication.pop_front()
                .map(|m| (m, None));
        }

        if !accept(&inner.distributor.peek()?.0) {
            return None;
        }
        let message = inner.distributor.pop()?.0;
        let change = if inner.was_busy && inner.distributor.len() <= self.low_water {
            inner.was_busy = false;
            Some(BusyChange::BecameIdle)
        }
        else {
            None
        };
        drop(inner);
        self.space.notify_waiters();
        Some((message, change))
    }

    /// the application message that would be taken next, if the channel is authorized
    pub fn peek(&self) -> Option<Message> {
        let inner = self.lock();
        if !inner.authorized {
            return None;
        }
        inner.distributor.peek()
            .map(|q| q.0.clone())
    }

    pub fn dist_len(&self) -> usize {
        self.lock().distributor.len()
    }

    pub fn auth_len(&self) -> usize {
        self.lock().authentication.len()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().was_busy
    }

    /// Drops all queued messages, reporting them as REJECTED to their handlers, and reverts to
    ///  unauthorized.
    pub fn reset(&self) {
        let (drained, auth_drained) = {
            let mut inner = self.lock();
            inner.authorized = false;
            inner.was_busy = false;
            let drained = std::mem::take(&mut inner.distributor).into_vec();
            let auth_drained = std::mem::take(&mut inner.authentication);
            (drained, auth_drained)
        };

        if !drained.is_empty() || !auth_drained.is_empty() {
            debug!(channel = %self.channel, "reset - rejecting {} queued messages and {} authentication messages", drained.len(), auth_drained.len());
        }
        for Queued(message) in drained {
            message.ack(&self.channel, DisposalState::Rejected);
        }
        for message in auth_drained {
            message.ack(&self.channel, DisposalState::Rejected);
        }
        self.space.notify_waiters();
    }
}
