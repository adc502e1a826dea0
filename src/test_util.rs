use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::time::Instant;

use crate::channel::manager::ChannelManager;
use crate::channel::state::{ChannelStatus, ConnState};
use crate::serial::clock::TimeSource;
use crate::serial::device::{DeviceOpener, SerialDevice};
use crate::wire::message::Message;

/// A channel manager that accepts everything and records what it is told
pub struct RecordingManager {
    link_up: AtomicBool,
    heartbeat: Mutex<Option<Vec<u8>>>,
    authorizations: AtomicUsize,
    transitions: Mutex<Vec<(ConnState, ConnState)>>,
    delivered: Mutex<Vec<Message>>,
}

impl RecordingManager {
    pub fn new() -> RecordingManager {
        RecordingManager {
            link_up: AtomicBool::new(true),
            heartbeat: Mutex::new(None),
            authorizations: AtomicUsize::new(0),
            transitions: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    pub fn set_heartbeat(&self, payload: Option<Vec<u8>>) {
        *self.heartbeat.lock().unwrap() = payload;
    }

    pub fn authorizations(&self) -> usize {
        self.authorizations.load(Ordering::SeqCst)
    }

    /// connection state changes, in order
    pub fn transitions(&self) -> Vec<(ConnState, ConnState)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelManager for RecordingManager {
    async fn deliver(&self, message: Message) -> bool {
        self.delivered.lock().unwrap().push(message);
        true
    }

    fn is_any_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    fn status_change(&self, _channel: &str, old: ConnState, status: ChannelStatus) {
        if old != status.conn {
            self.transitions.lock().unwrap().push((old, status.conn));
        }
    }

    fn authorization_succeeded(&self, _channel: &str, _message: Option<Message>) {
        self.authorizations.fetch_add(1, Ordering::SeqCst);
    }

    fn build_authentication_request(&self) -> Option<Message> {
        None
    }

    fn operator_id(&self) -> String {
        "operator".to_string()
    }

    fn build_heartbeat(&self) -> Option<Message> {
        self.heartbeat.lock().unwrap()
            .as_ref()
            .map(|payload| Message::builder().payload(payload.clone()).build().unwrap())
    }
}

/// Wall clock time that follows tokio's (possibly paused) clock, starting at a given epoch
///  millisecond value
pub struct TokioClock {
    start: Instant,
    start_millis: i64,
}
impl TokioClock {
    pub fn starting_at(start_millis: i64) -> TokioClock {
        TokioClock {
            start: Instant::now(),
            start_millis,
        }
    }
}
impl TimeSource for TokioClock {
    fn now_millis(&self) -> i64 {
        self.start_millis + self.start.elapsed().as_millis() as i64
    }
}

/// Hands out prepared in-memory devices, one per open call
pub struct DuplexOpener {
    devices: Mutex<Vec<DuplexStream>>,
    opened: AtomicUsize,
}
impl DuplexOpener {
    pub fn new(devices: Vec<DuplexStream>) -> Arc<DuplexOpener> {
        Arc::new(DuplexOpener {
            devices: Mutex::new(devices),
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceOpener for DuplexOpener {
    async fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SerialDevice>> {
        let mut devices = self.devices.lock().unwrap();
        if devices.is_empty() {
            anyhow::bail!("no device at {:?}", path);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(devices.remove(0)))
    }
}
