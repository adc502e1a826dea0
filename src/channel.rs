//! The transport independent part of a channel: connection state with its attempt counter, the
//!  authorization gated send queue, statistics, and the connector loop that drives a transport
//!  through its lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::connector::{spawn_connector, Connect};
use crate::channel::core::ChannelCore;
use crate::channel::send_queue::SendOutcome;
use crate::channel::state::ChannelStatus;
use crate::channel::stats::spawn_bps_ticker;
use crate::wire::message::Message;

pub mod connector;
pub mod core;
pub mod heartbeat;
pub mod manager;
pub mod send_queue;
pub mod state;
pub mod stats;
pub mod stream_link;

/// The interval at which bytes-per-second figures are recomputed
pub const BPS_INTERVAL: Duration = Duration::from_secs(60);

/// What the rest of the system sees of a channel, regardless of its transport
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn enable(&self);
    fn disable(&self);
    /// forces a reconnect
    fn reset(&self);

    /// a network interface (or serial device) became available
    fn link_up(&self, iface: &str);
    fn link_down(&self, iface: &str);

    fn is_connected(&self) -> bool;
    fn is_busy(&self) -> bool;

    /// Submits a message for sending. A message that is not queued is handed back as part of the
    ///  outcome, ownership stays with the caller.
    async fn send_request(&self, message: Message) -> SendOutcome;

    fn state(&self) -> ChannelStatus;

    fn send_receive_stats(&self) -> String;
    fn send_bit_stats(&self) -> String;
    fn receive_bit_stats(&self) -> String;
}

/// A channel whose lifecycle is driven by the generic connector loop, i.e. every transport except
///  the serial radio.
pub struct ConnectorChannel {
    core: Arc<ChannelCore>,
    connector: JoinHandle<()>,
    bps_ticker: JoinHandle<()>,
}
impl ConnectorChannel {
    /// Spawns the connector and statistics tasks. The channel starts out disabled.
    pub fn start<T: Connect>(core: Arc<ChannelCore>, transport: T) -> ConnectorChannel {
        info!(channel = %core.name(), "starting channel");
        let connector = spawn_connector(core.clone(), transport);
        let bps_ticker = spawn_bps_ticker(core.stats.clone(), BPS_INTERVAL);
        ConnectorChannel {
            core,
            connector,
            bps_ticker,
        }
    }

    pub fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }
}

impl Drop for ConnectorChannel {
    fn drop(&mut self) {
        debug!(channel = %self.core.name(), "stopping channel");
        self.connector.abort();
        self.bps_ticker.abort();
    }
}

#[async_trait]
impl Channel for ConnectorChannel {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn enable(&self) {
        if self.core.state.enable() {
            info!(channel = %self.core.name(), "enabled");
        }
    }

    fn disable(&self) {
        info!(channel = %self.core.name(), "disabled");
        self.core.state.disable();
    }

    fn reset(&self) {
        info!(channel = %self.core.name(), "reset requested, status {:?}", self.core.state.status());
        self.core.state.reset();
    }

    fn link_up(&self, iface: &str) {
        debug!(channel = %self.core.name(), "link up: {}", iface);
        self.core.state.poke();
    }

    fn link_down(&self, iface: &str) {
        debug!(channel = %self.core.name(), "link down: {}", iface);
        self.core.state.reset();
    }

    fn is_connected(&self) -> bool {
        self.core.state.get().is_connected()
    }

    fn is_busy(&self) -> bool {
        self.core.queue.is_busy()
    }

    async fn send_request(&self, message: Message) -> SendOutcome {
        self.core.send_request(message).await
    }

    fn state(&self) -> ChannelStatus {
        self.core.state.status()
    }

    fn send_receive_stats(&self) -> String {
        self.core.stats.send_receive_stats()
    }

    fn send_bit_stats(&self) -> String {
        self.core.stats.send_bit_stats()
    }

    fn receive_bit_stats(&self) -> String {
        self.core.stats.receive_bit_stats()
    }
}
