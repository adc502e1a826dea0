use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::channel::core::ChannelCore;
use crate::channel::heartbeat::Heartbeat;
use crate::channel::state::ConnState;
use crate::wire::priority::PriorityLevel;

/// The tasks serving one established connection
pub struct Connection {
    description: String,
    tasks: Vec<JoinHandle<()>>,
}
impl Connection {
    pub fn new(description: impl Into<String>) -> Connection {
        Connection {
            description: description.into(),
            tasks: Vec::new(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn spawn<F>(&mut self, role: &'static str, channel: &str, task: F)
    where F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::info_span!("io", channel = %channel, role);
        self.tasks.push(tokio::spawn(task.instrument(span)));
    }

    /// Aborts the connection's tasks and waits for them to finish, so none of them observes
    ///  the teardown of shared resources.
    pub async fn close(mut self) {
        debug!("closing connection {}", self.description);
        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}
impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A transport's way of establishing a connection: create the socket, do whatever handshake
///  the transport needs, and spawn the sender and receiver tasks.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection>;

    /// Transports over a local device (a serial port) can connect without a network link
    fn needs_network_link(&self) -> bool {
        true
    }
}

/// Spawns the connector task of a channel, running the lifecycle loop for its transport
pub fn spawn_connector<T: Connect>(core: Arc<ChannelCore>, transport: T) -> JoinHandle<()> {
    let span = tracing::info_span!("connector", channel = %core.name());
    tokio::spawn(run_connector(core, transport).instrument(span))
}

/// The channel lifecycle: DISABLED waits to be enabled, STALE tears down the previous
///  connection, LINK_WAIT waits for a network link, DISCONNECTED connects, CONNECTING waits
///  for the retry delay after a failed attempt, and CONNECTED keeps the connection alive with
///  heartbeats and checks the watchdog.
///
/// Every transition is attempt-checked, so a reset at any point sends the loop back to STALE.
pub async fn run_connector<T: Connect>(core: Arc<ChannelCore>, transport: T) {
    info!("connector started");

    let config = core.config.clone();
    let mut watcher = core.state.watch();
    let mut connection: Option<Connection> = None;
    let mut heartbeat = Heartbeat::new(config.heartbeat_interval);

    loop {
        watcher.mark_seen();
        let (state, attempt) = core.state.get_with_attempt();

        match state {
            ConnState::Disabled => {
                disconnect(&core, &mut connection).await;
                watcher.changed_within(config.burp_time).await;
            }
            ConnState::Stale => {
                disconnect(&core, &mut connection).await;
                core.state.advance(attempt, ConnState::Stale, ConnState::LinkWait);
            }
            ConnState::LinkWait => {
                if !transport.needs_network_link() || core.manager().is_any_link_up() {
                    core.state.advance(attempt, ConnState::LinkWait, ConnState::Disconnected);
                }
                else {
                    watcher.changed_within(config.burp_time).await;
                }
            }
            ConnState::Disconnected => {
                core.install_security_object();

                let result = select! {
                    r = transport.connect(&core) => Some(r),
                    _ = core.state.until_superseded(attempt) => None,
                };

                match result {
                    None => {
                        debug!("connect attempt {} superseded", attempt);
                    }
                    Some(Ok(new_connection)) => {
                        // a server channel passes through WAIT_CONNECT while accepting
                        let connected = core.state.advance(attempt, ConnState::Disconnected, ConnState::Connected)
                            || core.state.advance(attempt, ConnState::WaitConnect, ConnState::Connected);

                        if connected {
                            info!("connected: {}", new_connection.description());
                            core.mark_connected();
                            heartbeat.reset();
                            connection = Some(new_connection);

                            let authorization = select! {
                                r = core.start_authorization() => Some(r),
                                _ = core.state.until_superseded(attempt) => None,
                            };

                            match authorization {
                                None => {
                                    debug!("authorization for attempt {} superseded", attempt);
                                }
                                Some(Err(e)) => {
                                    warn!("authorization failed: {}", e);
                                    core.state.failure_unless_disabled(attempt);
                                }
                                Some(Ok(())) => {}
                            }
                        }
                        else {
                            debug!("connection established for superseded attempt {} - closing", attempt);
                            new_connection.close().await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("connect failed: {}", e);
                        let _ = core.state.advance(attempt, ConnState::Disconnected, ConnState::Connecting)
                            || core.state.advance(attempt, ConnState::WaitConnect, ConnState::Connecting);
                    }
                }
            }
            ConnState::Connected | ConnState::Busy => {
                if config.heartbeat_enabled {
                    send_heartbeat_if_needed(&core, &mut heartbeat).await;
                }

                watcher.changed_within(config.burp_time).await;

                if core.watchdog.is_expired(Instant::now()) {
                    warn!("watchdog expired - no response from peer");
                    core.state.failure_unless_disabled(attempt);
                }
            }
            ConnState::Connecting => {
                if !core.state.wait_superseded(attempt, config.connect_retry_delay).await {
                    debug!("retrying connect");
                    core.state.failure_unless_disabled(attempt);
                }
            }
            ConnState::Pending | ConnState::WaitConnect | ConnState::Interrupted | ConnState::Exception => {
                if !core.state.wait_superseded(attempt, config.connect_retry_delay).await {
                    core.state.failure_unless_disabled(attempt);
                }
            }
        }
    }
}

async fn disconnect(core: &ChannelCore, connection: &mut Option<Connection>) {
    if let Some(c) = connection.take() {
        info!("disconnecting {}", c.description());
        c.close().await;
    }
    core.clear_connection_state();
}

async fn send_heartbeat_if_needed(core: &ChannelCore, heartbeat: &mut Heartbeat) {
    let now = Instant::now();
    if !heartbeat.is_due(now) {
        return;
    }
    // other traffic keeps the connection alive as well
    if core.queue.dist_len() > 0 {
        return;
    }

    heartbeat.sent(now);
    let Some(message) = core.manager().build_heartbeat() else {
        return;
    };
    let message = message.with_priority(PriorityLevel::FLASH);

    debug!("sending heartbeat");
    let (outcome, change) = core.queue.put_from_distributor(message).await;
    core.apply_busy_change(change);
    debug!("heartbeat {:?}", outcome.disposal_state());
}
