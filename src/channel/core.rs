use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, trace, warn};

use crate::channel::heartbeat::Watchdog;
use crate::channel::manager::{AuthorizationGate, ChannelManager, SecurityObject, SecurityObjectFactory};
use crate::channel::send_queue::{BusyChange, SendOutcome, SenderQueue};
use crate::channel::state::{ChannelState, ConnState};
use crate::channel::stats::ChannelStats;
use crate::config::ChannelConfig;
use crate::wire::message::{DisposalState, Message};

/// State shared between a channel's connector, sender and receiver tasks: everything except the
///  transport specific socket handling.
pub struct ChannelCore {
    name: Arc<str>,
    pub config: ChannelConfig,
    pub state: ChannelState,
    pub queue: SenderQueue,
    pub stats: Arc<ChannelStats>,
    pub watchdog: Watchdog,
    manager: Arc<dyn ChannelManager>,
    security_factory: Arc<dyn SecurityObjectFactory>,
    security: Mutex<Option<Arc<dyn SecurityObject>>>,
    authorized: AtomicBool,
    is_connected: AtomicBool,
}

impl ChannelCore {
    pub fn new(
        name: &str,
        config: ChannelConfig,
        manager: Arc<dyn ChannelManager>,
        security_factory: Arc<dyn SecurityObjectFactory>,
    ) -> anyhow::Result<Arc<ChannelCore>> {
        config.validate()?;

        let name: Arc<str> = name.into();
        Ok(Arc::new(ChannelCore {
            state: ChannelState::new(name.clone(), manager.clone(), ConnState::Disabled),
            queue: SenderQueue::new(&name, config.send_queue_capacity, config.low_water, config.offer_timeout),
            stats: Arc::new(ChannelStats::default()),
            watchdog: Watchdog::new(config.watchdog_timeout),
            name,
            config,
            manager,
            security_factory,
            security: Mutex::new(None),
            authorized: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<dyn ChannelManager> {
        &self.manager
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    pub fn mark_connected(&self) {
        self.is_connected.store(true, Ordering::Release);
    }

    /// Called by sender and receiver tasks when an I/O operation failed. Only the first report
    ///  per connection has an effect: it resets the channel, which sends the connector through
    ///  a full reconnect.
    pub fn socket_operation_failed(&self) {
        if self.is_connected.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            warn!(channel = %self.name, "socket operation failed - resetting");
            self.state.reset();
        }
        else {
            trace!(channel = %self.name, "socket operation failed, but channel is already being reset");
        }
    }

    /// Submits a message from the distributor. Only connected channels accept messages.
    pub async fn send_request(&self, message: Message) -> SendOutcome {
        if !self.state.get().is_connected() {
            debug!(channel = %self.name, "rejecting message - channel is {}", self.state.get());
            return SendOutcome::Rejected(message);
        }
        let (outcome, change) = self.queue.put_from_distributor(message).await;
        self.apply_busy_change(change);
        outcome
    }

    /// reflects the queue's fill level in the channel state
    pub fn apply_busy_change(&self, change: Option<BusyChange>) {
        match change {
            Some(BusyChange::BecameBusy) => {
                self.state.compare_and_set(ConnState::Connected, ConnState::Busy);
            }
            Some(BusyChange::BecameIdle) => {
                self.state.compare_and_set(ConnState::Busy, ConnState::Connected);
            }
            None => {}
        }
    }

    /// takes the next message to send, blocking until there is one the channel may send
    pub async fn take(&self) -> Message {
        let (message, change) = self.queue.take().await;
        self.apply_busy_change(change);
        message
    }

    pub fn try_take(&self) -> Option<Message> {
        self.try_take_if(|_| true)
    }

    /// takes the next message if it passes `accept`, see [SenderQueue::try_take_if]
    pub fn try_take_if(&self, accept: impl FnOnce(&Message) -> bool) -> Option<Message> {
        let (message, change) = self.queue.try_take_if(accept)?;
        self.apply_busy_change(change);
        Some(message)
    }

    /// Creates the security object for a new connection. Its handshake is started separately
    ///  by [ChannelCore::start_authorization] once the connection is up.
    pub fn install_security_object(self: &Arc<Self>) -> Arc<dyn SecurityObject> {
        let gate = AuthorizationGate::new(Arc::downgrade(self));
        let security = self.security_factory.create(gate);
        *self.security.lock().unwrap_or_else(PoisonError::into_inner) = Some(security.clone());
        security
    }

    fn current_security_object(&self) -> Option<Arc<dyn SecurityObject>> {
        self.security.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn start_authorization(&self) -> anyhow::Result<()> {
        let security = match self.current_security_object() {
            Some(s) => s,
            None => anyhow::bail!("no security object installed"),
        };
        let request = self.manager.build_authentication_request();
        debug!(channel = %self.name, "starting authorization");
        security.authorize(request).await
    }

    pub fn authorization_succeeded(&self, message: Option<Message>) {
        info!(channel = %self.name, "authorization succeeded");
        self.authorized.store(true, Ordering::Release);
        self.queue.mark_as_authorized();
        self.manager.authorization_succeeded(&self.name, message);
    }

    /// Tears down per-connection state: queued messages are rejected, and the next connection
    ///  starts unauthorized with a fresh security object.
    pub fn clear_connection_state(&self) {
        self.is_connected.store(false, Ordering::Release);
        self.authorized.store(false, Ordering::Release);
        *self.security.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.queue.reset();
        self.watchdog.clear();
    }

    /// Routes a received message: to the security object while the handshake is in progress,
    ///  to the channel manager afterwards.
    pub async fn deliver_message(&self, message: Message) -> bool {
        self.stats.record_received();
        self.watchdog.on_read();
        let message = message.with_channel(&self.name);

        if self.is_authorized() {
            trace!(channel = %self.name, "delivering {:?}", message);
            self.manager.deliver(message).await
        }
        else {
            match self.current_security_object() {
                Some(security) => {
                    trace!(channel = %self.name, "delivering {:?} to security object", message);
                    security.deliver_message(message).await
                }
                None => {
                    warn!(channel = %self.name, "received message before security object was installed - dropping");
                    false
                }
            }
        }
    }

    /// called when a frame was written to the transport
    pub fn frame_sent(&self, message: &Message, wire_bytes: usize) {
        self.stats.record_sent(wire_bytes);
        self.watchdog.on_send();
        message.ack(&self.name, DisposalState::Sent);
    }
}

/// A message taken from the queue but not yet written. If the task holding it is cancelled
///  before the write completes, the message is reported as REJECTED.
pub struct InFlight<'a> {
    channel: &'a str,
    message: Option<Message>,
}
impl<'a> InFlight<'a> {
    pub fn new(channel: &'a str, message: Message) -> InFlight<'a> {
        InFlight {
            channel,
            message: Some(message),
        }
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// hands the message out of the guard, e.g. after it was written successfully
    pub fn finish(mut self) -> Option<Message> {
        self.message.take()
    }

    pub fn fail(mut self, status: DisposalState) {
        if let Some(message) = self.message.take() {
            message.ack(self.channel, status);
        }
    }
}
impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            debug!(channel = %self.channel, "send of {:?} was interrupted", message);
            message.ack(self.channel, DisposalState::Rejected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::manager::{MockChannelManager, MockSecurityObject, MockSecurityObjectFactory, OpenSecurityObjectFactory};
    use crate::test_util::RecordingManager;
    use crate::wire::message::MockDisposalHandler;
    use mockall::predicate::eq;
    use tokio::runtime::Builder;

    fn core_with(manager: Arc<dyn ChannelManager>) -> Arc<ChannelCore> {
        ChannelCore::new("test", ChannelConfig::default_tcp(), manager, Arc::new(OpenSecurityObjectFactory)).unwrap()
    }

    fn msg(payload: &[u8]) -> Message {
        Message::builder().payload(payload.to_vec()).build().unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ChannelConfig::default_tcp();
        config.send_queue_capacity = 0;
        let manager = Arc::new(RecordingManager::new());
        assert!(ChannelCore::new("test", config, manager, Arc::new(OpenSecurityObjectFactory)).is_err());
    }

    #[test]
    fn test_socket_operation_failed_fires_once() {
        let manager = Arc::new(RecordingManager::new());
        let core = core_with(manager.clone());
        core.state.set(ConnState::Connected);
        core.mark_connected();
        let attempt = core.state.attempt();

        core.socket_operation_failed();
        core.socket_operation_failed();

        assert_eq!(core.state.get(), ConnState::Stale);
        assert_eq!(core.state.attempt(), attempt + 1);
        assert!(!core.is_connected());
    }

    #[test]
    fn test_send_request_requires_connection() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let core = core_with(Arc::new(RecordingManager::new()));
            assert!(matches!(core.send_request(msg(b"a")).await, SendOutcome::Rejected(_)));

            core.state.set(ConnState::Connected);
            assert!(matches!(core.send_request(msg(b"a")).await, SendOutcome::Queued));
            assert_eq!(core.queue.dist_len(), 1);
        });
    }

    #[test]
    fn test_busy_state() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let core = core_with(Arc::new(RecordingManager::new()));
            core.state.set(ConnState::Connected);
            core.queue.mark_as_authorized();

            for _ in 0..core.config.send_queue_capacity {
                assert!(matches!(core.send_request(msg(b"a")).await, SendOutcome::Queued));
            }
            assert_eq!(core.state.get(), ConnState::Busy);
            assert!(matches!(core.send_request(msg(b"a")).await, SendOutcome::Busy(_)));

            while core.queue.dist_len() > core.config.low_water {
                core.try_take().unwrap();
            }
            assert_eq!(core.state.get(), ConnState::Connected);
        });
    }

    #[test]
    fn test_delivery_goes_to_security_object_until_authorized() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut manager = MockChannelManager::new();
            manager.expect_status_change().return_const(());
            manager.expect_build_authentication_request().return_const(None);
            manager.expect_authorization_succeeded()
                .withf(|channel, _| channel == "test")
                .times(1)
                .return_const(());
            manager.expect_deliver()
                .withf(|m| m.payload().as_ref() == b"after" && m.channel() == Some("test"))
                .times(1)
                .return_const(true);

            let mut factory = MockSecurityObjectFactory::new();
            factory.expect_create()
                .times(1)
                .returning(|gate| {
                    let mut security = MockSecurityObject::new();
                    security.expect_deliver_message()
                        .withf(|m| m.payload().as_ref() == b"before")
                        .times(1)
                        .return_const(true);
                    security.expect_authorize()
                        .times(1)
                        .returning(move |request| {
                            gate.succeeded(request);
                            Ok(())
                        });
                    Arc::new(security)
                });

            let core = ChannelCore::new("test", ChannelConfig::default_tcp(), Arc::new(manager), Arc::new(factory)).unwrap();
            core.install_security_object();

            assert!(core.deliver_message(msg(b"before")).await);
            core.start_authorization().await.unwrap();
            assert!(core.is_authorized());
            assert!(core.queue.is_authorized());
            assert!(core.deliver_message(msg(b"after")).await);
            assert_eq!(core.stats.messages_received(), 2);
        });
    }

    #[test]
    fn test_clear_connection_state() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let core = core_with(Arc::new(RecordingManager::new()));
            core.install_security_object();
            core.start_authorization().await.unwrap();
            core.state.set(ConnState::Connected);
            core.mark_connected();
            core.send_request(msg(b"x")).await;

            core.clear_connection_state();
            assert!(!core.is_authorized());
            assert!(!core.queue.is_authorized());
            assert!(!core.is_connected());
            assert_eq!(core.queue.dist_len(), 0);
            assert!(core.start_authorization().await.is_err());
        });
    }

    #[test]
    fn test_in_flight_rejects_when_dropped() {
        let mut handler = MockDisposalHandler::new();
        handler.expect_ack()
            .with(eq("test"), eq(DisposalState::Rejected))
            .times(1)
            .return_const(());
        let m = Message::builder().payload(vec![1]).handler(Arc::new(handler)).build().unwrap();

        let in_flight = InFlight::new("test", m);
        drop(in_flight);
    }

    #[test]
    fn test_in_flight_finish_does_not_ack() {
        let mut handler = MockDisposalHandler::new();
        handler.expect_ack().times(0);
        let m = Message::builder().payload(vec![1]).handler(Arc::new(handler)).build().unwrap();

        let in_flight = InFlight::new("test", m);
        assert!(in_flight.finish().is_some());
    }
}
