use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::channel::core::ChannelCore;
use crate::channel::state::{ChannelStatus, ConnState};
use crate::wire::message::Message;

/// The delivery sink and policy provider a channel reports to. Channels get a handle to it at
///  construction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelManager: Send + Sync + 'static {
    /// hands a received message on, returning `false` if it was not accepted
    async fn deliver(&self, message: Message) -> bool;

    /// whether any network link (interface) is up that a channel could connect over
    fn is_any_link_up(&self) -> bool;

    fn status_change(&self, channel: &str, old: ConnState, status: ChannelStatus);

    /// the channel's security object completed its handshake
    fn authorization_succeeded(&self, channel: &str, message: Option<Message>);

    fn build_authentication_request(&self) -> Option<Message>;

    fn operator_id(&self) -> String;

    /// `None` if the manager has nothing to say, in which case no heartbeat is sent
    fn build_heartbeat(&self) -> Option<Message>;
}

/// The authentication handshake of a single connection. Until it reports success through its
///  [AuthorizationGate], received messages go to the security object rather than the manager,
///  and only the messages it queues are sent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecurityObject: Send + Sync + 'static {
    async fn authorize(&self, request: Option<Message>) -> anyhow::Result<()>;

    /// a message received before authorization completed
    async fn deliver_message(&self, message: Message) -> bool;
}

#[cfg_attr(test, automock)]
pub trait SecurityObjectFactory: Send + Sync + 'static {
    fn create(&self, gate: AuthorizationGate) -> Arc<dyn SecurityObject>;
}

/// A security object's access to its channel
#[derive(Clone)]
pub struct AuthorizationGate {
    core: Weak<ChannelCore>,
}
impl AuthorizationGate {
    pub fn new(core: Weak<ChannelCore>) -> AuthorizationGate {
        AuthorizationGate { core }
    }

    /// queues a handshake message, bypassing the authorization gate
    pub fn put(&self, message: Message) {
        match self.core.upgrade() {
            Some(core) => core.queue.put_from_security_object(message),
            None => warn!("channel is gone - dropping handshake message"),
        }
    }

    pub fn finished_putting(&self) {
        if let Some(core) = self.core.upgrade() {
            core.queue.finished_putting_from_security_object();
        }
    }

    pub fn succeeded(&self, message: Option<Message>) {
        if let Some(core) = self.core.upgrade() {
            core.authorization_succeeded(message);
        }
    }
}

/// Authorizes immediately - for channels where no authentication is configured
pub struct OpenSecurityObject {
    gate: AuthorizationGate,
}

#[async_trait]
impl SecurityObject for OpenSecurityObject {
    async fn authorize(&self, request: Option<Message>) -> anyhow::Result<()> {
        debug!("open security object - authorizing immediately");
        self.gate.succeeded(request);
        Ok(())
    }

    async fn deliver_message(&self, message: Message) -> bool {
        debug!("open security object - ignoring {:?} received before authorization", message);
        false
    }
}

pub struct OpenSecurityObjectFactory;
impl SecurityObjectFactory for OpenSecurityObjectFactory {
    fn create(&self, gate: AuthorizationGate) -> Arc<dyn SecurityObject> {
        Arc::new(OpenSecurityObject { gate })
    }
}
