use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::channel::connector::{Connect, Connection};
use crate::channel::core::ChannelCore;
use crate::channel::manager::{ChannelManager, SecurityObjectFactory};
use crate::channel::state::ConnState;
use crate::channel::ConnectorChannel;
use crate::config::TcpServerConfig;
use crate::transport::stream_connection;

/// written to an accepted client before anything else
pub const GOOD_TO_GO: u8 = 0x01;

/// Serves one client at a time: accepts, greets the client, and runs the stream roles until the
///  connection drops. The listening socket stays bound across connections.
pub struct TcpServerTransport {
    listener: TcpListener,
}
impl TcpServerTransport {
    pub async fn bind(config: &TcpServerConfig) -> anyhow::Result<TcpServerTransport> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("listening on {}", listener.local_addr()?);
        Ok(TcpServerTransport { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Connect for TcpServerTransport {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection> {
        core.state.compare_and_set(ConnState::Disconnected, ConnState::WaitConnect);
        debug!("waiting for a client");

        let (mut stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        stream.write_all(&[GOOD_TO_GO]).await?;
        info!("accepted client {}", peer);

        Ok(stream_connection(core, format!("tcp client {}", peer), stream))
    }
}

pub async fn channel(
    name: &str,
    config: TcpServerConfig,
    manager: Arc<dyn ChannelManager>,
    security: Arc<dyn SecurityObjectFactory>,
) -> anyhow::Result<ConnectorChannel> {
    let transport = TcpServerTransport::bind(&config).await?;
    let core = ChannelCore::new(name, config.channel, manager, security)?;
    Ok(ConnectorChannel::start(core, transport))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use crate::channel::manager::OpenSecurityObjectFactory;
    use crate::channel::Channel;
    use crate::test_util::RecordingManager;
    use crate::wire::codec::serialize;
    use crate::wire::message::{Message, Version};

    async fn server(manager: Arc<RecordingManager>) -> (ConnectorChannel, SocketAddr) {
        let mut config = TcpServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.channel.heartbeat_enabled = false;
        config.channel.watchdog_timeout = None;
        config.channel.connect_retry_delay = Duration::from_millis(100);

        let transport = TcpServerTransport::bind(&config).await.unwrap();
        let addr = transport.local_addr().unwrap();
        let core = ChannelCore::new("server", config.channel, manager, Arc::new(OpenSecurityObjectFactory)).unwrap();
        (ConnectorChannel::start(core, transport), addr)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_waits_for_client_and_greets_it() {
        let manager = Arc::new(RecordingManager::new());
        let (channel, addr) = server(manager.clone()).await;
        channel.enable();

        wait_for(|| channel.state().conn == ConnState::WaitConnect).await;
        assert!(!channel.is_connected());

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(client.read_u8().await.unwrap(), GOOD_TO_GO);
        wait_for(|| channel.is_connected()).await;

        let message = Message::builder().payload(b"hello server".to_vec()).build().unwrap();
        client.write_all(&serialize(&message, Version::Full, 0).unwrap()).await.unwrap();
        wait_for(|| !manager.delivered().is_empty()).await;
        assert_eq!(manager.delivered()[0].channel(), Some("server"));
    }

    #[tokio::test]
    async fn test_accepts_next_client_after_disconnect() {
        let manager = Arc::new(RecordingManager::new());
        let (channel, addr) = server(manager).await;
        channel.enable();

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(first.read_u8().await.unwrap(), GOOD_TO_GO);
        wait_for(|| channel.is_connected()).await;
        drop(first);

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(second.read_u8().await.unwrap(), GOOD_TO_GO);
        wait_for(|| channel.is_connected()).await;
    }
}
