use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::channel::connector::{Connect, Connection};
use crate::channel::core::ChannelCore;
use crate::channel::manager::{ChannelManager, SecurityObjectFactory};
use crate::channel::ConnectorChannel;
use crate::config::TcpClientConfig;
use crate::transport::stream_connection;

/// opens a TCP connection within the configured connect timeout
pub async fn connect_tcp(host: &str, port: u16, core: &ChannelCore) -> anyhow::Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    debug!("connecting to {}", addr);

    let stream = match timeout(core.config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(stream) => stream?,
        Err(_) => bail!("connecting to {} timed out after {:?}", addr, core.config.connect_timeout),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub struct TcpClientTransport {
    config: TcpClientConfig,
}

#[async_trait]
impl Connect for TcpClientTransport {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection> {
        let stream = connect_tcp(&self.config.host, self.config.port, core).await?;
        let description = format!("tcp {}", stream.peer_addr()?);
        Ok(stream_connection(core, description, stream))
    }
}

/// A channel that connects to a gateway over TCP and reconnects whenever the connection drops
pub fn channel(
    name: &str,
    config: TcpClientConfig,
    manager: Arc<dyn ChannelManager>,
    security: Arc<dyn SecurityObjectFactory>,
) -> anyhow::Result<ConnectorChannel> {
    config.validate()?;
    let core = ChannelCore::new(name, config.channel.clone(), manager, security)?;
    Ok(ConnectorChannel::start(core, TcpClientTransport { config }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use crate::channel::manager::OpenSecurityObjectFactory;
    use crate::channel::send_queue::SendOutcome;
    use crate::channel::state::ConnState;
    use crate::channel::Channel;
    use crate::test_util::RecordingManager;
    use crate::wire::codec::{serialize, FULL_HEADER_LEN};
    use crate::wire::message::{Message, Version};

    fn config(port: u16) -> TcpClientConfig {
        let mut config = TcpClientConfig::new("127.0.0.1", port);
        config.channel.heartbeat_enabled = false;
        config.channel.watchdog_timeout = None;
        config.channel.connect_retry_delay = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn test_exchange_with_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let manager = Arc::new(RecordingManager::new());
        let channel = channel("tcp", config(port), manager.clone(), Arc::new(OpenSecurityObjectFactory)).unwrap();
        channel.enable();

        let (mut gateway, _) = listener.accept().await.unwrap();
        while !channel.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let inbound = Message::builder().payload(b"from gateway".to_vec()).build().unwrap();
        gateway.write_all(&serialize(&inbound, Version::Full, 0).unwrap()).await.unwrap();

        let outbound = Message::builder().payload(b"to gateway".to_vec()).build().unwrap();
        assert!(matches!(channel.send_request(outbound).await, SendOutcome::Queued));

        let mut frame = vec![0u8; FULL_HEADER_LEN + 10];
        gateway.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[FULL_HEADER_LEN..], b"to gateway");

        while manager.delivered().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.delivered()[0].payload().as_ref(), b"from gateway");
    }

    #[tokio::test]
    async fn test_refused_connection_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = Arc::new(RecordingManager::new());
        let channel = channel("tcp", config(port), manager.clone(), Arc::new(OpenSecurityObjectFactory)).unwrap();
        channel.enable();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!channel.is_connected());
        let connecting = manager.transitions().iter()
            .filter(|(_, new)| *new == ConnState::Connecting)
            .count();
        assert!(connecting >= 2, "{:?}", manager.transitions());
    }

    #[test]
    fn test_invalid_config() {
        let result = channel("tcp", TcpClientConfig::new("", 1), Arc::new(RecordingManager::new()), Arc::new(OpenSecurityObjectFactory));
        assert!(result.is_err());
    }
}
