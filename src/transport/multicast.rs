use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::channel::connector::{Connect, Connection};
use crate::channel::core::ChannelCore;
use crate::channel::manager::{ChannelManager, OpenSecurityObjectFactory};
use crate::channel::ConnectorChannel;
use crate::config::MulticastConfig;
use crate::transport::datagram::{run_datagram_receiver, run_datagram_sender};

/// Binds the group port with address reuse, so several processes on a host can share the
///  group, and joins the group
pub fn bind_multicast(config: &MulticastConfig) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)).into())?;

    socket.join_multicast_v4(&config.group, &config.interface)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_multicast_loop_v4(config.loopback)?;
    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)?;
    }
    debug!("joined {} on port {} via {}", config.group, config.port, config.interface);

    Ok(UdpSocket::from_std(socket.into())?)
}

/// The addresses our own datagrams come from: the configured interface, or the address the OS
///  routes the group through
pub async fn local_addresses(config: &MulticastConfig) -> Vec<IpAddr> {
    let mut result = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    if !config.interface.is_unspecified() {
        result.push(IpAddr::V4(config.interface));
    }

    // connecting a UDP socket sends nothing, but makes the OS pick a source address
    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        if socket.connect((config.group, config.port)).await.is_ok() {
            if let Ok(addr) = socket.local_addr() {
                if !result.contains(&addr.ip()) {
                    result.push(addr.ip());
                }
            }
        }
    }
    result
}

pub struct MulticastTransport {
    config: MulticastConfig,
}

#[async_trait]
impl Connect for MulticastTransport {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection> {
        let socket = Arc::new(bind_multicast(&self.config)?);
        let local = local_addresses(&self.config).await;
        debug!("own addresses: {:?}", local);

        let target = SocketAddr::V4(SocketAddrV4::new(self.config.group, self.config.port));
        let mut connection = Connection::new(format!("multicast {}", target));
        connection.spawn("sender", core.name(), run_datagram_sender(core.clone(), socket.clone(), target));
        connection.spawn("receiver", core.name(), run_datagram_receiver(core.clone(), socket, local));
        Ok(connection)
    }
}

/// A channel to an IP multicast group. There is no handshake, so the channel is authorized as
///  soon as the socket is bound.
pub fn channel(name: &str, config: MulticastConfig, manager: Arc<dyn ChannelManager>) -> anyhow::Result<ConnectorChannel> {
    config.validate()?;
    info!(channel = %name, "multicast channel for {}:{}", config.group, config.port);
    let core = ChannelCore::new(name, config.channel.clone(), manager, Arc::new(OpenSecurityObjectFactory))?;
    Ok(ConnectorChannel::start(core, MulticastTransport { config }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_addresses_include_interface() {
        let mut config = MulticastConfig::new(Ipv4Addr::new(228, 10, 10, 90), 9982);
        config.interface = Ipv4Addr::new(10, 1, 2, 3);
        let local = local_addresses(&config).await;
        assert!(local.contains(&IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
        assert!(local.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_rejects_unicast_group() {
        let config = MulticastConfig::new(Ipv4Addr::new(192, 168, 1, 1), 9982);
        let result = channel("multicast", config, Arc::new(crate::test_util::RecordingManager::new()));
        assert!(result.is_err());
    }
}
