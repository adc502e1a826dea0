use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::channel::connector::{Connect, Connection};
use crate::channel::core::ChannelCore;
use crate::channel::manager::{ChannelManager, SecurityObjectFactory};
use crate::channel::ConnectorChannel;
use crate::config::SslConfig;
use crate::transport::stream_connection;
use crate::transport::tcp_client::connect_tcp;

/// reads the trusted CA certificates from a PEM file
pub fn load_root_certificates(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)?;
    }
    if roots.is_empty() {
        bail!("no CA certificates in {:?}", path);
    }
    debug!("loaded {} CA certificates from {:?}", roots.len(), path);
    Ok(roots)
}

/// TCP with a TLS client handshake on top. Once the handshake completes, the channel behaves
///  exactly like a plain TCP client.
pub struct SslTransport {
    config: SslConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}
impl SslTransport {
    pub fn new(config: SslConfig) -> anyhow::Result<SslTransport> {
        config.validate()?;
        let roots = load_root_certificates(&config.ca_bundle)?;
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(config.effective_server_name().to_string())?;

        Ok(SslTransport {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
            config,
        })
    }
}

#[async_trait]
impl Connect for SslTransport {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection> {
        let tcp = connect_tcp(&self.config.host, self.config.port, core).await?;
        let peer = tcp.peer_addr()?;

        let handshake = self.connector.connect(self.server_name.clone(), tcp);
        let stream = match timeout(core.config.connect_timeout, handshake).await {
            Ok(stream) => stream?,
            Err(_) => bail!("TLS handshake with {} timed out", peer),
        };
        info!("TLS session established with {} ({})", peer, self.config.effective_server_name());

        Ok(stream_connection(core, format!("ssl {}", peer), stream))
    }
}

pub fn channel(
    name: &str,
    config: SslConfig,
    manager: Arc<dyn ChannelManager>,
    security: Arc<dyn SecurityObjectFactory>,
) -> anyhow::Result<ConnectorChannel> {
    let channel_config = config.channel.clone();
    let transport = SslTransport::new(config)?;
    let core = ChannelCore::new(name, channel_config, manager, security)?;
    Ok(ConnectorChannel::start(core, transport))
}
