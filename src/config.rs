use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

/// Timing and sizing shared by all channels
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// period of the connector's housekeeping wake-up while waiting
    pub burp_time: Duration,
    pub connect_retry_delay: Duration,
    pub connect_timeout: Duration,

    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    /// A connection is considered dead if frames were sent but nothing was read for this long.
    ///  `None` disables the watchdog.
    pub watchdog_timeout: Option<Duration>,

    pub send_queue_capacity: usize,
    /// distributor submissions wait at most this long for room in the send queue
    pub offer_timeout: Duration,
    /// the queue reports BUSY when full and stops doing so when it drains to this level
    pub low_water: usize,

    /// frames announcing a bigger payload are discarded on receipt and rejected on send
    pub max_message_size: usize,
    pub receive_buffer_size: usize,

    pub stats_interval: Duration,
}

impl ChannelConfig {
    pub fn default_tcp() -> ChannelConfig {
        ChannelConfig {
            burp_time: Duration::from_secs(5),
            connect_retry_delay: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(30),
            heartbeat_enabled: true,
            heartbeat_interval: Duration::from_secs(10),
            watchdog_timeout: Some(Duration::from_secs(45)),
            send_queue_capacity: 20,
            offer_timeout: Duration::from_secs(1),
            low_water: 5,
            max_message_size: 0x100000,
            receive_buffer_size: 0x15554,
            stats_interval: Duration::from_secs(60),
        }
    }

    /// datagram channels have no connection to watch, and nothing to keep alive
    pub fn default_datagram() -> ChannelConfig {
        ChannelConfig {
            heartbeat_enabled: false,
            watchdog_timeout: None,
            // a UDP datagram can not carry more than this
            max_message_size: 65_507,
            ..Self::default_tcp()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_queue_capacity == 0 {
            bail!("send queue capacity must be positive");
        }
        if self.low_water >= self.send_queue_capacity {
            bail!("low water mark {} must be below the send queue capacity {}", self.low_water, self.send_queue_capacity);
        }
        if self.burp_time.is_zero() {
            bail!("burp time must be positive");
        }
        if self.heartbeat_enabled && self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.receive_buffer_size < 64 {
            bail!("receive buffer is too small");
        }
        if self.stats_interval.is_zero() {
            bail!("stats interval must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    pub channel: ChannelConfig,
}
impl TcpClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> TcpClientConfig {
        TcpClientConfig {
            host: host.into(),
            port,
            channel: ChannelConfig::default_tcp(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        if self.port == 0 {
            bail!("port must not be 0");
        }
        self.channel.validate()
    }
}

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub bind_addr: SocketAddr,
    pub channel: ChannelConfig,
}
impl TcpServerConfig {
    pub fn new(bind_addr: SocketAddr) -> TcpServerConfig {
        TcpServerConfig {
            bind_addr,
            channel: ChannelConfig::default_tcp(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.channel.validate()
    }
}

#[derive(Debug, Clone)]
pub struct SslConfig {
    pub host: String,
    pub port: u16,
    /// the name the server certificate must be valid for, defaults to the host if `None`
    pub server_name: Option<String>,
    /// PEM file with the trusted CA certificates
    pub ca_bundle: PathBuf,
    pub channel: ChannelConfig,
}
impl SslConfig {
    pub fn new(host: impl Into<String>, port: u16, ca_bundle: impl Into<PathBuf>) -> SslConfig {
        SslConfig {
            host: host.into(),
            port,
            server_name: None,
            ca_bundle: ca_bundle.into(),
            channel: ChannelConfig::default_tcp(),
        }
    }

    pub fn effective_server_name(&self) -> &str {
        self.server_name.as_deref()
            .unwrap_or(&self.host)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            bail!("host must not be empty");
        }
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.ca_bundle.as_os_str().is_empty() {
            bail!("CA bundle path must not be empty");
        }
        self.channel.validate()
    }
}

#[derive(Debug, Clone)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub ttl: u32,
    /// local interface to join the group on, `UNSPECIFIED` lets the OS pick
    pub interface: Ipv4Addr,
    /// whether our own datagrams are looped back - they are discarded on receipt either way
    pub loopback: bool,
    pub channel: ChannelConfig,
}
impl MulticastConfig {
    pub fn new(group: Ipv4Addr, port: u16) -> MulticastConfig {
        MulticastConfig {
            group,
            port,
            ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: false,
            channel: ChannelConfig::default_datagram(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.group.is_multicast() {
            bail!("{} is not a multicast address", self.group);
        }
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.ttl == 0 || self.ttl > 255 {
            bail!("TTL must be between 1 and 255");
        }
        self.channel.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ReliableMulticastConfig {
    pub multicast: MulticastConfig,
    /// identifies this node in the group - `None` derives it from the operator id
    pub node_id: Option<u64>,
    pub heartbeat_interval: Duration,
    /// members not heard from for this long are removed from the view
    pub membership_timeout: Duration,
    /// number of sent frames kept for answering NAKs
    pub retransmit_buffer_size: usize,
    /// minimum delay between two NAKs for the same gap
    pub nak_interval: Duration,
    /// upper bound for out-of-order frames buffered per sender
    pub max_reorder_buffer: usize,
}
impl ReliableMulticastConfig {
    pub fn new(group: Ipv4Addr, port: u16) -> ReliableMulticastConfig {
        ReliableMulticastConfig {
            multicast: MulticastConfig::new(group, port),
            node_id: None,
            heartbeat_interval: Duration::from_secs(2),
            membership_timeout: Duration::from_secs(10),
            retransmit_buffer_size: 256,
            nak_interval: Duration::from_millis(200),
            max_reorder_buffer: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        if self.membership_timeout <= self.heartbeat_interval {
            bail!("membership timeout must be longer than the heartbeat interval");
        }
        if self.retransmit_buffer_size == 0 {
            bail!("retransmit buffer must not be empty");
        }
        if self.max_reorder_buffer == 0 {
            bail!("reorder buffer must not be empty");
        }
        self.multicast.validate()
    }
}

#[derive(Debug, Clone)]
pub struct RetransmitterConfig {
    pub default_resends: u8,
    pub max_packets_per_slot: usize,
    /// number of slots the connectivity matrix and ack bitmaps can represent
    pub max_slots: usize,
    /// number of hyperperiods of receive history kept for duplicate detection
    pub slot_history: usize,
    pub default_hop_count: u8,
    /// a slot we have not heard from directly for this many hyperperiods is no longer
    ///  considered a direct neighbour
    pub connectivity_expiry_hyperperiods: u16,
}
impl RetransmitterConfig {
    pub fn default_tdma() -> RetransmitterConfig {
        RetransmitterConfig {
            default_resends: 3,
            max_packets_per_slot: 7,
            max_slots: 16,
            slot_history: 16,
            default_hop_count: 3,
            connectivity_expiry_hyperperiods: 8,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_slots == 0 || self.max_slots > 16 {
            bail!("max slots must be between 1 and 16");
        }
        // ack bitmaps have seven bits for packet indices, the eighth is the connectivity bit
        if self.max_packets_per_slot == 0 || self.max_packets_per_slot > 7 {
            bail!("max packets per slot must be between 1 and 7");
        }
        if self.slot_history < 2 {
            bail!("slot history must cover at least two hyperperiods");
        }
        if self.default_hop_count == 0 {
            bail!("default hop count must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FragmenterConfig {
    pub max_fragment_payload: usize,
    pub fragments_per_token: usize,
    pub queue_capacity: usize,
    pub reset_interval: Duration,
    pub token_interval: Duration,
    pub operator_id: String,
}
impl FragmenterConfig {
    pub fn default_satcom(operator_id: impl Into<String>) -> FragmenterConfig {
        FragmenterConfig {
            max_fragment_payload: 1000,
            fragments_per_token: 1,
            queue_capacity: 19,
            reset_interval: Duration::from_secs(5),
            token_interval: Duration::from_secs(10),
            operator_id: operator_id.into(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_fragment_payload == 0 {
            bail!("max fragment payload must be positive");
        }
        if self.fragments_per_token == 0 {
            bail!("at least one fragment must be sent per token");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub device: PathBuf,
    pub baud_rate: u32,

    pub slot_number: u32,
    pub radios_in_group: u32,
    pub slot_duration: Duration,
    pub transmit_duration: Duration,

    pub sender_enabled: bool,
    /// token passing fragmentation mode instead of TDMA
    pub satcom_enabled: bool,

    pub max_receive_payload: usize,
    /// room kept at the end of a slot for the ack packet
    pub reserve_for_ack: usize,
    pub connect_retry_wait: Duration,

    pub channel: ChannelConfig,
    pub retransmitter: RetransmitterConfig,
    pub fragmenter: FragmenterConfig,
}
impl SerialConfig {
    pub fn default_serial(device: impl Into<PathBuf>) -> SerialConfig {
        SerialConfig {
            device: device.into(),
            baud_rate: 9600,
            slot_number: 8,
            radios_in_group: 16,
            slot_duration: Duration::from_millis(750),
            transmit_duration: Duration::from_millis(500),
            sender_enabled: true,
            satcom_enabled: false,
            max_receive_payload: 2000,
            reserve_for_ack: 50,
            connect_retry_wait: Duration::from_secs(5),
            channel: ChannelConfig {
                heartbeat_enabled: false,
                watchdog_timeout: None,
                ..ChannelConfig::default_tcp()
            },
            retransmitter: RetransmitterConfig::default_tdma(),
            fragmenter: FragmenterConfig::default_satcom(""),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.baud_rate == 0 {
            bail!("baud rate {} is too low", self.baud_rate);
        }
        if self.radios_in_group == 0 {
            bail!("there must be at least one radio in the group");
        }
        if self.radios_in_group as usize > self.retransmitter.max_slots {
            bail!("{} radios do not fit into {} slots", self.radios_in_group, self.retransmitter.max_slots);
        }
        if self.slot_number as usize >= self.retransmitter.max_slots {
            bail!("slot number {} is out of range for {} slots", self.slot_number, self.retransmitter.max_slots);
        }
        if self.slot_duration.is_zero() {
            bail!("slot duration must be positive");
        }
        if self.transmit_duration.is_zero() || self.transmit_duration > self.slot_duration {
            bail!("transmit duration must be positive and no longer than the slot duration");
        }
        if self.connect_retry_wait.is_zero() {
            bail!("connect retry wait must be positive");
        }
        self.channel.validate()?;
        self.retransmitter.validate()?;
        self.fragmenter.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_defaults_are_valid() {
        ChannelConfig::default_tcp().validate().unwrap();
        ChannelConfig::default_datagram().validate().unwrap();
        TcpClientConfig::new("localhost", 33289).validate().unwrap();
        TcpServerConfig::new("0.0.0.0:33289".parse().unwrap()).validate().unwrap();
        SslConfig::new("localhost", 33290, "ca.pem").validate().unwrap();
        MulticastConfig::new(Ipv4Addr::new(228, 10, 10, 90), 9982).validate().unwrap();
        ReliableMulticastConfig::new(Ipv4Addr::new(228, 10, 10, 91), 9983).validate().unwrap();
        SerialConfig::default_serial("/dev/ttyUSB0").validate().unwrap();
    }

    #[test]
    fn test_channel_defaults() {
        let config = ChannelConfig::default_tcp();
        assert_eq!(config.burp_time, Duration::from_secs(5));
        assert_eq!(config.connect_retry_delay, Duration::from_secs(20));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.watchdog_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.send_queue_capacity, 20);
        assert_eq!(config.max_message_size, 0x100000);
        assert_eq!(config.receive_buffer_size, 0x15554);
    }

    #[rstest]
    #[case::zero_capacity(|c: &mut ChannelConfig| c.send_queue_capacity = 0)]
    #[case::low_water_too_high(|c: &mut ChannelConfig| c.low_water = 20)]
    #[case::zero_burp(|c: &mut ChannelConfig| c.burp_time = Duration::ZERO)]
    #[case::zero_heartbeat(|c: &mut ChannelConfig| c.heartbeat_interval = Duration::ZERO)]
    #[case::tiny_buffer(|c: &mut ChannelConfig| c.receive_buffer_size = 10)]
    fn test_invalid_channel_config(#[case] tweak: fn(&mut ChannelConfig)) {
        let mut config = ChannelConfig::default_tcp();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_interval_ignored_when_disabled() {
        let mut config = ChannelConfig::default_tcp();
        config.heartbeat_enabled = false;
        config.heartbeat_interval = Duration::ZERO;
        config.validate().unwrap();
    }

    #[test]
    fn test_multicast_requires_multicast_group() {
        assert!(MulticastConfig::new(Ipv4Addr::new(10, 0, 0, 1), 9982).validate().is_err());
    }

    #[rstest]
    #[case::no_radios(|c: &mut SerialConfig| c.radios_in_group = 0)]
    #[case::too_many_radios(|c: &mut SerialConfig| c.radios_in_group = 17)]
    #[case::slot_out_of_range(|c: &mut SerialConfig| c.slot_number = 16)]
    #[case::transmit_longer_than_slot(|c: &mut SerialConfig| c.transmit_duration = Duration::from_secs(1))]
    #[case::too_many_packets(|c: &mut SerialConfig| c.retransmitter.max_packets_per_slot = 8)]
    fn test_invalid_serial_config(#[case] tweak: fn(&mut SerialConfig)) {
        let mut config = SerialConfig::default_serial("/dev/ttyUSB0");
        tweak(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssl_server_name() {
        let mut config = SslConfig::new("gateway", 33290, "ca.pem");
        assert_eq!(config.effective_server_name(), "gateway");
        config.server_name = Some("gateway.example.org".to_string());
        assert_eq!(config.effective_server_name(), "gateway.example.org");
    }
}
