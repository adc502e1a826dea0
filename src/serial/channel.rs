use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::connector::{spawn_connector, Connect, Connection};
use crate::channel::core::{ChannelCore, InFlight};
use crate::channel::manager::{ChannelManager, OpenSecurityObjectFactory};
use crate::channel::send_queue::SendOutcome;
use crate::channel::state::{ChannelStatus, SubState};
use crate::channel::stats::spawn_bps_ticker;
use crate::channel::{Channel, BPS_INTERVAL};
use crate::config::SerialConfig;
use crate::serial::clock::{ClockOffset, SystemTimeSource, TimeSource};
use crate::serial::device::{DeviceOpener, FileDeviceOpener};
use crate::serial::fragmenter::Fragmenter;
use crate::serial::retransmitter::Retransmitter;
use crate::serial::schedule::{SlotPosition, SlotSchedule};
use crate::wire::codec::{extract_header, serialize, MAGIC, TERSE_HEADER_LEN};
use crate::wire::message::{DisposalState, Message, PacketType, Version};

/// The radio settings that can be changed while the channel is running
pub struct SerialSettings {
    slot_number: AtomicU32,
    radios_in_group: AtomicU32,
    slot_duration_ms: AtomicU64,
    transmit_duration_ms: AtomicU64,
    sender_enabled: AtomicBool,
    max_message_size: AtomicUsize,
    baud_rate: u32,
    max_slots: usize,
}
impl SerialSettings {
    fn new(config: &SerialConfig) -> SerialSettings {
        SerialSettings {
            slot_number: AtomicU32::new(config.slot_number),
            radios_in_group: AtomicU32::new(config.radios_in_group),
            slot_duration_ms: AtomicU64::new(config.slot_duration.as_millis() as u64),
            transmit_duration_ms: AtomicU64::new(config.transmit_duration.as_millis() as u64),
            sender_enabled: AtomicBool::new(config.sender_enabled),
            max_message_size: AtomicUsize::new(config.channel.max_message_size),
            baud_rate: config.baud_rate,
            max_slots: config.retransmitter.max_slots,
        }
    }

    pub fn slot_number(&self) -> u32 {
        self.slot_number.load(Ordering::Acquire)
    }

    pub fn sender_enabled(&self) -> bool {
        self.sender_enabled.load(Ordering::Acquire)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size.load(Ordering::Acquire)
    }

    /// the schedule for the current settings
    pub fn schedule(&self) -> SlotSchedule {
        SlotSchedule::new(
            self.slot_number(),
            self.radios_in_group.load(Ordering::Acquire),
            Duration::from_millis(self.slot_duration_ms.load(Ordering::Acquire)),
            Duration::from_millis(self.transmit_duration_ms.load(Ordering::Acquire)),
            self.baud_rate,
        )
    }
}

#[derive(Default)]
struct ReceiverDiagnostics {
    bytes_since_magic: AtomicU64,
    /// 0 if nothing was read yet
    last_byte_read_millis: AtomicI64,
}

/// State that outlives individual connections
struct SerialShared {
    name: Arc<str>,
    settings: SerialSettings,
    diagnostics: ReceiverDiagnostics,
    clock: ClockOffset,
    time: Arc<dyn TimeSource>,
    device: Mutex<PathBuf>,
    satcom: bool,
    /// the fragmenter of the current connection, if any
    fragmenter: Mutex<Weak<Fragmenter>>,
}
impl SerialShared {
    fn gps_now(&self) -> i64 {
        self.clock.gps_now(self.time.as_ref())
    }

    async fn sleep_until_gps(&self, target: i64) {
        let now = self.gps_now();
        if target > now {
            tokio::time::sleep(Duration::from_millis((target - now) as u64)).await;
        }
    }

    fn byte_read(&self) {
        self.diagnostics.bytes_since_magic.fetch_add(1, Ordering::Relaxed);
        self.diagnostics.last_byte_read_millis.store(self.time.now_millis(), Ordering::Relaxed);
    }
}

/// what a connection's tasks share
#[derive(Clone)]
struct SerialLink {
    core: Arc<ChannelCore>,
    shared: Arc<SerialShared>,
    max_receive_payload: usize,
    reserve_for_ack: usize,
    default_hop_count: u8,
}

/// the link layer protocol a connection runs on top of the framing
#[derive(Clone)]
enum Protocol {
    Tdma(Arc<Retransmitter>),
    Satcom(Arc<Fragmenter>),
}

struct SerialTransport {
    shared: Arc<SerialShared>,
    opener: Arc<dyn DeviceOpener>,
    config: SerialConfig,
}

#[async_trait]
impl Connect for SerialTransport {
    async fn connect(&self, core: &Arc<ChannelCore>) -> anyhow::Result<Connection> {
        let path = self.shared.device.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let device = self.opener.open(&path).await?;
        info!("opened serial device {:?}", path);

        core.stats.reset();
        self.shared.diagnostics.bytes_since_magic.store(0, Ordering::Relaxed);

        let (reader, writer) = tokio::io::split(device);
        let slot_number = self.shared.settings.slot_number();
        let link = SerialLink {
            core: core.clone(),
            shared: self.shared.clone(),
            max_receive_payload: self.config.max_receive_payload,
            reserve_for_ack: self.config.reserve_for_ack,
            default_hop_count: self.config.retransmitter.default_hop_count,
        };

        let mut connection = Connection::new(path.display().to_string());
        if self.shared.satcom {
            let mut config = self.config.fragmenter.clone();
            if config.operator_id.is_empty() {
                config.operator_id = core.manager().operator_id();
            }
            let fragmenter = Arc::new(Fragmenter::new(core.name(), slot_number, config, core.clone())?);
            *self.shared.fragmenter.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&fragmenter);

            connection.spawn("sender", core.name(), run_satcom_sender(link.clone(), writer));
            connection.spawn("receiver", core.name(), run_serial_receiver(link, Protocol::Satcom(fragmenter.clone()), reader));
            fragmenter.start_sending();
        }
        else {
            let retransmitter = Arc::new(Retransmitter::new(slot_number as usize, self.config.retransmitter.clone())?);
            connection.spawn("sender", core.name(), run_tdma_sender(link.clone(), retransmitter.clone(), writer));
            connection.spawn("receiver", core.name(), run_serial_receiver(link, Protocol::Tdma(retransmitter), reader));
        }
        Ok(connection)
    }

    fn needs_network_link(&self) -> bool {
        false
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where W: AsyncWrite + Unpin + Send,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// The transmissions of one slot: data messages while they fit, then resends, then the ack
struct SlotWriter<'a> {
    link: &'a SerialLink,
    retransmitter: &'a Retransmitter,
    schedule: SlotSchedule,
    hyperperiod: u16,
    slot_end: i64,
    index: u8,
    consumed_ms: f64,
}

impl SlotWriter<'_> {
    fn bytes_that_fit(&self) -> i64 {
        self.schedule.bytes_that_fit(self.slot_end, self.link.shared.gps_now(), self.consumed_ms)
            - self.link.reserve_for_ack as i64
    }

    async fn fill<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where W: AsyncWrite + Unpin + Send,
    {
        let core = &self.link.core;
        let max_size = self.schedule.max_send_size()
            .min(self.link.shared.settings.max_message_size() + TERSE_HEADER_LEN);

        loop {
            // messages too big for any slot are taken as well, to be discarded
            let fits = self.bytes_that_fit();
            let taken = core.try_take_if(|m| {
                let frame_len = m.size() + TERSE_HEADER_LEN;
                frame_len > max_size || frame_len as i64 <= fits
            });
            let Some(mut message) = taken else {
                trace!("no further message fits into the rest of the slot");
                break;
            };
            if message.size() + TERSE_HEADER_LEN > max_size {
                warn!("discarding message of {} bytes, at most {} fit into a slot", message.size(), max_size - TERSE_HEADER_LEN);
                message.ack(core.name(), DisposalState::Bad);
                continue;
            }

            message.annotations.packet_type = PacketType::Normal;
            message.annotations.hop_count = self.link.default_hop_count;
            self.send(writer, message).await?;
        }

        self.resend_and_ack(writer).await
    }

    async fn resend_and_ack<W>(&mut self, writer: &mut W) -> std::io::Result<()>
    where W: AsyncWrite + Unpin + Send,
    {
        let mut available = self.bytes_that_fit();
        while available > 0 {
            let Some(packet) = self.retransmitter.create_resend_packet(available) else {
                break;
            };
            available -= (packet.size() + TERSE_HEADER_LEN) as i64;
            self.send(writer, packet).await?;
        }

        if let Some(ack) = self.retransmitter.create_ack_packet(self.hyperperiod) {
            self.send(writer, ack).await?;
        }
        Ok(())
    }

    async fn send<W>(&mut self, writer: &mut W, mut message: Message) -> std::io::Result<()>
    where W: AsyncWrite + Unpin + Send,
    {
        let core = &self.link.core;
        let slot = self.schedule.slot_number as u8;

        message.annotations.clock_offset_millis = self.link.shared.clock.delta_millis();
        message.annotations.hyperperiod = Some(self.hyperperiod);
        message.annotations.slot_id = Some(slot);
        message.annotations.index_in_slot = Some(self.index);

        let frame = match serialize(&message, Version::Terse, slot) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unable to serialize message: {}", e);
                message.ack(core.name(), DisposalState::Bad);
                return Ok(());
            }
        };

        core.state.set_sender(SubState::Sending);
        let sender_enabled = self.link.shared.settings.sender_enabled();
        if sender_enabled {
            if let Err(e) = write_frame(writer, &frame).await {
                message.ack(core.name(), DisposalState::Rejected);
                return Err(e);
            }
        }
        trace!("{} {:?} frame of {} bytes, index {}", if sender_enabled { "sent" } else { "skipped" },
            message.annotations.packet_type, frame.len(), self.index);

        self.retransmitter.sending_packet(&message, self.hyperperiod, slot, self.index);
        self.index = self.index.wrapping_add(1);
        self.consumed_ms += self.schedule.transmit_time_ms(frame.len());

        if sender_enabled {
            core.frame_sent(&message, frame.len());
        }
        else {
            message.ack(core.name(), DisposalState::Sent);
        }
        Ok(())
    }
}

/// Sends in this node's slot of every cycle, sleeping in between
async fn run_tdma_sender<W>(link: SerialLink, retransmitter: Arc<Retransmitter>, mut writer: W)
where W: AsyncWrite + Unpin + Send,
{
    debug!("TDMA sender started");
    loop {
        let schedule = link.shared.settings.schedule();
        let (hyperperiod, slot_begin, slot_end) = match schedule.position(link.shared.gps_now()) {
            SlotPosition::TooEarly { wake_at } | SlotPosition::TooLate { wake_at } => {
                link.shared.sleep_until_gps(wake_at).await;
                continue;
            }
            SlotPosition::InSlot { hyperperiod, slot_begin, slot_end } => (hyperperiod, slot_begin, slot_end),
        };

        link.core.state.set_sender(SubState::Taking);
        retransmitter.switch_hyperperiods_if_needed(hyperperiod);

        let mut slot = SlotWriter {
            link: &link,
            retransmitter: &retransmitter,
            schedule,
            hyperperiod,
            slot_end,
            index: 0,
            consumed_ms: 0.0,
        };
        if let Err(e) = slot.fill(&mut writer).await {
            warn!("write failed: {}", e);
            link.core.state.set_sender(SubState::Interrupted);
            link.core.socket_operation_failed();
            return;
        }
        trace!("slot of hyperperiod {} done, {} frames", hyperperiod, slot.index);

        link.core.state.set_sender(SubState::Taking);
        link.shared.sleep_until_gps(slot_begin + schedule.cycle_ms()).await;
    }
}

/// In SATCOM mode the fragmenter decides what goes out, and everything in the queue is sent
///  right away
async fn run_satcom_sender<W>(link: SerialLink, mut writer: W)
where W: AsyncWrite + Unpin + Send,
{
    debug!("SATCOM sender started");
    let core = &link.core;
    loop {
        core.state.set_sender(SubState::Taking);
        let message = core.take().await;
        let in_flight = InFlight::new(core.name(), message);
        core.state.set_sender(SubState::Sending);

        let max_size = link.shared.settings.max_message_size();
        let frame = match in_flight.message().map(|m| satcom_frame(m, max_size)) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("discarding message: {}", e);
                in_flight.fail(DisposalState::Bad);
                continue;
            }
            None => continue,
        };

        if !link.shared.settings.sender_enabled() {
            if let Some(message) = in_flight.finish() {
                message.ack(core.name(), DisposalState::Sent);
            }
            continue;
        }
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {
                if let Some(message) = in_flight.finish() {
                    core.frame_sent(&message, frame.len());
                }
            }
            Err(e) => {
                warn!("write failed: {}", e);
                in_flight.fail(DisposalState::Rejected);
                core.state.set_sender(SubState::Interrupted);
                core.socket_operation_failed();
                return;
            }
        }
    }
}

fn satcom_frame(message: &Message, max_size: usize) -> anyhow::Result<Bytes> {
    if message.size() > max_size {
        anyhow::bail!("{} bytes exceed the maximum of {}", message.size(), max_size);
    }
    serialize(message, Version::Terse, 0)
}

async fn run_serial_receiver<R>(link: SerialLink, protocol: Protocol, reader: R)
where R: AsyncRead + Unpin + Send,
{
    debug!("serial receiver started");
    let mut reader = BufReader::new(reader);
    match receive_frames(&link, &protocol, &mut reader).await {
        Ok(()) => info!("serial device closed"),
        Err(e) => warn!("read failed: {}", e),
    }
    link.core.state.set_receiver(SubState::Interrupted);
    link.core.socket_operation_failed();
}

async fn read_byte<R>(link: &SerialLink, reader: &mut R) -> std::io::Result<u8>
where R: AsyncRead + Unpin + Send,
{
    let b = reader.read_u8().await?;
    link.shared.byte_read();
    link.core.stats.record_bytes_read(1);
    Ok(b)
}

async fn read_bytes<R>(link: &SerialLink, reader: &mut R, buf: &mut [u8]) -> std::io::Result<()>
where R: AsyncRead + Unpin + Send,
{
    reader.read_exact(buf).await?;
    link.shared.diagnostics.bytes_since_magic.fetch_add(buf.len() as u64, Ordering::Relaxed);
    link.shared.diagnostics.last_byte_read_millis.store(link.shared.time.now_millis(), Ordering::Relaxed);
    link.core.stats.record_bytes_read(buf.len());
    Ok(())
}

/// the largest payload a terse header can announce, bounding what is drained for oversized frames
const MAX_DRAIN: usize = u16::MAX as usize;

/// The received byte stream. Bytes that were read as part of a corrupt header are scanned for
///  the magic sequence again before anything new is read.
struct ByteSource<'a, R> {
    link: &'a SerialLink,
    reader: &'a mut R,
    rescan: VecDeque<u8>,
}

impl<R: AsyncRead + Unpin + Send> ByteSource<'_, R> {
    async fn next_byte(&mut self) -> std::io::Result<u8> {
        match self.rescan.pop_front() {
            Some(b) => {
                self.link.shared.diagnostics.bytes_since_magic.fetch_add(1, Ordering::Relaxed);
                Ok(b)
            }
            None => read_byte(self.link, self.reader).await,
        }
    }

    async fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let from_rescan = self.rescan.len().min(buf.len());
        for (dst, b) in buf[..from_rescan].iter_mut().zip(self.rescan.drain(..from_rescan)) {
            *dst = b;
        }
        self.link.shared.diagnostics.bytes_since_magic.fetch_add(from_rescan as u64, Ordering::Relaxed);
        if from_rescan < buf.len() {
            read_bytes(self.link, self.reader, &mut buf[from_rescan..]).await?;
        }
        Ok(())
    }

    async fn skip(&mut self, mut len: usize) -> std::io::Result<()> {
        let mut chunk = [0u8; 256];
        while len > 0 {
            let n = len.min(chunk.len());
            self.fill(&mut chunk[..n]).await?;
            len -= n;
        }
        Ok(())
    }

    /// Reads byte by byte until the magic sequence went by
    async fn hunt_magic(&mut self) -> std::io::Result<()> {
        let mut matched = 0;
        while matched < MAGIC.len() {
            let b = self.next_byte().await?;
            matched = if b == MAGIC[matched] {
                matched + 1
            }
            else if b == MAGIC[0] {
                1
            }
            else {
                0
            };
        }
        Ok(())
    }
}

/// Returns `Ok` at end of stream
async fn receive_frames<R>(link: &SerialLink, protocol: &Protocol, reader: &mut R) -> std::io::Result<()>
where R: AsyncRead + Unpin + Send,
{
    let core = &link.core;
    let mut source = ByteSource { link, reader, rescan: VecDeque::new() };
    loop {
        core.state.set_receiver(SubState::Start);
        match source.hunt_magic().await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let schedule = link.shared.settings.schedule();
        let gps_now = link.shared.gps_now();
        let hyperperiod = schedule.hyperperiod(gps_now);
        link.shared.diagnostics.bytes_since_magic.store(0, Ordering::Relaxed);

        let mut raw = [0u8; TERSE_HEADER_LEN];
        raw[..MAGIC.len()].copy_from_slice(&MAGIC);
        source.fill(&mut raw[MAGIC.len()..]).await?;

        let mut header = BytesMut::from(&raw[..]);
        let mut corrupt_headers = 0;
        let Some(partial) = extract_header(&mut header, &mut corrupt_headers) else {
            debug!("corrupt terse header");
            core.stats.record_corrupt(corrupt_headers.max(1));
            // a frame may start inside the bytes after the bogus magic sequence
            source.rescan.extend(&raw[1..]);
            continue;
        };
        if partial.size > link.max_receive_payload {
            warn!("discarding frame with a payload of {} bytes, maximum is {}", partial.size, link.max_receive_payload);
            core.stats.record_corrupt(1);
            source.skip(partial.size.min(MAX_DRAIN)).await?;
            continue;
        }

        let mut payload = vec![0u8; partial.size];
        source.fill(&mut payload).await?;
        let message = match partial.build(Bytes::from(payload)) {
            Ok(m) if m.has_valid_checksum() => m,
            Ok(_) => {
                debug!("payload checksum mismatch");
                core.stats.record_corrupt(1);
                continue;
            }
            Err(e) => {
                debug!("unable to build message: {}", e);
                core.stats.record_corrupt(1);
                continue;
            }
        };
        trace!("received {:?} frame during slot {} of hyperperiod {}", message.annotations.packet_type,
            schedule.current_slot(gps_now), hyperperiod);

        core.state.set_receiver(SubState::Deliver);
        let delivered = match protocol {
            Protocol::Tdma(retransmitter) => retransmitter.process_received_message(message, hyperperiod),
            Protocol::Satcom(_) if !core.is_authorized() => vec![message],
            Protocol::Satcom(fragmenter) => match fragmenter.deliver(message).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    debug!("dropping SATCOM packet: {}", e);
                    core.stats.record_corrupt(1);
                    Vec::new()
                }
            },
        };
        for message in delivered {
            if !core.deliver_message(message).await {
                debug!("delivered message was not accepted");
            }
        }
    }
}

/// A radio link over a serial device: either TDMA, where every radio of a group sends in its own
///  time slot with acks, resends and relaying on top, or SATCOM token passing with fragmentation.
///
/// Unlike network channels, the serial channel never waits for a network link. `link_up` and
///  `link_down` refer to the serial device instead: a different device replaces the current one.
pub struct SerialChannel {
    core: Arc<ChannelCore>,
    shared: Arc<SerialShared>,
    connector: JoinHandle<()>,
    bps_ticker: JoinHandle<()>,
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        debug!(channel = %self.core.name(), "stopping channel");
        self.connector.abort();
        self.bps_ticker.abort();
    }
}

impl SerialChannel {
    /// a channel on the configured device node, timed by the system clock
    pub fn open(name: &str, config: SerialConfig, manager: Arc<dyn ChannelManager>) -> anyhow::Result<SerialChannel> {
        SerialChannel::new(name, config, manager, Arc::new(FileDeviceOpener), Arc::new(SystemTimeSource))
    }

    pub fn new(
        name: &str,
        config: SerialConfig,
        manager: Arc<dyn ChannelManager>,
        opener: Arc<dyn DeviceOpener>,
        time: Arc<dyn TimeSource>,
    ) -> anyhow::Result<SerialChannel> {
        config.validate()?;

        let mut channel_config = config.channel.clone();
        channel_config.connect_retry_delay = config.connect_retry_wait;
        let core = ChannelCore::new(name, channel_config, manager, Arc::new(OpenSecurityObjectFactory))?;

        let shared = Arc::new(SerialShared {
            name: name.into(),
            settings: SerialSettings::new(&config),
            diagnostics: ReceiverDiagnostics::default(),
            clock: ClockOffset::default(),
            time,
            device: Mutex::new(config.device.clone()),
            satcom: config.satcom_enabled,
            fragmenter: Mutex::new(Weak::new()),
        });

        info!(channel = %name, "starting serial channel on {:?}, slot {} of {}{}", config.device, config.slot_number,
            config.radios_in_group, if config.satcom_enabled { ", SATCOM" } else { "" });
        let transport = SerialTransport {
            shared: shared.clone(),
            opener,
            config,
        };
        let connector = spawn_connector(core.clone(), transport);
        let bps_ticker = spawn_bps_ticker(core.stats.clone(), BPS_INTERVAL);

        Ok(SerialChannel {
            core,
            shared,
            connector,
            bps_ticker,
        })
    }

    pub fn core(&self) -> &Arc<ChannelCore> {
        &self.core
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.shared.settings
    }

    /// Changes this radio's slot. The retransmitter's bookkeeping is per slot, so this starts a
    ///  new connection.
    pub fn set_slot_number(&self, slot_number: u32) {
        if slot_number as usize >= self.shared.settings.max_slots {
            warn!(channel = %self.shared.name, "ignoring slot number {}, there are only {} slots", slot_number, self.shared.settings.max_slots);
            return;
        }
        info!(channel = %self.shared.name, "slot number set to {}", slot_number);
        self.shared.settings.slot_number.store(slot_number, Ordering::Release);
        self.core.state.reset();
    }

    pub fn set_radios_in_group(&self, radios: u32) {
        if radios == 0 || radios as usize > self.shared.settings.max_slots {
            warn!(channel = %self.shared.name, "ignoring invalid number of radios {}", radios);
            return;
        }
        info!(channel = %self.shared.name, "radios in group set to {}", radios);
        self.shared.settings.radios_in_group.store(radios, Ordering::Release);
    }

    pub fn set_slot_duration(&self, duration: Duration) {
        info!(channel = %self.shared.name, "slot duration set to {:?}", duration);
        self.shared.settings.slot_duration_ms.store(duration.as_millis() as u64, Ordering::Release);
    }

    pub fn set_transmit_duration(&self, duration: Duration) {
        info!(channel = %self.shared.name, "transmit duration set to {:?}", duration);
        self.shared.settings.transmit_duration_ms.store(duration.as_millis() as u64, Ordering::Release);
    }

    pub fn set_sender_enabled(&self, enabled: bool) {
        info!(channel = %self.shared.name, "sender {}", if enabled { "enabled" } else { "disabled" });
        self.shared.settings.sender_enabled.store(enabled, Ordering::Release);
    }

    /// the maximum message size in megabytes, takes effect with a new connection
    pub fn set_max_message_size(&self, megabytes: usize) {
        info!(channel = %self.shared.name, "max message size set to {} MB", megabytes);
        self.shared.settings.max_message_size.store(megabytes * 0x100000, Ordering::Release);
        self.core.state.reset();
    }

    pub fn received_corrupt_packet(&self) {
        self.core.stats.record_corrupt(1);
    }

    /// a new measurement of the offset between system time and GPS time
    pub fn add_clock_offset_sample(&self, delta_millis: i64) {
        self.shared.clock.add_sample(delta_millis);
    }

    pub fn system_time_changed(&self) {
        self.shared.clock.system_time_changed();
    }

    pub fn bytes_since_magic(&self) -> u64 {
        self.shared.diagnostics.bytes_since_magic.load(Ordering::Relaxed)
    }

    /// `None` if nothing was read since the channel started
    pub fn seconds_since_byte_read(&self) -> Option<i64> {
        match self.shared.diagnostics.last_byte_read_millis.load(Ordering::Relaxed) {
            0 => None,
            last => Some((self.shared.time.now_millis() - last) / 1000),
        }
    }

    fn is_current_device(&self, device: &str) -> bool {
        self.shared.device.lock().unwrap_or_else(PoisonError::into_inner).as_path() == Path::new(device)
    }
}

#[async_trait]
impl Channel for SerialChannel {
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

    fn link_up(&self, device: &str) {
        if self.is_current_device(device) {
            debug!(channel = %self.core.name(), "device {} is up", device);
            self.core.state.poke();
            return;
        }
        info!(channel = %self.core.name(), "switching to device {}", device);
        *self.shared.device.lock().unwrap_or_else(PoisonError::into_inner) = PathBuf::from(device);
        self.core.state.reset();
    }

    fn link_down(&self, device: &str) {
        if self.is_current_device(device) {
            info!(channel = %self.core.name(), "device {} went away", device);
            self.core.state.reset();
        }
    }

    fn is_connected(&self) -> bool {
        self.core.state.get().is_connected()
    }

    fn is_busy(&self) -> bool {
        self.core.queue.is_busy()
    }

    async fn send_request(&self, message: Message) -> SendOutcome {
        if !self.shared.satcom {
            return self.core.send_request(message).await;
        }
        if !self.core.state.get().is_connected() {
            return SendOutcome::Rejected(message);
        }
        let fragmenter = self.shared.fragmenter.lock().unwrap_or_else(PoisonError::into_inner).upgrade();
        match fragmenter {
            Some(fragmenter) => fragmenter.put_from_distributor(message),
            None => SendOutcome::Rejected(message),
        }
    }

    fn state(&self) -> ChannelStatus {
        self.core.state.status()
    }

    fn send_receive_stats(&self) -> String {
        self.core.stats.send_receive_stats_with_corrupt()
    }

    fn send_bit_stats(&self) -> String {
        self.core.stats.send_bit_stats()
    }

    fn receive_bit_stats(&self) -> String {
        self.core.stats.receive_bit_stats()
    }
}
