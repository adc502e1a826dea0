use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::channel::core::{ChannelCore, InFlight};
use crate::channel::state::SubState;
use crate::wire::codec::{decode_datagram, serialize, FULL_HEADER_LEN};
use crate::wire::message::{DisposalState, Message, Version};

/// the largest UDP payload
pub const MAX_DATAGRAM: usize = 65_507;

/// Serializes a message for a datagram transport, failing for messages that can not be sent
pub fn datagram_frame(core: &ChannelCore, message: &Message) -> anyhow::Result<Bytes> {
    let max_size = core.config.max_message_size.min(MAX_DATAGRAM - FULL_HEADER_LEN);
    if message.size() > max_size {
        anyhow::bail!("message of {} bytes exceeds the maximum of {}", message.size(), max_size);
    }
    serialize(message, Version::Full, 0)
}

/// Decodes a single frame and delivers it. Corrupt frames are counted and dropped.
pub async fn deliver_frame(core: &ChannelCore, frame: &[u8]) {
    let message = match decode_datagram(frame) {
        Ok(m) if m.has_valid_checksum() => m,
        Ok(_) => {
            debug!("payload checksum mismatch - dropping datagram");
            core.stats.record_corrupt(1);
            return;
        }
        Err(e) => {
            debug!("dropping datagram: {}", e);
            core.stats.record_corrupt(1);
            return;
        }
    };

    core.state.set_receiver(SubState::Deliver);
    if !core.deliver_message(message).await {
        debug!("delivered message was not accepted");
    }
}

/// Takes messages from the queue and sends each as one datagram to `target`
pub async fn run_datagram_sender(core: Arc<ChannelCore>, socket: Arc<UdpSocket>, target: SocketAddr) {
    debug!("datagram sender started, sending to {}", target);
    loop {
        core.state.set_sender(SubState::Taking);
        let message = core.take().await;
        let in_flight = InFlight::new(core.name(), message);
        core.state.set_sender(SubState::Sending);

        let frame = match in_flight.message().map(|m| datagram_frame(&core, m)) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("discarding message: {}", e);
                in_flight.fail(DisposalState::Bad);
                continue;
            }
            None => continue,
        };

        match socket.send_to(&frame, target).await {
            Ok(_) => {
                trace!("sent datagram of {} bytes", frame.len());
                if let Some(message) = in_flight.finish() {
                    core.frame_sent(&message, frame.len());
                }
            }
            Err(e) => {
                warn!("send failed: {}", e);
                in_flight.fail(DisposalState::Rejected);
                core.state.set_sender(SubState::Interrupted);
                core.socket_operation_failed();
                return;
            }
        }
    }
}

/// Receives datagrams, dropping those sent from `local` addresses on our own port
pub async fn run_datagram_receiver(core: Arc<ChannelCore>, socket: Arc<UdpSocket>, local: Vec<IpAddr>) {
    debug!("datagram receiver started");
    let own_port = socket.local_addr().map(|a| a.port()).ok();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        core.state.set_receiver(SubState::Start);
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("receive failed: {}", e);
                break;
            }
        };
        core.stats.record_bytes_read(len);

        if Some(from.port()) == own_port && local.contains(&from.ip()) {
            trace!("dropping own datagram from {}", from);
            continue;
        }
        trace!("received datagram of {} bytes from {}", len, from);
        deliver_frame(&core, &buf[..len]).await;
    }

    core.state.set_receiver(SubState::Interrupted);
    core.socket_operation_failed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use mockall::predicate::eq;
    use crate::channel::manager::OpenSecurityObjectFactory;
    use crate::channel::state::ConnState;
    use crate::config::ChannelConfig;
    use crate::test_util::RecordingManager;
    use crate::wire::message::MockDisposalHandler;

    async fn connected_core(manager: Arc<RecordingManager>) -> Arc<ChannelCore> {
        let core = ChannelCore::new("udp", ChannelConfig::default_datagram(), manager, Arc::new(OpenSecurityObjectFactory)).unwrap();
        core.state.set(ConnState::Connected);
        core.mark_connected();
        core.install_security_object();
        core.start_authorization().await.unwrap();
        core
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_one_frame_per_datagram() {
        let sending = connected_core(Arc::new(RecordingManager::new())).await;
        let manager = Arc::new(RecordingManager::new());
        let receiving = connected_core(manager.clone()).await;

        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let sender = tokio::spawn(run_datagram_sender(sending.clone(), a, b.local_addr().unwrap()));
        let receiver = tokio::spawn(run_datagram_receiver(receiving.clone(), b, Vec::new()));

        let mut handler = MockDisposalHandler::new();
        handler.expect_ack()
            .with(eq("udp"), eq(DisposalState::Sent))
            .times(2)
            .return_const(());
        let handler = Arc::new(handler);
        for payload in [b"first".to_vec(), b"second".to_vec()] {
            let m = Message::builder().payload(payload).handler(handler.clone()).build().unwrap();
            sending.send_request(m).await;
        }

        wait_for(|| manager.delivered().len() == 2).await;
        let payloads: Vec<_> = manager.delivered().iter().map(|m| m.payload().clone()).collect();
        assert!(payloads.contains(&Bytes::from_static(b"first")));
        assert!(payloads.contains(&Bytes::from_static(b"second")));
        assert_eq!(sending.stats.messages_sent(), 2);

        sender.abort();
        receiver.abort();
    }

    #[tokio::test]
    async fn test_own_and_corrupt_datagrams_are_dropped() {
        let manager = Arc::new(RecordingManager::new());
        let core = connected_core(manager.clone()).await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let receiver = tokio::spawn(run_datagram_receiver(core.clone(), socket.clone(), vec![addr.ip()]));

        let frame = serialize(&Message::builder().payload(vec![1, 2, 3]).build().unwrap(), Version::Full, 0).unwrap();
        // looped back from our own socket
        socket.send_to(&frame, addr).await.unwrap();

        let other = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        other.send_to(b"not a frame", addr).await.unwrap();
        let mut corrupt = frame.to_vec();
        corrupt[FULL_HEADER_LEN] ^= 0xff;
        other.send_to(&corrupt, addr).await.unwrap();
        other.send_to(&frame, addr).await.unwrap();

        wait_for(|| !manager.delivered().is_empty()).await;
        assert_eq!(manager.delivered().len(), 1);
        assert_eq!(core.stats.corrupt_messages(), 2);
        receiver.abort();
    }

    #[tokio::test]
    async fn test_oversized_message_is_bad() {
        let core = connected_core(Arc::new(RecordingManager::new())).await;
        let m = Message::builder().payload(vec![0; MAX_DATAGRAM]).build().unwrap();
        assert!(datagram_frame(&core, &m).is_err());
    }
}
