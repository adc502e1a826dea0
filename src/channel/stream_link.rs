use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::channel::core::{ChannelCore, InFlight};
use crate::channel::state::SubState;
use crate::wire::codec::serialize;
use crate::wire::message::{DisposalState, Version};
use crate::wire::priority::GatewayError;
use crate::wire::stream_decoder::StreamDecoder;

/// The sender role of byte stream channels (TCP, SSL): takes messages from the queue and writes
///  them as full frames until a write fails.
pub async fn run_stream_sender<W>(core: Arc<ChannelCore>, mut writer: W)
where W: AsyncWrite + Unpin + Send,
{
    debug!("sender started");
    loop {
        core.state.set_sender(SubState::Taking);
        let message = core.take().await;
        let in_flight = InFlight::new(core.name(), message);
        core.state.set_sender(SubState::Sending);

        let Some(message) = in_flight.message() else { continue; };
        if message.size() > core.config.max_message_size {
            warn!("discarding message of {} bytes, maximum is {}", message.size(), core.config.max_message_size);
            in_flight.fail(DisposalState::Bad);
            continue;
        }

        let buf = match serialize(message, Version::Full, 0) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("unable to serialize message: {}", e);
                in_flight.fail(DisposalState::Bad);
                continue;
            }
        };

        let write_result = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        match write_result {
            Ok(()) => {
                trace!("sent {} bytes", buf.len());
                if let Some(message) = in_flight.finish() {
                    core.frame_sent(&message, buf.len());
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

/// The receiver role of byte stream channels: reads into a [StreamDecoder] and delivers every
///  complete frame. End of stream counts as a failure of the connection.
pub async fn run_stream_receiver<R>(core: Arc<ChannelCore>, mut reader: R)
where R: AsyncRead + Unpin + Send,
{
    debug!("receiver started");
    let mut decoder = StreamDecoder::new(core.config.receive_buffer_size, core.config.max_message_size);

    loop {
        core.state.set_receiver(SubState::Start);
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => {
                info!("connection closed by peer");
                break;
            }
            Ok(n) => {
                trace!("read {} bytes", n);
                core.stats.record_bytes_read(n);
            }
            Err(e) => {
                warn!("read failed: {}", e);
                break;
            }
        }

        while let Some(message) = decoder.next_message() {
            if message.gateway_error() != GatewayError::NoError {
                warn!("peer reported {:?} - disconnecting", message.gateway_error());
                core.state.set_receiver(SubState::Interrupted);
                core.socket_operation_failed();
                return;
            }

            core.state.set_receiver(SubState::Deliver);
            if !core.deliver_message(message).await {
                debug!("delivered message was not accepted");
            }
        }

        let corrupt = decoder.take_corrupt_count();
        if corrupt > 0 {
            core.stats.record_corrupt(corrupt);
        }
    }

    core.state.set_receiver(SubState::Interrupted);
    core.socket_operation_failed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::runtime::Builder;
    use crate::channel::manager::OpenSecurityObjectFactory;
    use crate::channel::state::ConnState;
    use crate::config::ChannelConfig;
    use crate::test_util::RecordingManager;
    use crate::wire::message::{Message, MockDisposalHandler};
    use mockall::predicate::eq;

    async fn connected_core(manager: Arc<RecordingManager>) -> Arc<ChannelCore> {
        let core = ChannelCore::new("tcp", ChannelConfig::default_tcp(), manager, Arc::new(OpenSecurityObjectFactory)).unwrap();
        core.state.set(ConnState::Connected);
        core.mark_connected();
        core.install_security_object();
        core.start_authorization().await.unwrap();
        core
    }

    #[test]
    fn test_send_and_receive_over_duplex() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let sending_manager = Arc::new(RecordingManager::new());
            let receiving_manager = Arc::new(RecordingManager::new());
            let sending = connected_core(sending_manager).await;
            let receiving = connected_core(receiving_manager.clone()).await;

            let (a, b) = duplex(64);
            let sender = tokio::spawn(run_stream_sender(sending.clone(), a));
            let receiver = tokio::spawn(run_stream_receiver(receiving.clone(), b));

            let mut handler = MockDisposalHandler::new();
            handler.expect_ack()
                .with(eq("tcp"), eq(DisposalState::Sent))
                .times(2)
                .return_const(());
            let handler = Arc::new(handler);

            for payload in [vec![1u8; 100], vec![2u8; 3]] {
                let m = Message::builder().payload(payload).handler(handler.clone()).build().unwrap();
                assert!(matches!(sending.send_request(m).await, crate::channel::send_queue::SendOutcome::Queued));
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
            let delivered = receiving_manager.delivered();
            assert_eq!(delivered.len(), 2);
            assert_eq!(delivered[0].payload().as_ref(), &[1u8; 100]);
            assert_eq!(delivered[1].channel(), Some("tcp"));
            assert_eq!(sending.stats.messages_sent(), 2);
            assert_eq!(receiving.stats.messages_received(), 2);
            assert_eq!(receiving.stats.bytes_read(), sending.stats.bytes_sent());

            sender.abort();
            receiver.abort();
        });
    }

    #[test]
    fn test_end_of_stream_resets_channel() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let core = connected_core(Arc::new(RecordingManager::new())).await;
            let attempt = core.state.attempt();

            let (a, b) = duplex(64);
            drop(a);
            run_stream_receiver(core.clone(), b).await;

            assert_eq!(core.state.get(), ConnState::Stale);
            assert_eq!(core.state.attempt(), attempt + 1);
            assert!(!core.is_connected());
        });
    }

    #[test]
    fn test_write_failure_rejects_and_resets() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let core = connected_core(Arc::new(RecordingManager::new())).await;

            let mut handler = MockDisposalHandler::new();
            handler.expect_ack()
                .with(eq("tcp"), eq(DisposalState::Rejected))
                .times(1)
                .return_const(());
            let m = Message::builder().payload(vec![1]).handler(Arc::new(handler)).build().unwrap();
            core.send_request(m).await;

            let (a, b) = duplex(64);
            drop(b);
            run_stream_sender(core.clone(), a).await;

            assert_eq!(core.state.get(), ConnState::Stale);
        });
    }

    #[test]
    fn test_oversized_message_is_bad() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let manager = Arc::new(RecordingManager::new());
            let mut config = ChannelConfig::default_tcp();
            config.max_message_size = 10;
            let core = ChannelCore::new("tcp", config, manager, Arc::new(OpenSecurityObjectFactory)).unwrap();
            core.state.set(ConnState::Connected);
            core.install_security_object();
            core.start_authorization().await.unwrap();

            let mut handler = MockDisposalHandler::new();
            handler.expect_ack()
                .with(eq("tcp"), eq(DisposalState::Bad))
                .times(1)
                .return_const(());
            let m = Message::builder().payload(vec![0; 11]).handler(Arc::new(handler)).build().unwrap();
            core.send_request(m).await;

            let (a, _b) = duplex(64);
            let sender = tokio::spawn(run_stream_sender(core.clone(), a));
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(core.queue.dist_len(), 0);
            assert_eq!(core.stats.messages_sent(), 0);
            sender.abort();
        });
    }

    #[test]
    fn test_gateway_error_disconnects() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let core = connected_core(Arc::new(RecordingManager::new())).await;

            let (mut a, b) = duplex(64);
            let error_frame = Message::builder()
                .payload(Vec::new())
                .gateway_error(GatewayError::InvalidHeaderChecksum)
                .build()
                .unwrap();
            a.write_all(&serialize(&error_frame, Version::Full, 0).unwrap()).await.unwrap();

            run_stream_receiver(core.clone(), b).await;
            assert_eq!(core.state.get(), ConnState::Stale);
        });
    }
}
