//! The network transports. Stream transports (TCP client and server, SSL) share the stream
//!  sender and receiver roles, datagram transports (multicast, reliable multicast) carry one
//!  frame per datagram.

pub mod datagram;
pub mod multicast;
pub mod reliable_multicast;
pub mod ssl;
pub mod tcp_client;
pub mod tcp_server;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::connector::Connection;
use crate::channel::core::ChannelCore;
use crate::channel::stream_link::{run_stream_receiver, run_stream_sender};

/// Spawns the sender and receiver roles for an established byte stream
pub fn stream_connection<S>(core: &Arc<ChannelCore>, description: String, stream: S) -> Connection
where S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut connection = Connection::new(description);
    connection.spawn("sender", core.name(), run_stream_sender(core.clone(), writer));
    connection.spawn("receiver", core.name(), run_stream_receiver(core.clone(), reader));
    connection
}
