//! Transport enum and backends.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and delivers fully framed messages: one
//! [`FlatBuffer`] in, one out, plus close/lifecycle. Backends never look
//! inside a message beyond what their framing needs.

use busard_flat::FlatBuffer;

use crate::TransportError;

#[derive(Clone, Debug)]
pub enum Transport {
    Mem(mem::MemTransport),
    #[cfg(feature = "tcp")]
    Tcp(tcp::TcpTransport),
    #[cfg(feature = "websocket")]
    WebSocket(websocket::WebSocketTransport),
    #[cfg(feature = "http")]
    Http(http::HttpClientTransport),
    #[cfg(feature = "udp")]
    Udp(udp::UdpTransport),
    #[cfg(feature = "shm")]
    Shm(shm::ShmTransport),
}

impl Transport {
    /// Queue one framed message for the peer.
    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        match self {
            Transport::Mem(t) => t.send_message(msg).await,
            #[cfg(feature = "tcp")]
            Transport::Tcp(t) => t.send_message(msg).await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.send_message(msg).await,
            #[cfg(feature = "http")]
            Transport::Http(t) => t.send_message(msg).await,
            #[cfg(feature = "udp")]
            Transport::Udp(t) => t.send_message(msg).await,
            #[cfg(feature = "shm")]
            Transport::Shm(t) => t.send_message(msg).await,
        }
    }

    /// Receive the next framed message from the peer.
    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        match self {
            Transport::Mem(t) => t.recv_message().await,
            #[cfg(feature = "tcp")]
            Transport::Tcp(t) => t.recv_message().await,
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.recv_message().await,
            #[cfg(feature = "http")]
            Transport::Http(t) => t.recv_message().await,
            #[cfg(feature = "udp")]
            Transport::Udp(t) => t.recv_message().await,
            #[cfg(feature = "shm")]
            Transport::Shm(t) => t.recv_message().await,
        }
    }

    pub fn close(&self) {
        match self {
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "tcp")]
            Transport::Tcp(t) => t.close(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.close(),
            #[cfg(feature = "http")]
            Transport::Http(t) => t.close(),
            #[cfg(feature = "udp")]
            Transport::Udp(t) => t.close(),
            #[cfg(feature = "shm")]
            Transport::Shm(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "tcp")]
            Transport::Tcp(t) => t.is_closed(),
            #[cfg(feature = "websocket")]
            Transport::WebSocket(t) => t.is_closed(),
            #[cfg(feature = "http")]
            Transport::Http(t) => t.is_closed(),
            #[cfg(feature = "udp")]
            Transport::Udp(t) => t.is_closed(),
            #[cfg(feature = "shm")]
            Transport::Shm(t) => t.is_closed(),
        }
    }

    /// Whether the transport is a datagram pipe (no delivery guarantee,
    /// bounded message size). Reliable-mode calls retransmit on these.
    pub fn is_datagram(&self) -> bool {
        #[cfg(feature = "udp")]
        if matches!(self, Transport::Udp(_)) {
            return true;
        }
        false
    }

    /// In-process pair, loopback-wired. Used by tests and same-process
    /// dispatch.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }
}

pub mod mem;

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "shm")]
pub mod shm;
#[cfg(feature = "tcp")]
pub mod tcp;
#[cfg(feature = "udp")]
pub mod udp;
#[cfg(feature = "websocket")]
pub mod websocket;
