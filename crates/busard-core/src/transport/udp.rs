//! UDP transport: one datagram per message, 1400-byte ceiling.
//!
//! Delivery is best-effort; the invocation engine layers retransmission
//! on top for methods declared reliable. A server socket is shared by
//! many peers: [`UdpListener`] demultiplexes inbound datagrams by source
//! address into per-peer transports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, warn};

use busard_flat::FlatBuffer;
use busard_protocol::HEADER_SIZE;

use crate::{TransportError, UDP_MAX_MESSAGE_SIZE};

const PEER_QUEUE: usize = 256;
const ACCEPT_QUEUE: usize = 64;

#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpInner>,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("peer", &self.inner.peer)
            .finish_non_exhaustive()
    }
}

struct UdpInner {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// Dial a peer: bind an ephemeral socket and pump inbound datagrams.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;
        let peer = socket.peer_addr()?;
        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(PEER_QUEUE);

        let pump_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match pump_socket.recv(&mut buf).await {
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "udp receive loop ended");
                        break;
                    }
                }
            }
        });

        Ok(UdpTransport {
            inner: Arc::new(UdpInner {
                socket,
                peer,
                rx: AsyncMutex::new(rx),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn from_demux(socket: Arc<UdpSocket>, peer: SocketAddr, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        UdpTransport {
            inner: Arc::new(UdpInner {
                socket,
                peer,
                rx: AsyncMutex::new(rx),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let bytes = msg.as_slice();
        if bytes.len() > UDP_MAX_MESSAGE_SIZE {
            return Err(TransportError::TooLarge {
                len: bytes.len(),
                max: UDP_MAX_MESSAGE_SIZE,
            });
        }
        self.inner.socket.send_to(bytes, self.inner.peer).await?;
        Ok(())
    }

    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        loop {
            let datagram = rx.recv().await.ok_or(TransportError::Closed)?;
            // Runt datagrams are dropped, not fatal: anyone can spray a
            // UDP port.
            if datagram.len() < HEADER_SIZE {
                debug!(len = datagram.len(), "dropping runt datagram");
                continue;
            }
            return Ok(FlatBuffer::from_bytes(datagram));
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Server-side demultiplexer: owns the bound socket, routes datagrams by
/// source address, yields one [`UdpTransport`] per new peer.
pub struct UdpListener {
    incoming: AsyncMutex<mpsc::Receiver<UdpTransport>>,
    local_addr: SocketAddr,
}

impl UdpListener {
    pub async fn bind(port: u16) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local_addr = socket.local_addr()?;
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_QUEUE);

        tokio::spawn(async move {
            let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
            let mut buf = vec![0u8; 65536];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "udp listener socket failed");
                        break;
                    }
                };
                let datagram = buf[..n].to_vec();

                if let Some(tx) = peers.get(&from) {
                    if tx.try_send(datagram).is_err() {
                        // Full queue or dead peer task; datagram semantics
                        // permit the drop.
                        if tx.is_closed() {
                            peers.remove(&from);
                        }
                    }
                    continue;
                }

                let (tx, rx) = mpsc::channel(PEER_QUEUE);
                let _ = tx.try_send(datagram);
                let transport = UdpTransport::from_demux(socket.clone(), from, rx);
                peers.insert(from, tx);
                if incoming_tx.send(transport).await.is_err() {
                    break;
                }
            }
        });

        Ok(UdpListener {
            incoming: AsyncMutex::new(incoming_rx),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The next previously-unseen peer, wrapped as a transport.
    pub async fn accept(&self) -> Result<UdpTransport, TransportError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busard_protocol::{MessageId, MessageType};

    fn small_message() -> FlatBuffer {
        let mut fb = FlatBuffer::begin(MessageId::FunctionCall, MessageType::Request);
        fb.prepare(8);
        fb.commit(8);
        fb.finalize();
        fb
    }

    #[tokio::test]
    async fn datagram_roundtrip_through_demux() {
        let listener = UdpListener::bind(0).await.unwrap();
        let port = listener.local_addr().port();
        let client = UdpTransport::connect("127.0.0.1", port).await.unwrap();

        client.send_message(small_message()).await.unwrap();
        let server_side = listener.accept().await.unwrap();
        let got = server_side.recv_message().await.unwrap();
        assert_eq!(
            got.header().unwrap().msg_id,
            MessageId::FunctionCall.as_u32()
        );

        // and back
        server_side.send_message(small_message()).await.unwrap();
        let reply = client.recv_message().await.unwrap();
        assert_eq!(reply.size(), 24);
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let listener = UdpListener::bind(0).await.unwrap();
        let client = UdpTransport::connect("127.0.0.1", listener.local_addr().port())
            .await
            .unwrap();
        let mut fb = small_message();
        fb.prepare(2000);
        fb.commit(2000);
        fb.finalize();
        assert!(matches!(
            client.send_message(fb).await,
            Err(TransportError::TooLarge { .. })
        ));
    }
}
