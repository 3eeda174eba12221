//! Shared-memory transport: one SPSC ring per direction (see [`ring`]),
//! bridged onto the async runtime by a pump thread per direction.
//!
//! The server creates both rings at listen time under names derived from
//! the channel id; a client attaches, stamps its UUID into the
//! client→server ring header and flips the attach state, which pins the
//! writer side of each ring to exactly one process.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use busard_flat::FlatBuffer;
use busard_protocol::HEADER_SIZE;

use crate::{ShmWakeup, TransportError};

pub mod ring;

use ring::{DEFAULT_RING_SIZE, RingConsumer, RingProducer, ShmRegion};

const PUMP_QUEUE: usize = 64;

fn region_names(channel: &str) -> io::Result<(String, String)> {
    if channel.is_empty() || channel.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "channel id must be non-empty and slash-free",
        ));
    }
    Ok((
        format!("busard-{channel}-c2s"),
        format!("busard-{channel}-s2c"),
    ))
}

#[derive(Clone)]
pub struct ShmTransport {
    inner: Arc<ShmShared>,
}

impl std::fmt::Debug for ShmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmTransport").finish_non_exhaustive()
    }
}

struct ShmShared {
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    incoming_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    tx_region: Arc<ShmRegion>,
    rx_region: Arc<ShmRegion>,
    closed: AtomicBool,
}

impl ShmTransport {
    fn build(tx_region: Arc<ShmRegion>, rx_region: Arc<ShmRegion>, wakeup: ShmWakeup) -> Self {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE);

        let producer = RingProducer::new(tx_region.clone(), wakeup);
        let producer_region = tx_region.clone();
        std::thread::spawn(move || {
            while let Some(bytes) = outgoing_rx.blocking_recv() {
                match producer.push(&bytes) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        debug!(error = %e, "shm writer pump stopped");
                        break;
                    }
                }
            }
            producer_region.mark_closed();
        });

        let consumer = RingConsumer::new(rx_region.clone(), wakeup);
        std::thread::spawn(move || {
            loop {
                match consumer.pop() {
                    Ok(Some(bytes)) => {
                        if incoming_tx.blocking_send(bytes).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "shm reader pump stopped");
                        break;
                    }
                }
            }
        });

        ShmTransport {
            inner: Arc::new(ShmShared {
                outgoing_tx,
                incoming_rx: AsyncMutex::new(incoming_rx),
                tx_region,
                rx_region,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Attach to a served channel: open both rings, stamp our UUID into
    /// the client→server header and flip the attach state.
    pub fn connect(channel: &str, uuid: Uuid, wakeup: ShmWakeup) -> Result<Self, TransportError> {
        let (c2s_name, s2c_name) = region_names(channel)?;
        let c2s = Arc::new(ShmRegion::open(&c2s_name)?);
        let s2c = Arc::new(ShmRegion::open(&s2c_name)?);

        c2s.set_writer_uuid(*uuid.as_bytes());
        c2s.set_attached();

        Ok(Self::build(c2s, s2c, wakeup))
    }

    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let max = self.inner.tx_region.max_message();
        if msg.size() > max {
            return Err(TransportError::TooLarge {
                len: msg.size(),
                max,
            });
        }
        self.inner
            .outgoing_tx
            .send(msg.into_bytes())
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.incoming_rx.lock().await;
        loop {
            let bytes = rx.recv().await.ok_or(TransportError::Closed)?;
            if bytes.len() < HEADER_SIZE {
                return Err(TransportError::Protocol(format!(
                    "ring message of {} bytes shorter than the message header",
                    bytes.len()
                )));
            }
            return Ok(FlatBuffer::from_bytes(bytes));
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx_region.mark_closed();
        self.inner.rx_region.mark_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Serving side of a channel: creates the rings at listen time and
/// yields one transport when a client attaches. A channel carries a
/// single client; serve one channel per expected peer.
pub struct ShmListener {
    accepted: AsyncMutex<mpsc::Receiver<ShmTransport>>,
    channel: String,
    c2s: Arc<ShmRegion>,
    s2c: Arc<ShmRegion>,
}

impl ShmListener {
    pub fn create(channel: &str, uuid: Uuid, wakeup: ShmWakeup) -> Result<Self, TransportError> {
        let (c2s_name, s2c_name) = region_names(channel)?;
        let c2s = Arc::new(ShmRegion::create(&c2s_name, DEFAULT_RING_SIZE)?);
        let s2c = Arc::new(ShmRegion::create(&s2c_name, DEFAULT_RING_SIZE)?);

        // Pin the server as the writer of the server→client ring.
        s2c.set_writer_uuid(*uuid.as_bytes());

        let (accepted_tx, accepted_rx) = mpsc::channel(1);
        let thread_c2s = c2s.clone();
        let thread_s2c = s2c.clone();
        std::thread::spawn(move || {
            // Wait for a client to flip the attach state.
            loop {
                if thread_c2s.is_attached() {
                    break;
                }
                if thread_c2s.is_marked_closed() || thread_s2c.is_marked_closed() {
                    return;
                }
                std::thread::yield_now();
            }
            let peer = Uuid::from_bytes(thread_c2s.writer_uuid());
            debug!(peer = %peer, "shm client attached");
            let transport = ShmTransport::build(thread_s2c, thread_c2s, wakeup);
            let _ = accepted_tx.blocking_send(transport);
        });

        Ok(ShmListener {
            accepted: AsyncMutex::new(accepted_rx),
            channel: channel.to_string(),
            c2s,
            s2c,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The transport for the attached client.
    pub async fn accept(&self) -> Result<ShmTransport, TransportError> {
        let mut accepted = self.accepted.lock().await;
        accepted.recv().await.ok_or(TransportError::Closed)
    }
}

impl Drop for ShmListener {
    fn drop(&mut self) {
        // Stop a handshake thread still waiting for a client. An
        // attached session owns its own liveness; leave it alone.
        if !self.c2s.is_attached() {
            self.c2s.mark_closed();
            self.s2c.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busard_protocol::{MessageId, MessageType};

    fn unique_channel(tag: &str) -> String {
        format!("{tag}-{}", std::process::id())
    }

    fn message(fill: usize) -> FlatBuffer {
        let mut fb = FlatBuffer::begin(MessageId::FunctionCall, MessageType::Request);
        fb.prepare(fill);
        fb.commit(fill);
        fb.finalize();
        fb
    }

    #[tokio::test]
    async fn attach_and_roundtrip() {
        let channel = unique_channel("rt");
        let server_uuid = Uuid::new_v4();
        let listener = ShmListener::create(&channel, server_uuid, ShmWakeup::Yield).unwrap();
        let client =
            ShmTransport::connect(&channel, Uuid::new_v4(), ShmWakeup::Yield).unwrap();
        let server = listener.accept().await.unwrap();

        client.send_message(message(32)).await.unwrap();
        let got = server.recv_message().await.unwrap();
        assert_eq!(got.size(), 16 + 32);

        server.send_message(message(8)).await.unwrap();
        let back = client.recv_message().await.unwrap();
        assert_eq!(back.size(), 16 + 8);
    }

    #[tokio::test]
    async fn close_surfaces_on_peer() {
        let channel = unique_channel("close");
        let listener =
            ShmListener::create(&channel, Uuid::new_v4(), ShmWakeup::Yield).unwrap();
        let client =
            ShmTransport::connect(&channel, Uuid::new_v4(), ShmWakeup::Yield).unwrap();
        let server = listener.accept().await.unwrap();

        client.close();
        assert!(matches!(
            server.recv_message().await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn connect_without_listener_fails() {
        let r = ShmTransport::connect("no-such-channel-busard", Uuid::new_v4(), ShmWakeup::Yield);
        assert!(r.is_err());
    }
}
