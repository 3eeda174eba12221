use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex as AsyncMutex, mpsc};

use busard_flat::FlatBuffer;

use crate::TransportError;

const CHANNEL_CAPACITY: usize = 64;

/// In-process transport: a pair of bounded channels. Framing is a no-op
/// since messages cross as owned buffers.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::Sender<FlatBuffer>,
    rx: AsyncMutex<mpsc::Receiver<FlatBuffer>>,
    closed: AtomicBool,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = MemTransport {
            inner: Arc::new(MemInner {
                tx: tx_b,
                rx: AsyncMutex::new(rx_a),
                closed: AtomicBool::new(false),
            }),
        };
        let b = MemTransport {
            inner: Arc::new(MemInner {
                tx: tx_a,
                rx: AsyncMutex::new(rx_b),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(msg)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
