//! TCP transport: 4-byte little-endian length prefix, then the message
//! (header + payload). The prefix counts the whole message, excluding
//! itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use busard_flat::FlatBuffer;
use busard_protocol::HEADER_SIZE;

use crate::{DEFAULT_MAX_MESSAGE_SIZE, TransportError};

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpInner>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport").finish_non_exhaustive()
    }
}

struct TcpInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    max_message_size: usize,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_limit(stream, DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_limit(stream: TcpStream, max_message_size: usize) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = tokio::io::split(stream);
        TcpTransport {
            inner: Arc::new(TcpInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                max_message_size,
            }),
        }
    }

    /// Dial a peer.
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::new(stream))
    }

    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let bytes = msg.as_slice();
        if bytes.len() > self.inner.max_message_size {
            return Err(TransportError::TooLarge {
                len: bytes.len(),
                max: self.inner.max_message_size,
            });
        }
        let prefix = (bytes.len() as u32).to_le_bytes();

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&prefix).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.inner.reader.lock().await;

        let mut prefix = [0u8; 4];
        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            // Clean close before any prefix byte; mid-prefix truncation is
            // a protocol violation.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(prefix) as usize;

        if len < HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "framed length {len} shorter than the message header"
            )));
        }
        if len > self.inner.max_message_size {
            return Err(TransportError::TooLarge {
                len,
                max: self.inner.max_message_size,
            });
        }

        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Protocol("stream ended inside a framed message".to_string())
            } else {
                TransportError::Io(e)
            }
        })?;

        Ok(FlatBuffer::from_bytes(bytes))
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Send FIN so the peer's reader observes the close promptly.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut writer = inner.writer.lock().await;
            let _ = writer.shutdown().await;
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
