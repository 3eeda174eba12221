//! WebSocket transport: one binary frame per message.
//!
//! Ping/pong and close frames are handled inside the websocket layer;
//! text frames are ignored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{Stream, StreamExt};
use futures_util::sink::{Sink, SinkExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

use busard_flat::FlatBuffer;
use busard_protocol::HEADER_SIZE;

use crate::{DEFAULT_MAX_MESSAGE_SIZE, TransportError};

type BoxSink = Box<dyn Sink<Message, Error = WsError> + Unpin + Send>;
type BoxStream = Box<dyn Stream<Item = Result<Message, WsError>> + Unpin + Send>;

#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport").finish_non_exhaustive()
    }
}

struct WsInner {
    sink: AsyncMutex<BoxSink>,
    stream: AsyncMutex<BoxStream>,
    closed: AtomicBool,
    max_message_size: usize,
}

impl WebSocketTransport {
    fn from_parts(sink: BoxSink, stream: BoxStream) -> Self {
        WebSocketTransport {
            inner: Arc::new(WsInner {
                sink: AsyncMutex::new(sink),
                stream: AsyncMutex::new(stream),
                closed: AtomicBool::new(false),
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            }),
        }
    }

    /// Wrap an accepted server-side connection.
    pub fn from_accepted(ws: WebSocketStream<TcpStream>) -> Self {
        let (sink, stream) = ws.split();
        Self::from_parts(Box::new(sink), Box::new(stream))
    }

    /// Accept a websocket handshake on a raw TCP connection.
    pub async fn accept(stream: TcpStream) -> Result<Self, TransportError> {
        let ws = accept_async(stream)
            .await
            .map_err(|e| TransportError::Protocol(format!("websocket handshake: {e}")))?;
        Ok(Self::from_accepted(ws))
    }

    /// Dial `ws://` or `wss://`.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response): (WebSocketStream<MaybeTlsStream<TcpStream>>, _) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::Protocol(format!("websocket connect: {e}")))?;
        let (sink, stream) = ws.split();
        Ok(Self::from_parts(Box::new(sink), Box::new(stream)))
    }

    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let bytes = msg.into_bytes();
        if bytes.len() > self.inner.max_message_size {
            return Err(TransportError::TooLarge {
                len: bytes.len(),
                max: self.inner.max_message_size,
            });
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::binary(bytes))
            .await
            .map_err(ws_to_transport)?;
        Ok(())
    }

    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut stream = self.inner.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    if bytes.len() < HEADER_SIZE {
                        return Err(TransportError::Protocol(format!(
                            "binary frame of {} bytes shorter than the message header",
                            bytes.len()
                        )));
                    }
                    if bytes.len() > self.inner.max_message_size {
                        return Err(TransportError::TooLarge {
                            len: bytes.len(),
                            max: self.inner.max_message_size,
                        });
                    }
                    return Ok(FlatBuffer::from_bytes(bytes.to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                // ping/pong handled by tungstenite, text has no meaning here
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => return Err(ws_to_transport(e)),
            }
        }
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Close frame so the peer's reader observes the close promptly.
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut sink = inner.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn ws_to_transport(e: WsError) -> TransportError {
    use tokio_tungstenite::tungstenite::error::ProtocolError;

    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        // An abrupt peer drop without the closing handshake is still a
        // close as far as the session is concerned.
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => TransportError::Closed,
        WsError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            TransportError::Closed
        }
        WsError::Io(io) => TransportError::Io(io),
        other => TransportError::Protocol(other.to_string()),
    }
}
