//! HTTP transport, client half: one `POST /rpc` per message, reply in the
//! response body, `application/octet-stream` both ways. Stateless; there
//! is no connection to lose, so there is nothing to reconnect.
//!
//! The server half is an axum route built by
//! [`crate::runtime::http_router`]; it never goes through a `Transport`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use busard_flat::FlatBuffer;
use busard_protocol::{HEADER_SIZE, MessageId, MessageType};

use crate::{Endpoint, Scheme, TransportError};

const RESPONSE_QUEUE: usize = 64;

/// Route every message is POSTed to.
pub const RPC_ROUTE: &str = "/rpc";

#[derive(Clone)]
pub struct HttpClientTransport {
    inner: Arc<HttpInner>,
}

impl std::fmt::Debug for HttpClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientTransport")
            .field("url", &self.inner.url)
            .finish_non_exhaustive()
    }
}

struct HttpInner {
    client: reqwest::Client,
    url: String,
    /// Dropped on close so a blocked `recv_message` wakes with `Closed`.
    responses_tx: Mutex<Option<mpsc::Sender<FlatBuffer>>>,
    responses_rx: AsyncMutex<mpsc::Receiver<FlatBuffer>>,
    closed: AtomicBool,
}

impl HttpClientTransport {
    pub fn new(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let scheme = match endpoint.scheme {
            Scheme::Https => "https",
            _ => "http",
        };
        let url = format!("{scheme}://{}:{}{RPC_ROUTE}", endpoint.host, endpoint.port);
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Protocol(format!("http client: {e}")))?;
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_QUEUE);
        Ok(HttpClientTransport {
            inner: Arc::new(HttpInner {
                client,
                url,
                responses_tx: Mutex::new(Some(responses_tx)),
                responses_rx: AsyncMutex::new(responses_rx),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// POST the message. The request is issued on its own task so a slow
    /// response never stalls the session writer; a failed request is
    /// surfaced as a synthetic `ErrorCommFailure` answer carrying the
    /// original request id, which completes the pending call.
    pub async fn send_message(&self, msg: FlatBuffer) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let request_id = msg.request_id();
        let Some(responses_tx) = self.inner.responses_tx.lock().clone() else {
            return Err(TransportError::Closed);
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner
                .client
                .post(&inner.url)
                .header("content-type", "application/octet-stream")
                .body(msg.into_bytes())
                .send()
                .await;
            let reply = match outcome {
                Ok(resp) => match resp.bytes().await {
                    Ok(body) if body.len() >= HEADER_SIZE => FlatBuffer::from_bytes(body.to_vec()),
                    Ok(body) => synthetic_failure(
                        request_id,
                        &format!("http reply of {} bytes is shorter than a header", body.len()),
                    ),
                    Err(e) => synthetic_failure(request_id, &format!("http body: {e}")),
                },
                Err(e) => synthetic_failure(request_id, &format!("http request: {e}")),
            };
            let _ = responses_tx.send(reply).await;
        });
        Ok(())
    }

    pub async fn recv_message(&self) -> Result<FlatBuffer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.responses_rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.responses_tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Build an `ErrorCommFailure` answer for a request that never reached
/// the peer.
fn synthetic_failure(request_id: u32, reason: &str) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::ErrorCommFailure, MessageType::Answer);
    fb.set_request_id(request_id);
    let reason = reason.as_bytes();
    let at = fb.size();
    fb.prepare(4 + reason.len());
    fb.commit(4 + reason.len());
    busard_flat::write_u32_at(&mut fb, at, reason.len() as u32);
    fb.as_mut_slice()[at + 4..at + 4 + reason.len()].copy_from_slice(reason);
    fb.finalize();
    fb
}

#[cfg(test)]
mod tests {
    use super::*;
    use busard_protocol::Header;

    #[test]
    fn synthetic_failure_carries_request_id_and_reason() {
        let fb = synthetic_failure(42, "no route");
        let hdr = Header::read(fb.as_slice()).unwrap();
        assert_eq!(hdr.request_id, 42);
        assert_eq!(hdr.msg_id, MessageId::ErrorCommFailure.as_u32());
        let len = u32::from_le_bytes(fb.as_slice()[16..20].try_into().unwrap()) as usize;
        assert_eq!(&fb.as_slice()[20..20 + len], b"no route");
    }
}
