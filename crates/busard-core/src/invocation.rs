//! The invocation engine: request ids, completion handles, timeouts,
//! reply interpretation, and the retransmit loop for reliable datagram
//! calls.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, timeout_at};

use busard_flat::{FlatBuffer, Reader};
use busard_protocol::{BODY_OFFSET, ErrorKind, MessageId};

use crate::session::replies;
use crate::{RpcError, Session, UdpRetryConfig};

/// Outcome of a successful call.
#[derive(Debug)]
pub enum CallReply {
    /// `Success` acknowledgement, no out-arguments.
    Success,
    /// `BlockResponse`: the caller reads out-arguments and the return
    /// value from the buffer.
    Block(FlatBuffer),
}

impl CallReply {
    pub fn into_block(self) -> Option<FlatBuffer> {
        match self {
            CallReply::Block(fb) => Some(fb),
            CallReply::Success => None,
        }
    }
}

impl Session {
    fn alloc_request_id(&self) -> u32 {
        // 0 is reserved for stream frames.
        loop {
            let id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn register_pending(&self, id: u32) -> oneshot::Receiver<Result<FlatBuffer, RpcError>> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);
        rx
    }

    fn forget_pending(&self, id: u32) {
        self.shared.pending.lock().remove(&id);
    }

    /// Send a request and await its reply, the timeout, or session
    /// failure, whichever comes first. On timeout the pending entry is
    /// removed; a late reply is dropped by the demultiplexer.
    pub async fn call(
        &self,
        mut msg: FlatBuffer,
        timeout: Duration,
    ) -> Result<CallReply, RpcError> {
        if self.is_closed() {
            return Err(RpcError::closed());
        }
        let id = self.alloc_request_id();
        msg.set_request_id(id);
        let rx = self.register_pending(id);

        if self.post(msg).await.is_err() {
            self.forget_pending(id);
            return Err(RpcError::closed());
        }

        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, rx).await {
            Err(_elapsed) => {
                self.forget_pending(id);
                Err(RpcError::timeout())
            }
            // Completion handle dropped without a value: teardown race.
            Ok(Err(_recv)) => Err(RpcError::closed()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Ok(Ok(reply))) => interpret_reply(reply),
        }
    }

    /// Reliable-mode datagram call: retransmit the identical frame with
    /// exponential backoff until a reply keyed by the request id arrives
    /// or the retry budget runs out.
    pub async fn call_reliable(
        &self,
        mut msg: FlatBuffer,
        timeout: Duration,
        retry: UdpRetryConfig,
    ) -> Result<CallReply, RpcError> {
        if self.is_closed() {
            return Err(RpcError::closed());
        }
        let id = self.alloc_request_id();
        msg.set_request_id(id);
        let mut rx = self.register_pending(id);

        let deadline = Instant::now() + timeout;
        let mut backoff = retry.initial_backoff;
        let mut attempts: u32 = 1;

        if self.post(msg.clone()).await.is_err() {
            self.forget_pending(id);
            return Err(RpcError::closed());
        }

        loop {
            let wait = backoff.min(deadline.saturating_duration_since(Instant::now()));
            if wait.is_zero() {
                self.forget_pending(id);
                return Err(RpcError::timeout());
            }
            tokio::select! {
                outcome = &mut rx => {
                    return match outcome {
                        Err(_recv) => Err(RpcError::closed()),
                        Ok(Err(e)) => Err(e),
                        Ok(Ok(reply)) => interpret_reply(reply),
                    };
                }
                _ = sleep(wait) => {
                    if attempts >= retry.budget {
                        self.forget_pending(id);
                        return Err(RpcError::comm("retry budget exhausted"));
                    }
                    attempts += 1;
                    backoff = (backoff * 2).min(retry.max_backoff);
                    if self.post(msg.clone()).await.is_err() {
                        self.forget_pending(id);
                        return Err(RpcError::closed());
                    }
                }
            }
        }
    }
}

/// Map a reply message onto the caller-visible outcome.
fn interpret_reply(msg: FlatBuffer) -> Result<CallReply, RpcError> {
    let header = msg.header().ok_or_else(|| RpcError::comm("runt reply"))?;
    match header.message_id() {
        Some(MessageId::Success) => Ok(CallReply::Success),
        Some(MessageId::BlockResponse) => Ok(CallReply::Block(msg)),
        Some(MessageId::Exception) => {
            let reader = Reader::new(msg.as_slice())?;
            let exception_id = reader.u32_at(BODY_OFFSET)?;
            Err(RpcError::Exception {
                exception_id,
                message: msg.into_bytes(),
            })
        }
        Some(id) => {
            let Some(kind) = ErrorKind::from_message_id(id) else {
                // A request id on the answer path: version mismatch.
                return Err(RpcError::kind(ErrorKind::UnknownMessageId));
            };
            let reason = if kind == ErrorKind::CommFailure {
                replies::comm_failure_reason(msg.as_slice())
            } else {
                None
            };
            Err(RpcError::Kind { kind, reason })
        }
        None => Err(RpcError::kind(ErrorKind::UnknownMessageId)),
    }
}
