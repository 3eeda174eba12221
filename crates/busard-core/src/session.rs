//! Sessions: one transport connection, both directions.
//!
//! A session owns a reader task (inbound demultiplexer) and a writer task
//! (serialized outbound path). The reader never blocks on user code:
//! servant dispatches run on spawned worker tasks and push their replies
//! through the writer queue. Outbound calls park on a completion handle
//! in the pending map, keyed by request id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use busard_flat::{FlatBuffer, Reader, write_u32_at};
use busard_protocol::{
    BODY_OFFSET, CallHeader, ErrorKind, Header, LifetimeBody, MessageId, MessageType,
    StreamInitBody,
};

use crate::poa::PoaRegistry;
use crate::stream::{StreamTable, StreamWriter};
use crate::{RpcError, Transport, TransportError};

const WRITER_QUEUE: usize = 256;

/// Reply message builders shared by the session demux and the HTTP
/// acceptor.
pub(crate) mod replies {
    use super::*;

    pub fn success(request_id: u32) -> FlatBuffer {
        let mut fb = FlatBuffer::begin(MessageId::Success, MessageType::Answer);
        fb.set_request_id(request_id);
        fb.finalize();
        fb
    }

    pub fn error_kind(kind: ErrorKind, request_id: u32, reason: Option<&str>) -> FlatBuffer {
        let mut fb = FlatBuffer::begin(kind.message_id(), MessageType::Answer);
        fb.set_request_id(request_id);
        if let Some(reason) = reason {
            let bytes = reason.as_bytes();
            let at = fb.size();
            fb.prepare(4 + bytes.len());
            fb.commit(4 + bytes.len());
            write_u32_at(&mut fb, at, bytes.len() as u32);
            fb.as_mut_slice()[at + 4..at + 4 + bytes.len()].copy_from_slice(bytes);
        }
        fb.finalize();
        fb
    }

    pub fn for_rpc_error(err: &RpcError, request_id: u32) -> FlatBuffer {
        match err {
            RpcError::Kind { kind, reason } => error_kind(*kind, request_id, reason.as_deref()),
            RpcError::Exception {
                exception_id,
                message,
            } => {
                let mut fb = FlatBuffer::begin(MessageId::Exception, MessageType::Answer);
                fb.set_request_id(request_id);
                // The exception payload is a prebuilt body starting at
                // offset 16 of `message`.
                let body = &message[BODY_OFFSET.min(message.len())..];
                let at = fb.size();
                fb.prepare(body.len());
                fb.commit(body.len());
                fb.as_mut_slice()[at..at + body.len()].copy_from_slice(body);
                fb.finalize();
                fb
            }
        }
    }

    /// Read the reason string of an `ErrorCommFailure` body.
    pub fn comm_failure_reason(msg: &[u8]) -> Option<String> {
        let body = msg.get(BODY_OFFSET..)?;
        if body.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
        let bytes = body.get(4..4 + len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub(crate) struct SessionShared {
    transport: Transport,
    writer_tx: mpsc::Sender<FlatBuffer>,
    pub(crate) pending: Mutex<HashMap<u32, oneshot::Sender<Result<FlatBuffer, RpcError>>>>,
    pub(crate) next_request_id: AtomicU32,
    pub(crate) streams: StreamTable,
    registry: Arc<PoaRegistry>,
    closed: AtomicBool,
}

impl Session {
    /// Wrap a connected transport and start the reader/writer tasks.
    pub fn spawn(transport: Transport, registry: Arc<PoaRegistry>) -> Session {
        let (writer_tx, mut writer_rx) = mpsc::channel::<FlatBuffer>(WRITER_QUEUE);
        let session = Session {
            shared: Arc::new(SessionShared {
                transport: transport.clone(),
                writer_tx,
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU32::new(1),
                streams: StreamTable::new(),
                registry,
                closed: AtomicBool::new(false),
            }),
        };

        // Writer serial: outbound messages leave in queue order.
        let writer_session = session.clone();
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if let Err(e) = writer_session.shared.transport.send_message(msg).await {
                    writer_session.fail(&format!("write failed: {e}"));
                    break;
                }
            }
        });

        // Reader: demultiplex inbound messages until the transport dies.
        let reader_session = session.clone();
        tokio::spawn(async move {
            loop {
                match reader_session.shared.transport.recv_message().await {
                    Ok(msg) => {
                        if !reader_session.demux(msg).await {
                            break;
                        }
                    }
                    Err(TransportError::Closed) => {
                        reader_session.fail("connection closed");
                        break;
                    }
                    Err(e) => {
                        reader_session.fail(&e.to_string());
                        break;
                    }
                }
            }
        });

        session
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether the underlying transport is a datagram pipe; reliable-mode
    /// calls retransmit on these.
    pub fn is_datagram(&self) -> bool {
        self.shared.transport.is_datagram()
    }

    /// Queue a message with no reply expected (stream frames, acks).
    pub async fn post(&self, msg: FlatBuffer) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::closed());
        }
        self.shared
            .writer_tx
            .send(msg)
            .await
            .map_err(|_| RpcError::closed())
    }

    /// Best-effort post from non-async contexts (drop paths).
    pub(crate) fn try_post(&self, msg: FlatBuffer) {
        let _ = self.shared.writer_tx.try_send(msg);
    }

    /// Tear the session down: every pending call and registered stream
    /// reader completes with a `CommFailure`, the transport closes.
    pub fn fail(&self, reason: &str) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "session torn down");
        let pending: Vec<_> = {
            let mut map = self.shared.pending.lock();
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::comm(reason)));
        }
        self.shared.streams.fail_all();
        self.shared.transport.close();
    }

    /// Handle one inbound message. Returns false when the session must
    /// stop reading.
    async fn demux(&self, msg: FlatBuffer) -> bool {
        let Some(header) = msg.header() else {
            self.fail("message shorter than header");
            return false;
        };
        // Framed length and header-declared length must agree.
        if msg.size() != header.size as usize + 4 {
            self.fail(&format!(
                "length mismatch: header says {}, frame is {}",
                header.size as usize + 4,
                msg.size()
            ));
            return false;
        }

        match header.message_type() {
            Some(MessageType::Answer) => {
                self.complete_pending(header, msg);
                true
            }
            Some(MessageType::Request) => {
                self.route_request(header, msg).await;
                true
            }
            None => {
                self.fail(&format!("unknown msg_type {}", header.msg_type));
                false
            }
        }
    }

    fn complete_pending(&self, header: Header, msg: FlatBuffer) {
        let entry = self.shared.pending.lock().remove(&header.request_id);
        match entry {
            Some(tx) => {
                let _ = tx.send(Ok(msg));
            }
            None => {
                // Late reply after a timeout; dropped without ceremony.
                trace!(request_id = header.request_id, "dropping unmatched answer");
            }
        }
    }

    async fn route_request(&self, header: Header, msg: FlatBuffer) {
        let request_id = header.request_id;
        match header.message_id() {
            Some(MessageId::FunctionCall) => self.handle_function_call(request_id, msg),
            Some(MessageId::AddReference) => {
                let reply = self.handle_lifetime(&msg, true);
                let _ = self.post(replies_from(reply, request_id)).await;
            }
            Some(MessageId::ReleaseObject) => {
                let reply = self.handle_lifetime(&msg, false);
                let _ = self.post(replies_from(reply, request_id)).await;
            }
            Some(MessageId::StreamInitialization) => self.handle_stream_init(request_id, msg).await,
            Some(id) if id.is_stream() => {
                // Chunk, completion, error, cancel: no reply, routed by
                // msg_id before request/response correlation.
                self.shared.streams.handle_frame(id, &msg);
            }
            _ => {
                warn!(msg_id = header.msg_id, "unknown inbound message id");
                let reply =
                    replies::error_kind(ErrorKind::UnknownMessageId, request_id, None);
                let _ = self.post(reply).await;
            }
        }
    }

    fn handle_function_call(&self, request_id: u32, msg: FlatBuffer) {
        let call = match CallHeader::read(&msg.as_slice()[BODY_OFFSET.min(msg.size())..]) {
            Some(call) => call,
            None => {
                self.try_post(replies::error_kind(
                    ErrorKind::BadInput,
                    request_id,
                    Some("truncated call header"),
                ));
                return;
            }
        };
        let Some(poa) = self.shared.registry.get(call.poa_idx) else {
            self.try_post(replies::error_kind(ErrorKind::PoaNotExist, request_id, None));
            return;
        };
        let servant = match poa.lookup(call.object_id) {
            Ok(servant) => servant,
            Err(kind) => {
                self.try_post(replies::error_kind(kind, request_id, None));
                return;
            }
        };

        // User code may block or suspend; keep it off the reader.
        let session = self.clone();
        tokio::spawn(async move {
            let mut ctx = CallContext {
                rx: msg,
                call,
                request_id,
                reply: None,
                session: Some(session.clone()),
                stream: None,
            };
            let reply = match servant.dispatch(&mut ctx).await {
                Ok(()) => match ctx.take_reply() {
                    Some(fb) => fb,
                    None => replies::success(request_id),
                },
                Err(err) => replies::for_rpc_error(&err, request_id),
            };
            let _ = session.post(reply).await;
        });
    }

    fn handle_lifetime(&self, msg: &FlatBuffer, add: bool) -> Result<(), ErrorKind> {
        apply_lifetime(&self.shared.registry, msg, add)
    }

    async fn handle_stream_init(&self, request_id: u32, msg: FlatBuffer) {
        let init = match StreamInitBody::read(&msg.as_slice()[BODY_OFFSET.min(msg.size())..]) {
            Some(init) => init,
            None => {
                let _ = self
                    .post(replies::error_kind(
                        ErrorKind::BadInput,
                        request_id,
                        Some("truncated stream init"),
                    ))
                    .await;
                return;
            }
        };
        let Some(poa) = self.shared.registry.get(init.poa_idx) else {
            let _ = self
                .post(replies::error_kind(ErrorKind::PoaNotExist, request_id, None))
                .await;
            return;
        };
        let servant = match poa.lookup(init.object_id) {
            Ok(servant) => servant,
            Err(kind) => {
                let _ = self.post(replies::error_kind(kind, request_id, None)).await;
                return;
            }
        };

        // Ack first so the consumer can start reading, then produce.
        let _ = self.post(replies::success(request_id)).await;

        let cancelled = self.shared.streams.register_producer(init.stream_id);
        let writer = StreamWriter::new(self.clone(), init.stream_id, cancelled);
        let call = CallHeader {
            poa_idx: init.poa_idx,
            interface_idx: init.interface_idx,
            function_idx: init.func_idx,
            object_id: init.object_id,
        };
        let session = self.clone();
        tokio::spawn(async move {
            let mut ctx = CallContext {
                rx: msg,
                call,
                request_id,
                reply: None,
                session: Some(session.clone()),
                stream: Some(writer),
            };
            if let Err(err) = servant.dispatch(&mut ctx).await {
                debug!(stream_id = init.stream_id, error = %err, "stream producer failed");
                if let Some(writer) = ctx.take_stream() {
                    let _ = writer.error(stream_fault_code(&err), &[]).await;
                }
            }
        });
    }
}

fn replies_from(result: Result<(), ErrorKind>, request_id: u32) -> FlatBuffer {
    match result {
        Ok(()) => replies::success(request_id),
        Err(kind) => replies::error_kind(kind, request_id, None),
    }
}

/// Remote refcount bookkeeping shared by the session demux and the HTTP
/// acceptor.
pub(crate) fn apply_lifetime(
    registry: &PoaRegistry,
    msg: &FlatBuffer,
    add: bool,
) -> Result<(), ErrorKind> {
    let body = LifetimeBody::read(&msg.as_slice()[BODY_OFFSET.min(msg.size())..])
        .ok_or(ErrorKind::BadInput)?;
    let poa = registry.get(body.poa_idx).ok_or(ErrorKind::ObjectNotExist)?;
    if add {
        poa.add_ref(body.object_id).map(|_| ())
    } else {
        poa.release(body.object_id).map(|_| ())
    }
}

/// Dispatch a single request without a surrounding session: the HTTP
/// acceptor's POST-per-call path. Streams need a duplex transport, so
/// stream messages are refused outright.
pub(crate) async fn dispatch_oneshot(registry: &Arc<PoaRegistry>, bytes: Vec<u8>) -> FlatBuffer {
    let msg = FlatBuffer::from_bytes(bytes);
    let Some(header) = msg.header() else {
        return replies::error_kind(ErrorKind::BadInput, 0, Some("message shorter than header"));
    };
    let request_id = header.request_id;
    if msg.size() != header.size as usize + 4 {
        return replies::error_kind(ErrorKind::BadInput, request_id, Some("length mismatch"));
    }

    match header.message_id() {
        Some(MessageId::FunctionCall) => {
            let Some(call) = CallHeader::read(&msg.as_slice()[BODY_OFFSET..]) else {
                return replies::error_kind(
                    ErrorKind::BadInput,
                    request_id,
                    Some("truncated call header"),
                );
            };
            let Some(poa) = registry.get(call.poa_idx) else {
                return replies::error_kind(ErrorKind::PoaNotExist, request_id, None);
            };
            let servant = match poa.lookup(call.object_id) {
                Ok(servant) => servant,
                Err(kind) => return replies::error_kind(kind, request_id, None),
            };
            let mut ctx = CallContext::oneshot(msg, call, request_id);
            match servant.dispatch(&mut ctx).await {
                Ok(()) => ctx
                    .take_reply()
                    .unwrap_or_else(|| replies::success(request_id)),
                Err(err) => replies::for_rpc_error(&err, request_id),
            }
        }
        Some(MessageId::AddReference) => {
            replies_from(apply_lifetime(registry, &msg, true), request_id)
        }
        Some(MessageId::ReleaseObject) => {
            replies_from(apply_lifetime(registry, &msg, false), request_id)
        }
        Some(id) if id.is_stream() => replies::error_kind(
            ErrorKind::BadAccess,
            request_id,
            Some("streams are not reachable over the http transport"),
        ),
        _ => replies::error_kind(ErrorKind::UnknownMessageId, request_id, None),
    }
}

fn stream_fault_code(err: &RpcError) -> u32 {
    match err {
        RpcError::Exception { exception_id, .. } => *exception_id,
        RpcError::Kind { .. } => u32::MAX,
    }
}

/// Per-dispatch context handed to a servant: the receive buffer, a place
/// for the reply, and the session the call arrived on (absent for
/// stateless HTTP dispatches).
pub struct CallContext {
    rx: FlatBuffer,
    call: CallHeader,
    request_id: u32,
    reply: Option<FlatBuffer>,
    session: Option<Session>,
    stream: Option<StreamWriter>,
}

impl CallContext {
    pub(crate) fn oneshot(rx: FlatBuffer, call: CallHeader, request_id: u32) -> Self {
        CallContext {
            rx,
            call,
            request_id,
            reply: None,
            session: None,
            stream: None,
        }
    }

    /// Bounds-checked reader over the request message.
    pub fn reader(&self) -> Result<Reader<'_>, RpcError> {
        Ok(Reader::new(self.rx.as_slice())?)
    }

    pub fn call(&self) -> &CallHeader {
        &self.call
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// The session the request arrived on; tethered references resolve
    /// against it.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Start a `BlockResponse` reply. Out-arguments and the return value
    /// are written into the returned buffer after its 16-byte header.
    pub fn begin_reply(&mut self) -> &mut FlatBuffer {
        let mut fb = FlatBuffer::begin(MessageId::BlockResponse, MessageType::Answer);
        fb.set_request_id(self.request_id);
        self.reply.insert(fb)
    }

    /// The stream writer, when this dispatch was started by a
    /// `StreamInitialization`.
    pub fn take_stream(&mut self) -> Option<StreamWriter> {
        self.stream.take()
    }

    pub(crate) fn take_reply(&mut self) -> Option<FlatBuffer> {
        let mut fb = self.reply.take()?;
        fb.finalize();
        Some(fb)
    }
}
