//! Server→client streams multiplexed over a session.
//!
//! Stream frames always carry `request_id = 0` and are routed by message
//! id before request/response correlation, so they can never collide
//! with pending calls. Ordering is restored on the consumer side: chunks
//! arriving out of sequence wait in a reorder buffer and are delivered
//! strictly in `sequence` order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use busard_flat::{FlatBuffer, Reader, write_bytes_vector};
use busard_protocol::{
    BODY_OFFSET, MessageId, MessageType, StreamCancelBody, StreamChunkHeader,
    StreamCompletionBody, StreamErrorHeader, StreamInitBody,
};

use crate::{CallReply, RpcError, Session};

/// Error code a dropped producer reports in its `StreamError`.
pub const STREAM_FAULT_PRODUCER_DROPPED: u32 = u32::MAX;

/// Window stamped into chunks unless the producer overrides it.
const DEFAULT_WINDOW: u32 = 64;

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Chunk {
        sequence: u64,
        data: Vec<u8>,
        window: u32,
    },
    Completion {
        final_sequence: u64,
    },
    Error {
        code: u32,
        data: Vec<u8>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Open,
    Closing,
    Closed,
}

/// Per-session stream bookkeeping: consumer-side readers, producer-side
/// cancellation flags, id allocation.
pub(crate) struct StreamTable {
    readers: Mutex<HashMap<u64, mpsc::UnboundedSender<StreamEvent>>>,
    producers: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    next_stream_id: AtomicU64,
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable {
            readers: Mutex::new(HashMap::new()),
            producers: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub fn alloc_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_reader(&self, stream_id: u64) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.readers.lock().insert(stream_id, tx);
        rx
    }

    pub fn unregister_reader(&self, stream_id: u64) {
        self.readers.lock().remove(&stream_id);
    }

    pub fn register_producer(&self, stream_id: u64) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.producers.lock().insert(stream_id, flag.clone());
        flag
    }

    pub fn unregister_producer(&self, stream_id: u64) {
        self.producers.lock().remove(&stream_id);
    }

    /// Session teardown: readers see end-of-channel, producers see the
    /// cancellation flag.
    pub fn fail_all(&self) {
        self.readers.lock().clear();
        let producers: Vec<_> = self.producers.lock().drain().collect();
        for (_, flag) in producers {
            flag.store(true, Ordering::Release);
        }
    }

    /// Route an inbound chunk/completion/error/cancel frame. No replies;
    /// frames for unknown streams are dropped.
    pub fn handle_frame(&self, id: MessageId, msg: &FlatBuffer) {
        let Ok(reader) = Reader::new(msg.as_slice()) else {
            return;
        };
        let body = reader.body();
        match id {
            MessageId::StreamDataChunk => {
                let Some(chunk) = StreamChunkHeader::read(body) else {
                    debug!("dropping truncated stream chunk");
                    return;
                };
                let Ok(data) =
                    reader.bytes_vector(BODY_OFFSET + StreamChunkHeader::DATA_FIELD)
                else {
                    debug!(stream_id = chunk.stream_id, "dropping chunk with bad payload");
                    return;
                };
                self.deliver(
                    chunk.stream_id,
                    StreamEvent::Chunk {
                        sequence: chunk.sequence,
                        data: data.to_vec(),
                        window: chunk.window_size,
                    },
                );
            }
            MessageId::StreamCompletion => {
                let Some(done) = StreamCompletionBody::read(body) else {
                    return;
                };
                self.deliver(
                    done.stream_id,
                    StreamEvent::Completion {
                        final_sequence: done.final_sequence,
                    },
                );
            }
            MessageId::StreamError => {
                let Some(err) = StreamErrorHeader::read(body) else {
                    return;
                };
                let data = reader
                    .bytes_vector(BODY_OFFSET + StreamErrorHeader::DATA_FIELD)
                    .map(|d| d.to_vec())
                    .unwrap_or_default();
                self.deliver(
                    err.stream_id,
                    StreamEvent::Error {
                        code: err.error_code,
                        data,
                    },
                );
            }
            MessageId::StreamCancellation => {
                let Some(cancel) = StreamCancelBody::read(body) else {
                    return;
                };
                if let Some(flag) = self.producers.lock().get(&cancel.stream_id) {
                    flag.store(true, Ordering::Release);
                } else {
                    trace!(stream_id = cancel.stream_id, "cancel for unknown stream");
                }
            }
            _ => {}
        }
    }

    fn deliver(&self, stream_id: u64, event: StreamEvent) {
        let readers = self.readers.lock();
        match readers.get(&stream_id) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => trace!(stream_id, "frame for unregistered stream"),
        }
    }
}

fn init_message(init: StreamInitBody) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::StreamInitialization, MessageType::Request);
    fb.prepare(StreamInitBody::SIZE);
    fb.commit(StreamInitBody::SIZE);
    init.write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
    fb.finalize();
    fb
}

fn chunk_message(stream_id: u64, sequence: u64, window_size: u32, data: &[u8]) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::StreamDataChunk, MessageType::Request);
    fb.prepare(StreamChunkHeader::SIZE);
    fb.commit(StreamChunkHeader::SIZE);
    StreamChunkHeader {
        stream_id,
        sequence,
        window_size,
    }
    .write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
    write_bytes_vector(&mut fb, BODY_OFFSET + StreamChunkHeader::DATA_FIELD, data);
    fb.finalize();
    fb
}

fn completion_message(stream_id: u64, final_sequence: u64) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::StreamCompletion, MessageType::Request);
    fb.prepare(StreamCompletionBody::SIZE);
    fb.commit(StreamCompletionBody::SIZE);
    StreamCompletionBody {
        stream_id,
        final_sequence,
    }
    .write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
    fb.finalize();
    fb
}

fn error_message(stream_id: u64, error_code: u32, data: &[u8]) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::StreamError, MessageType::Request);
    fb.prepare(StreamErrorHeader::SIZE);
    fb.commit(StreamErrorHeader::SIZE);
    StreamErrorHeader {
        stream_id,
        error_code,
    }
    .write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
    write_bytes_vector(&mut fb, BODY_OFFSET + StreamErrorHeader::DATA_FIELD, data);
    fb.finalize();
    fb
}

fn cancel_message(stream_id: u64) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::StreamCancellation, MessageType::Request);
    fb.prepare(StreamCancelBody::SIZE);
    fb.commit(StreamCancelBody::SIZE);
    StreamCancelBody { stream_id }.write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
    fb.finalize();
    fb
}

impl Session {
    /// Open a server→client stream on this session: allocate a stream id,
    /// register the reader, send `StreamInitialization` and wait for the
    /// server's acknowledgement.
    pub async fn open_stream(
        &self,
        poa_idx: u16,
        interface_idx: u8,
        func_idx: u8,
        object_id: u64,
        timeout: Duration,
    ) -> Result<StreamReceiver, RpcError> {
        let stream_id = self.shared.streams.alloc_stream_id();
        let rx = self.shared.streams.register_reader(stream_id);
        let init = init_message(StreamInitBody {
            stream_id,
            poa_idx,
            interface_idx,
            object_id,
            func_idx,
        });
        match self.call(init, timeout).await {
            Ok(CallReply::Success) | Ok(CallReply::Block(_)) => Ok(StreamReceiver {
                session: self.clone(),
                stream_id,
                rx,
                reorder: BTreeMap::new(),
                next_expected: 0,
                final_sequence: None,
                state: StreamState::Open,
                last_window: DEFAULT_WINDOW,
            }),
            Err(e) => {
                self.shared.streams.unregister_reader(stream_id);
                Err(e)
            }
        }
    }
}

/// Consumer end of a stream. Delivers chunk payloads strictly in
/// sequence order; out-of-order arrivals wait in the reorder buffer.
#[derive(Debug)]
pub struct StreamReceiver {
    session: Session,
    stream_id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    reorder: BTreeMap<u64, Vec<u8>>,
    next_expected: u64,
    final_sequence: Option<u64>,
    state: StreamState,
    last_window: u32,
}

impl StreamReceiver {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Advisory credit last advertised by the producer.
    pub fn window_hint(&self) -> u32 {
        self.last_window
    }

    /// The next in-order chunk payload; `Ok(None)` after a clean
    /// completion. Suspends while the reorder buffer has no in-order
    /// element.
    pub async fn next(&mut self) -> Result<Option<Vec<u8>>, RpcError> {
        loop {
            if self.state == StreamState::Closed {
                return Ok(None);
            }
            if let Some(data) = self.reorder.remove(&self.next_expected) {
                self.next_expected += 1;
                return Ok(Some(data));
            }
            if self.state == StreamState::Closing {
                let final_sequence = self.final_sequence.unwrap_or(self.next_expected);
                if self.next_expected >= final_sequence {
                    self.close();
                    return Ok(None);
                }
                // Chunks precede the completion on a FIFO session; a gap
                // here means the producer lied about final_sequence.
                self.close();
                return Err(RpcError::comm("stream completed with missing chunks"));
            }

            match self.rx.recv().await {
                Some(StreamEvent::Chunk {
                    sequence,
                    data,
                    window,
                }) => {
                    self.last_window = window;
                    if sequence < self.next_expected || self.reorder.contains_key(&sequence) {
                        trace!(stream_id = self.stream_id, sequence, "dropping duplicate chunk");
                        continue;
                    }
                    self.reorder.insert(sequence, data);
                }
                Some(StreamEvent::Completion { final_sequence }) => {
                    self.state = StreamState::Closing;
                    self.final_sequence = Some(final_sequence);
                }
                Some(StreamEvent::Error { code, data }) => {
                    self.close();
                    return Err(RpcError::Exception {
                        exception_id: code,
                        message: data,
                    });
                }
                None => {
                    // Session teardown.
                    self.state = StreamState::Closed;
                    return Err(RpcError::closed());
                }
            }
        }
    }

    /// Tell the producer to stop and release the stream id.
    pub async fn cancel(mut self) -> Result<(), RpcError> {
        let msg = cancel_message(self.stream_id);
        self.close();
        self.session.post(msg).await
    }

    fn close(&mut self) {
        if self.state != StreamState::Closed {
            self.state = StreamState::Closed;
            self.session.shared.streams.unregister_reader(self.stream_id);
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if self.state != StreamState::Closed {
            self.session.try_post(cancel_message(self.stream_id));
            self.close();
        }
    }
}

/// Producer end of a stream, handed to the servant through the dispatch
/// context.
pub struct StreamWriter {
    session: Session,
    stream_id: u64,
    next_sequence: u64,
    window_size: u32,
    cancelled: Arc<AtomicBool>,
    finished: bool,
}

impl StreamWriter {
    pub(crate) fn new(session: Session, stream_id: u64, cancelled: Arc<AtomicBool>) -> Self {
        StreamWriter {
            session,
            stream_id,
            next_sequence: 0,
            window_size: DEFAULT_WINDOW,
            cancelled,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Consumer asked us to stop (or the session died).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Advisory window stamped into subsequent chunks.
    pub fn set_window(&mut self, window: u32) {
        self.window_size = window;
    }

    /// Emit one chunk with the next sequence number. Suspends when the
    /// session's send queue is at its highwater.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), RpcError> {
        if self.is_cancelled() {
            return Err(RpcError::comm("stream cancelled"));
        }
        let msg = chunk_message(self.stream_id, self.next_sequence, self.window_size, data);
        self.session.post(msg).await?;
        self.next_sequence += 1;
        Ok(())
    }

    /// Close cleanly; `final_sequence` is the number of chunks sent.
    pub async fn complete(mut self) -> Result<(), RpcError> {
        self.finished = true;
        let msg = completion_message(self.stream_id, self.next_sequence);
        self.session.shared.streams.unregister_producer(self.stream_id);
        self.session.post(msg).await
    }

    /// Close with an error surfaced to the consumer.
    pub async fn error(mut self, code: u32, data: &[u8]) -> Result<(), RpcError> {
        self.finished = true;
        let msg = error_message(self.stream_id, code, data);
        self.session.shared.streams.unregister_producer(self.stream_id);
        self.session.post(msg).await
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.finished {
            // A producer dying mid-stream surfaces as a stream error.
            self.session
                .try_post(error_message(self.stream_id, STREAM_FAULT_PRODUCER_DROPPED, &[]));
            self.session.shared.streams.unregister_producer(self.stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poa::{ObjectHost, PoaBuilder, PoaRegistry};
    use crate::{CallContext, DispatchFuture, Servant, Transport};
    use busard_protocol::ObjectFlags;
    use uuid::Uuid;

    fn test_registry() -> Arc<PoaRegistry> {
        Arc::new(PoaRegistry::new(Arc::new(ObjectHost::detached(
            Uuid::new_v4(),
        ))))
    }

    /// Streams `count` single-byte chunks `[0, 1, ..]` then completes.
    #[derive(Debug)]
    struct ByteStreamer;

    impl Servant for ByteStreamer {
        fn class_id(&self) -> &'static str {
            "ByteStreamer"
        }

        fn dispatch<'a>(&'a self, ctx: &'a mut CallContext) -> DispatchFuture<'a> {
            Box::pin(async move {
                let mut writer = ctx.take_stream().expect("stream dispatch");
                let count = ctx.call().function_idx as u64;
                for i in 0..count {
                    writer.send(&[i as u8]).await?;
                }
                writer.complete().await
            })
        }
    }

    async fn stream_setup() -> (Session, u64) {
        let registry = test_registry();
        let poa = registry.create_poa(PoaBuilder::new());
        let oid = poa
            .activate(Arc::new(ByteStreamer), ObjectFlags::empty())
            .unwrap();
        let (client_t, server_t) = Transport::mem_pair();
        let _server = Session::spawn(server_t, registry);
        let client = Session::spawn(client_t, test_registry());
        (client, oid.object_id)
    }

    #[tokio::test]
    async fn five_byte_stream_in_order() {
        let (client, object_id) = stream_setup().await;
        let mut stream = client
            .open_stream(0, 0, 5, object_id, Duration::from_secs(2))
            .await
            .unwrap();

        let mut got = Vec::new();
        while let Some(chunk) = stream.next().await.unwrap() {
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn empty_stream_completes_immediately() {
        let (client, object_id) = stream_setup().await;
        let mut stream = client
            .open_stream(0, 0, 0, object_id, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_none());
        // Closed streams stay closed.
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_to_missing_object_fails_at_init() {
        let (client, _object_id) = stream_setup().await;
        let err = client
            .open_stream(0, 0, 1, 0xDEAD, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind(),
            Some(busard_protocol::ErrorKind::ObjectNotExist)
        );
    }

    #[test]
    fn reorder_buffer_restores_sequence_order() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (client_t, _server_t) = Transport::mem_pair();
            let session = Session::spawn(client_t, test_registry());
            let rx = session.shared.streams.register_reader(9);
            let mut receiver = StreamReceiver {
                session: session.clone(),
                stream_id: 9,
                rx,
                reorder: BTreeMap::new(),
                next_expected: 0,
                final_sequence: None,
                state: StreamState::Open,
                last_window: DEFAULT_WINDOW,
            };

            // Deliver out of order: 1, 0, 2 then completion.
            for (seq, byte) in [(1u64, 1u8), (0, 0), (2, 2)] {
                session
                    .shared
                    .streams
                    .handle_frame(MessageId::StreamDataChunk, &chunk_message(9, seq, 1, &[byte]));
            }
            session
                .shared
                .streams
                .handle_frame(MessageId::StreamCompletion, &completion_message(9, 3));

            assert_eq!(receiver.next().await.unwrap(), Some(vec![0]));
            assert_eq!(receiver.next().await.unwrap(), Some(vec![1]));
            assert_eq!(receiver.next().await.unwrap(), Some(vec![2]));
            assert_eq!(receiver.next().await.unwrap(), None);
        });
    }

    #[test]
    fn duplicate_chunks_are_dropped() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (client_t, _server_t) = Transport::mem_pair();
            let session = Session::spawn(client_t, test_registry());
            let rx = session.shared.streams.register_reader(4);
            let mut receiver = StreamReceiver {
                session: session.clone(),
                stream_id: 4,
                rx,
                reorder: BTreeMap::new(),
                next_expected: 0,
                final_sequence: None,
                state: StreamState::Open,
                last_window: DEFAULT_WINDOW,
            };

            for _ in 0..3 {
                session
                    .shared
                    .streams
                    .handle_frame(MessageId::StreamDataChunk, &chunk_message(4, 0, 1, &[7]));
            }
            session
                .shared
                .streams
                .handle_frame(MessageId::StreamCompletion, &completion_message(4, 1));

            assert_eq!(receiver.next().await.unwrap(), Some(vec![7]));
            assert_eq!(receiver.next().await.unwrap(), None);
        });
    }

    #[tokio::test]
    async fn cancellation_reaches_the_producer() {
        #[derive(Debug)]
        struct Endless;

        impl Servant for Endless {
            fn class_id(&self) -> &'static str {
                "Endless"
            }

            fn dispatch<'a>(&'a self, ctx: &'a mut CallContext) -> DispatchFuture<'a> {
                Box::pin(async move {
                    let mut writer = ctx.take_stream().expect("stream dispatch");
                    loop {
                        if writer.is_cancelled() {
                            return writer.error(1, b"cancelled").await;
                        }
                        if writer.send(&[0]).await.is_err() {
                            return Ok(());
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
            }
        }

        let registry = test_registry();
        let poa = registry.create_poa(PoaBuilder::new());
        let oid = poa.activate(Arc::new(Endless), ObjectFlags::empty()).unwrap();
        let (client_t, server_t) = Transport::mem_pair();
        let _server = Session::spawn(server_t, registry);
        let client = Session::spawn(client_t, test_registry());

        let mut stream = client
            .open_stream(0, 0, 0, oid.object_id, Duration::from_secs(2))
            .await
            .unwrap();
        let _ = stream.next().await.unwrap();
        stream.cancel().await.unwrap();
        // The producer observes the flag and stops on its own schedule.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
