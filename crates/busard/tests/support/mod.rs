//! Shared test fixtures: a hand-written rendition of what the stub
//! generator emits for a small `Calc` interface, plus runtime helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use busard::prelude::*;
use busard::{DispatchFuture, Session, StreamReceiver};
use busard_flat::{FlatBuffer, write_i32_at};
use busard_protocol::{BODY_OFFSET, CallHeader, MessageId, MessageType};

pub const CALC_CLASS_ID: &str = "Calc";

const INTERFACE_IDX: u8 = 0;
const FN_ADD: u8 = 0;
const FN_DIV: u8 = 1;
const FN_BYTE_STREAM: u8 = 2;

/// Exception id for division by zero, as the IDL would assign it.
pub const EX_DIV_BY_ZERO: u32 = 1;

const ARGS: usize = BODY_OFFSET + CallHeader::SIZE;

pub fn init_tracing() {
    busard::init_logging("info");
}

/// Client proxy for `Calc`, shaped like generated code.
#[derive(Clone, Debug)]
pub struct CalcProxy {
    object: ObjectPtr,
}

impl ProxyObject for CalcProxy {
    const CLASS_ID: &'static str = CALC_CLASS_ID;

    fn from_object(object: ObjectPtr) -> Self {
        CalcProxy { object }
    }
}

impl CalcProxy {
    pub fn object(&self) -> &ObjectPtr {
        &self.object
    }

    fn call_message(&self, function_idx: u8, args_size: usize) -> FlatBuffer {
        let target = self.object.object();
        let mut fb = FlatBuffer::begin(MessageId::FunctionCall, MessageType::Request);
        fb.prepare(CallHeader::SIZE + args_size);
        fb.commit(CallHeader::SIZE + args_size);
        CallHeader {
            poa_idx: target.poa_idx,
            interface_idx: INTERFACE_IDX,
            function_idx,
            object_id: target.object_id,
        }
        .write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
        fb
    }

    async fn binary_op(
        &self,
        function_idx: u8,
        a: i32,
        b: i32,
        timeout: Option<Duration>,
    ) -> Result<i32, RpcError> {
        let mut fb = self.call_message(function_idx, 8);
        write_i32_at(&mut fb, ARGS, a);
        write_i32_at(&mut fb, ARGS + 4, b);
        fb.finalize();

        let reply = match timeout {
            Some(timeout) => self.object.invoke_with_timeout(fb, timeout).await?,
            None => self.object.invoke(fb).await?,
        };
        let block = reply
            .into_block()
            .ok_or_else(|| RpcError::kind(ErrorKind::BadInput))?;
        let reader = busard_flat::Reader::new(block.as_slice())?;
        Ok(reader.i32_at(BODY_OFFSET)?)
    }

    pub async fn add(&self, a: i32, b: i32) -> Result<i32, RpcError> {
        self.binary_op(FN_ADD, a, b, None).await
    }

    pub async fn add_with_timeout(
        &self,
        a: i32,
        b: i32,
        timeout: Duration,
    ) -> Result<i32, RpcError> {
        self.binary_op(FN_ADD, a, b, Some(timeout)).await
    }

    pub async fn div(&self, a: i32, b: i32) -> Result<i32, RpcError> {
        self.binary_op(FN_DIV, a, b, None).await
    }

    /// Raw `Add` invocation returning the reply buffer, for byte-level
    /// assertions.
    pub async fn add_raw(&self, a: i32, b: i32) -> Result<FlatBuffer, RpcError> {
        let mut fb = self.call_message(FN_ADD, 8);
        write_i32_at(&mut fb, ARGS, a);
        write_i32_at(&mut fb, ARGS + 4, b);
        fb.finalize();
        self.object
            .invoke(fb)
            .await?
            .into_block()
            .ok_or_else(|| RpcError::kind(ErrorKind::BadInput))
    }

    /// Open the servant's byte stream on the proxy's session.
    pub async fn byte_stream(&self) -> Result<StreamReceiver, RpcError> {
        let target = self.object.object();
        let session: Session = self.object.session().await?;
        session
            .open_stream(
                target.poa_idx,
                INTERFACE_IDX,
                FN_BYTE_STREAM,
                target.object_id,
                Duration::from_secs(2),
            )
            .await
    }
}

/// Servant implementation; `delay_first_add` simulates slow user code on
/// the first `Add` only, and `stream_len` sizes the byte stream.
#[derive(Debug)]
pub struct CalcImpl {
    pub delay_first_add: Option<Duration>,
    delayed: std::sync::atomic::AtomicBool,
    pub stream_len: u8,
}

impl Default for CalcImpl {
    fn default() -> Self {
        CalcImpl {
            delay_first_add: None,
            delayed: std::sync::atomic::AtomicBool::new(false),
            stream_len: 5,
        }
    }
}

impl CalcImpl {
    pub fn slow_first_add(delay: Duration) -> Self {
        CalcImpl {
            delay_first_add: Some(delay),
            ..Self::default()
        }
    }
}

impl Servant for CalcImpl {
    fn class_id(&self) -> &'static str {
        CALC_CLASS_ID
    }

    fn dispatch<'a>(&'a self, ctx: &'a mut CallContext) -> DispatchFuture<'a> {
        Box::pin(async move {
            if ctx.call().interface_idx != INTERFACE_IDX {
                return Err(RpcError::kind(ErrorKind::UnknownFunctionIdx));
            }
            match ctx.call().function_idx {
                FN_ADD => {
                    let (a, b) = {
                        let reader = ctx.reader()?;
                        (reader.i32_at(ARGS)?, reader.i32_at(ARGS + 4)?)
                    };
                    if let Some(delay) = self.delay_first_add {
                        if !self.delayed.swap(true, std::sync::atomic::Ordering::AcqRel) {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    let fb = ctx.begin_reply();
                    let at = fb.size();
                    fb.prepare(4);
                    fb.commit(4);
                    write_i32_at(fb, at, a.wrapping_add(b));
                    Ok(())
                }
                FN_DIV => {
                    let (a, b) = {
                        let reader = ctx.reader()?;
                        (reader.i32_at(ARGS)?, reader.i32_at(ARGS + 4)?)
                    };
                    if b == 0 {
                        // Typed exception: id at offset 16, empty payload.
                        let mut message = vec![0u8; BODY_OFFSET + 4];
                        message[BODY_OFFSET..BODY_OFFSET + 4]
                            .copy_from_slice(&EX_DIV_BY_ZERO.to_le_bytes());
                        return Err(RpcError::Exception {
                            exception_id: EX_DIV_BY_ZERO,
                            message,
                        });
                    }
                    let fb = ctx.begin_reply();
                    let at = fb.size();
                    fb.prepare(4);
                    fb.commit(4);
                    write_i32_at(fb, at, a / b);
                    Ok(())
                }
                FN_BYTE_STREAM => {
                    let mut writer = ctx
                        .take_stream()
                        .ok_or_else(|| RpcError::kind(ErrorKind::BadInput))?;
                    for i in 0..self.stream_len {
                        writer.send(&[i]).await?;
                    }
                    writer.complete().await
                }
                _ => Err(RpcError::kind(ErrorKind::UnknownFunctionIdx)),
            }
        })
    }
}

/// A server runtime with one activated `Calc`, plus a detached client
/// runtime, connected over the given scheme.
pub struct CalcFixture {
    pub server: Rpc,
    pub client: Rpc,
    pub poa: Arc<Poa>,
    pub reference: ObjectId,
}

impl CalcFixture {
    pub async fn over_tcp(imp: CalcImpl) -> Self {
        Self::build(imp, |builder| builder.tcp_ephemeral()).await
    }

    pub async fn over_websocket(imp: CalcImpl) -> Self {
        Self::build(imp, |builder| builder.ws_ephemeral()).await
    }

    pub async fn over_http(imp: CalcImpl) -> Self {
        Self::build(imp, |builder| builder.http_ephemeral()).await
    }

    async fn build(imp: CalcImpl, listeners: impl FnOnce(RpcBuilder) -> RpcBuilder) -> Self {
        init_tracing();
        let server = listeners(Rpc::builder().hostname("127.0.0.1"))
            .build()
            .await
            .expect("server runtime");
        let poa = server.create_poa(PoaBuilder::new());
        let reference = poa
            .activate(Arc::new(imp), ObjectFlags::empty())
            .expect("activate calc");

        let client = Rpc::builder().build().await.expect("client runtime");
        CalcFixture {
            server,
            client,
            poa,
            reference,
        }
    }

    pub fn proxy(&self) -> CalcProxy {
        self.client
            .object_from_id(self.reference.clone())
            .narrow::<CalcProxy>()
            .expect("class id matches")
    }

    pub fn shutdown(&self) {
        self.client.shutdown();
        self.server.shutdown();
    }
}
