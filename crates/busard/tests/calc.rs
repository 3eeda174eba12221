//! End-to-end invocation tests over the real transports.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use busard::prelude::*;
use busard_protocol::{BODY_OFFSET, MessageId};

use support::{CALC_CLASS_ID, CalcFixture, CalcImpl, CalcProxy, EX_DIV_BY_ZERO, init_tracing};

#[tokio::test(flavor = "multi_thread")]
async fn echo_integer_exact_reply_bytes() {
    init_tracing();
    let server = Rpc::builder()
        .tcp_ephemeral()
        .hostname("127.0.0.1")
        .build()
        .await
        .unwrap();
    // An unused adapter first, so the calc lands on poa_idx 1.
    let _poa0 = server.create_poa(PoaBuilder::new());
    let poa1 = server.create_poa(PoaBuilder::new());
    let reference = poa1
        .activate(Arc::new(CalcImpl::default()), ObjectFlags::empty())
        .unwrap();

    assert_eq!(reference.class_id, CALC_CLASS_ID);
    assert_eq!(reference.poa_idx, 1);
    // slot 0, generation 1
    assert_eq!(reference.object_id, 0x0000_0001_0000_0000);

    let client = Rpc::builder().build().await.unwrap();
    let proxy = client
        .object_from_id(reference)
        .narrow::<CalcProxy>()
        .unwrap();

    let block = proxy.add_raw(2, 3).await.unwrap();
    let bytes = block.as_slice();
    let header = block.header().unwrap();
    assert_eq!(header.msg_id, MessageId::BlockResponse.as_u32());
    // 4-byte payload at offset 16: 05 00 00 00
    assert_eq!(&bytes[BODY_OFFSET..BODY_OFFSET + 4], &[0x05, 0x00, 0x00, 0x00]);

    client.shutdown();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn add_over_tcp() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();
    assert_eq!(proxy.add(2, 3).await.unwrap(), 5);
    assert_eq!(proxy.add(-7, 7).await.unwrap(), 0);
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn add_over_websocket() {
    let fixture = CalcFixture::over_websocket(CalcImpl::default()).await;
    let proxy = fixture.proxy();
    assert_eq!(proxy.add(40, 2).await.unwrap(), 42);
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn add_over_http() {
    let fixture = CalcFixture::over_http(CalcImpl::default()).await;
    let proxy = fixture.proxy();
    assert_eq!(proxy.add(20, 22).await.unwrap(), 42);
    // stateless: a second call is a fresh request
    assert_eq!(proxy.add(1, 1).await.unwrap(), 2);
    fixture.shutdown();
}

#[cfg(feature = "shm")]
#[tokio::test(flavor = "multi_thread")]
async fn add_over_shared_memory() {
    init_tracing();
    let channel = format!("calc-e2e-{}", std::process::id());
    let server = Rpc::builder()
        .mem_channel(&channel)
        .build()
        .await
        .unwrap();
    let poa = server.create_poa(PoaBuilder::new());
    let reference = poa
        .activate(Arc::new(CalcImpl::default()), ObjectFlags::empty())
        .unwrap();
    assert_eq!(reference.urls, format!("mem://{channel}"));

    let client = Rpc::builder().build().await.unwrap();
    let proxy = client
        .object_from_id(reference)
        .narrow::<CalcProxy>()
        .unwrap();
    assert_eq!(proxy.add(2, 3).await.unwrap(), 5);

    client.shutdown();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn narrow_rejects_wrong_class() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let mut wrong = fixture.reference.clone();
    wrong.class_id = "NotCalc".to_string();
    assert!(fixture.client.object_from_id(wrong).narrow::<CalcProxy>().is_none());
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn typed_exception_travels_end_to_end() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();
    assert_eq!(proxy.div(10, 2).await.unwrap(), 5);
    match proxy.div(1, 0).await.unwrap_err() {
        RpcError::Exception { exception_id, .. } => assert_eq!(exception_id, EX_DIV_BY_ZERO),
        other => panic!("expected exception, got {other:?}"),
    }
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_then_late_reply_is_dropped() {
    let fixture =
        CalcFixture::over_tcp(CalcImpl::slow_first_add(Duration::from_millis(1000))).await;
    let proxy = fixture.proxy();

    let started = Instant::now();
    let err = proxy
        .add_with_timeout(2, 3, Duration::from_millis(200))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert!(elapsed >= Duration::from_millis(190));
    assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");

    // The session is immediately usable for the next call.
    assert_eq!(proxy.add(2, 3).await.unwrap(), 5);

    // Let the late reply from the first call arrive; it must be dropped
    // without disturbing anything.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(proxy.add(4, 4).await.unwrap(), 8);

    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn reference_lifecycle_sends_one_add_and_one_release() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();
    let object_id = fixture.reference.object_id;

    proxy.object().add_ref().await.unwrap();
    proxy.object().add_ref().await.unwrap();
    // Two local handles, exactly one AddReference observed remotely.
    assert_eq!(fixture.poa.remote_refs(object_id), Some(1));

    proxy.object().release().await.unwrap();
    assert_eq!(fixture.poa.remote_refs(object_id), Some(1));

    proxy.object().release().await.unwrap();
    // Exactly one ReleaseObject: the transient object is now gone.
    assert_eq!(fixture.poa.remote_refs(object_id), None);
    assert!(fixture.poa.lookup(object_id).is_err());

    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn object_text_form_roundtrips_through_resolution() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let text = fixture.reference.to_text();
    let proxy = fixture
        .client
        .object_from_text(&text)
        .unwrap()
        .narrow::<CalcProxy>()
        .unwrap();
    assert_eq!(proxy.add(19, 23).await.unwrap(), 42);
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_after_server_shutdown_fail_with_comm_failure() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();
    assert_eq!(proxy.add(1, 2).await.unwrap(), 3);

    fixture.server.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = proxy.add(1, 2).await.unwrap_err();
    assert_eq!(err.error_kind(), Some(ErrorKind::CommFailure));
    fixture.client.shutdown();
}
