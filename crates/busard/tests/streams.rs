//! Streaming over a live transport: ordered chunks, clean completion,
//! cancellation.

mod support;

use support::{CalcFixture, CalcImpl};

#[tokio::test(flavor = "multi_thread")]
async fn five_byte_stream_arrives_in_order() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();

    let mut stream = proxy.byte_stream().await.unwrap();
    let mut got = Vec::new();
    while let Some(chunk) = stream.next().await.unwrap() {
        got.extend_from_slice(&chunk);
    }
    assert_eq!(got, vec![0, 1, 2, 3, 4]);

    // Completed streams stay closed.
    assert!(stream.next().await.unwrap().is_none());
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_and_calls_share_a_session_without_interference() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();

    let mut stream = proxy.byte_stream().await.unwrap();
    // Interleave unary calls with stream consumption.
    assert_eq!(proxy.add(1, 1).await.unwrap(), 2);
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first, vec![0]);
    assert_eq!(proxy.add(2, 2).await.unwrap(), 4);

    let mut rest = Vec::new();
    while let Some(chunk) = stream.next().await.unwrap() {
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, vec![1, 2, 3, 4]);
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn consecutive_streams_reuse_the_session() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();

    for _ in 0..3 {
        let mut stream = proxy.byte_stream().await.unwrap();
        let mut got = Vec::new();
        while let Some(chunk) = stream.next().await.unwrap() {
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }
    fixture.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_midway_leaves_the_session_usable() {
    let fixture = CalcFixture::over_tcp(CalcImpl::default()).await;
    let proxy = fixture.proxy();

    let mut stream = proxy.byte_stream().await.unwrap();
    let _ = stream.next().await.unwrap();
    stream.cancel().await.unwrap();

    assert_eq!(proxy.add(3, 4).await.unwrap(), 7);
    fixture.shutdown();
}
