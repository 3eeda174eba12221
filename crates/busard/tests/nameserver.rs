//! Name resolution: bind a reference, resolve it from another runtime,
//! invoke through the resolved proxy.

mod support;

use std::sync::Arc;

use busard::nameserver::{InMemoryNameserver, NameserverProxy};
use busard::prelude::*;

use support::{CalcImpl, CalcProxy, init_tracing};

#[tokio::test(flavor = "multi_thread")]
async fn bind_resolve_invoke() {
    init_tracing();
    let server = Rpc::builder()
        .tcp_ephemeral()
        .hostname("127.0.0.1")
        .build()
        .await
        .unwrap();
    let poa = server.create_poa(PoaBuilder::new());

    let calc_ref = poa
        .activate(Arc::new(CalcImpl::default()), ObjectFlags::empty())
        .unwrap();
    let ns_ref = poa
        .activate(InMemoryNameserver::new().into_servant(), ObjectFlags::empty())
        .unwrap();

    let client = Rpc::builder().build().await.unwrap();
    let ns = client
        .object_from_id(ns_ref)
        .narrow::<NameserverProxy>()
        .unwrap();

    // Nothing bound yet.
    assert!(ns.resolve("calc").await.unwrap().is_none());

    ns.bind(&calc_ref, "calc").await.unwrap();

    let resolved = ns.resolve("calc").await.unwrap().expect("hit");
    assert_eq!(resolved.class_id(), "Calc");
    let calc = resolved.narrow::<CalcProxy>().expect("narrow to Calc");
    assert_eq!(calc.add(2, 3).await.unwrap(), 5);

    // The resolved reference is not a nameserver.
    assert!(resolved.narrow::<NameserverProxy>().is_none());

    client.shutdown();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn rebinding_replaces_the_entry() {
    init_tracing();
    let server = Rpc::builder()
        .tcp_ephemeral()
        .hostname("127.0.0.1")
        .build()
        .await
        .unwrap();
    let poa = server.create_poa(PoaBuilder::new());

    let first = poa
        .activate(Arc::new(CalcImpl::default()), ObjectFlags::empty())
        .unwrap();
    let second = poa
        .activate(Arc::new(CalcImpl::default()), ObjectFlags::empty())
        .unwrap();
    let ns_ref = poa
        .activate(InMemoryNameserver::new().into_servant(), ObjectFlags::empty())
        .unwrap();

    let client = Rpc::builder().build().await.unwrap();
    let ns = client
        .object_from_id(ns_ref)
        .narrow::<NameserverProxy>()
        .unwrap();

    ns.bind(&first, "calc").await.unwrap();
    ns.bind(&second, "calc").await.unwrap();

    let resolved = ns.resolve("calc").await.unwrap().expect("hit");
    assert_eq!(resolved.object().object_id, second.object_id);

    client.shutdown();
    server.shutdown();
}
