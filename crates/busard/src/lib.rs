//! busard: an object-oriented RPC runtime.
//!
//! Typed method invocations travel between processes as flat-buffer
//! messages over pluggable transports (TCP, WebSocket, HTTP, UDP, shared
//! memory). Servants live in bounded object adapters that mint
//! self-describing references; generated stubs marshal calls against
//! them, and servers can push ordered streams back to consumers over the
//! same session.
//!
//! ```ignore
//! use busard::prelude::*;
//!
//! let rpc = Rpc::builder()
//!     .tcp_port(9160)
//!     .hostname("calc.example.org")
//!     .build()
//!     .await?;
//! let poa = rpc.create_poa(PoaBuilder::new());
//! let reference = poa.activate(Arc::new(CalcImpl), ObjectFlags::empty())?;
//! println!("{}", reference.to_text());
//! ```

pub mod nameserver;

// Core surface.
pub use busard_core::{
    CallContext,
    CallReply,
    Config,
    DispatchFuture,
    Endpoint,
    EndpointParseError,
    ErrorKind,
    Lifespan,
    ObjectFlags,
    ObjectId,
    ObjectIdPolicy,
    ObjectPtr,
    Poa,
    PoaBuilder,
    PoaError,
    ProxyObject,
    Rpc,
    RpcBuilder,
    RpcError,
    Scheme,
    Servant,
    Session,
    ShmWakeup,
    StreamReceiver,
    StreamWriter,
    Transport,
    TransportError,
    UdpRetryConfig,
    DEFAULT_CALL_TIMEOUT,
    OBJECT_ID_WIRE_SIZE,
    parse_url_list,
    read_object_id,
    select_endpoint,
    write_object_id,
};

// Wire-format building blocks for generated code.
pub use busard_flat as flat;
pub use busard_protocol as protocol;

/// Convenient imports for embedders.
pub mod prelude {
    pub use crate::{
        CallContext, CallReply, ErrorKind, ObjectFlags, ObjectId, ObjectPtr, Poa, PoaBuilder,
        ProxyObject, Rpc, RpcBuilder, RpcError, Servant,
    };
    pub use std::sync::Arc;
}

/// Install a `tracing` subscriber honoring the configured log level.
/// `RUST_LOG` wins when set. Safe to call more than once; later calls
/// are no-ops.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Build a tokio runtime sized by `worker_thread_count`: 0 means a
/// current-thread runtime the embedder drives itself.
pub fn tokio_runtime(worker_thread_count: usize) -> std::io::Result<tokio::runtime::Runtime> {
    if worker_thread_count == 0 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_thread_count)
            .enable_all()
            .build()
    }
}
