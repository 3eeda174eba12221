//! Runtime assembly: bind listeners on the chosen transports, mint the
//! advertised URL list, own the POAs and the outbound connection table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use busard_protocol::ObjectId;

use crate::poa::{ObjectHost, Poa, PoaBuilder, PoaRegistry};
use crate::{
    Config, Endpoint, ObjectPtr, RpcError, Scheme, Session, ShmWakeup, Transport, UdpRetryConfig,
};

/// How a transport's listener binds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum PortChoice {
    #[default]
    Disabled,
    Fixed(u16),
    /// Bind port 0 and advertise whatever the kernel assigned.
    Ephemeral,
}

impl PortChoice {
    fn requested(&self) -> Option<u16> {
        match self {
            PortChoice::Disabled => None,
            PortChoice::Fixed(port) => Some(*port),
            PortChoice::Ephemeral => Some(0),
        }
    }
}

/// Builds an [`Rpc`] instance. Transports default to disabled; a port of
/// 0 keeps a transport off, matching the configuration contract.
pub struct RpcBuilder {
    config: Config,
    tcp: PortChoice,
    udp: PortChoice,
    ws: PortChoice,
    http: PortChoice,
}

impl Default for RpcBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcBuilder {
    pub fn new() -> Self {
        RpcBuilder {
            config: Config::default(),
            tcp: PortChoice::Disabled,
            udp: PortChoice::Disabled,
            ws: PortChoice::Disabled,
            http: PortChoice::Disabled,
        }
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp = if port == 0 {
            PortChoice::Disabled
        } else {
            PortChoice::Fixed(port)
        };
        self
    }

    /// Listen on a kernel-assigned TCP port (tests, single-host setups).
    pub fn tcp_ephemeral(mut self) -> Self {
        self.tcp = PortChoice::Ephemeral;
        self
    }

    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp = if port == 0 {
            PortChoice::Disabled
        } else {
            PortChoice::Fixed(port)
        };
        self
    }

    pub fn udp_ephemeral(mut self) -> Self {
        self.udp = PortChoice::Ephemeral;
        self
    }

    pub fn ws_port(mut self, port: u16) -> Self {
        self.ws = if port == 0 {
            PortChoice::Disabled
        } else {
            PortChoice::Fixed(port)
        };
        self
    }

    pub fn ws_ephemeral(mut self) -> Self {
        self.ws = PortChoice::Ephemeral;
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.http = if port == 0 {
            PortChoice::Disabled
        } else {
            PortChoice::Fixed(port)
        };
        self
    }

    pub fn http_ephemeral(mut self) -> Self {
        self.http = PortChoice::Ephemeral;
        self
    }

    pub fn http_ssl(mut self, enabled: bool, cert_file: Option<String>, key_file: Option<String>) -> Self {
        self.config.http_ssl_enabled = enabled;
        self.config.http_cert_file = cert_file;
        self.config.http_key_file = key_file;
        self
    }

    /// Serve a shared-memory channel under `mem://<channel>`.
    pub fn mem_channel(mut self, channel: impl Into<String>) -> Self {
        self.config.mem_channel = Some(channel.into());
        self
    }

    /// Hostname advertised in minted object URLs.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Pin the origin UUID (persistent references need a stable one).
    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.config.uuid = uuid;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Advisory worker pool size; 0 leaves scheduling to the embedder's
    /// executor.
    pub fn worker_thread_count(mut self, count: usize) -> Self {
        self.config.worker_thread_count = count;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn udp_retry(mut self, retry: UdpRetryConfig) -> Self {
        self.config.udp_retry = retry;
        self
    }

    pub fn shm_wakeup(mut self, wakeup: ShmWakeup) -> Self {
        self.config.shm_wakeup = wakeup;
        self
    }

    /// Bind the configured listeners and assemble the runtime.
    pub async fn build(mut self) -> Result<Rpc, RpcError> {
        if self.config.http_ssl_enabled {
            return Err(RpcError::comm(
                "https serving requires an embedder-provided tls acceptor",
            ));
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut urls: Vec<String> = Vec::new();
        let host = self.config.hostname.clone();

        // Sessions accepted by listeners land here once the registry
        // exists; listeners are spawned afterwards against bound sockets.
        let server_sessions: Arc<Mutex<Vec<Session>>> = Arc::new(Mutex::new(Vec::new()));

        #[cfg(feature = "shm")]
        let shm_listener = match &self.config.mem_channel {
            Some(channel) => {
                let listener = crate::transport::shm::ShmListener::create(
                    channel,
                    self.config.uuid,
                    self.config.shm_wakeup,
                )?;
                urls.push(format!("mem://{channel}"));
                Some(listener)
            }
            None => None,
        };

        #[cfg(feature = "tcp")]
        let tcp_listener = match self.tcp.requested() {
            Some(port) => {
                let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                    .await
                    .map_err(|e| RpcError::comm(format!("tcp bind: {e}")))?;
                let port = listener
                    .local_addr()
                    .map_err(|e| RpcError::comm(format!("tcp addr: {e}")))?
                    .port();
                self.config.tcp_port = port;
                urls.push(format!("tcp://{host}:{port}"));
                Some(listener)
            }
            None => None,
        };

        #[cfg(feature = "websocket")]
        let ws_listener = match self.ws.requested() {
            Some(port) => {
                let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                    .await
                    .map_err(|e| RpcError::comm(format!("ws bind: {e}")))?;
                let port = listener
                    .local_addr()
                    .map_err(|e| RpcError::comm(format!("ws addr: {e}")))?
                    .port();
                self.config.ws_port = port;
                urls.push(format!("ws://{host}:{port}"));
                Some(listener)
            }
            None => None,
        };

        #[cfg(feature = "http")]
        let http_listener = match self.http.requested() {
            Some(port) => {
                let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                    .await
                    .map_err(|e| RpcError::comm(format!("http bind: {e}")))?;
                let port = listener
                    .local_addr()
                    .map_err(|e| RpcError::comm(format!("http addr: {e}")))?
                    .port();
                self.config.http_port = port;
                urls.push(format!("http://{host}:{port}"));
                Some(listener)
            }
            None => None,
        };

        #[cfg(feature = "udp")]
        let udp_listener = match self.udp.requested() {
            Some(port) => {
                let listener = crate::transport::udp::UdpListener::bind(port).await?;
                let port = listener.local_addr().port();
                self.config.udp_port = port;
                urls.push(format!("udp://{host}:{port}"));
                Some(listener)
            }
            None => None,
        };

        let registry = Arc::new(PoaRegistry::new(Arc::new(ObjectHost {
            origin: self.config.uuid,
            urls: urls.join(";"),
        })));

        #[cfg(feature = "shm")]
        if let Some(listener) = shm_listener {
            let registry = registry.clone();
            let sessions = server_sessions.clone();
            tasks.push(tokio::spawn(async move {
                if let Ok(transport) = listener.accept().await {
                    let session = Session::spawn(Transport::Shm(transport), registry);
                    sessions.lock().push(session);
                }
            }));
        }

        #[cfg(feature = "tcp")]
        if let Some(listener) = tcp_listener {
            info!(port = self.config.tcp_port, "tcp listener up");
            let registry = registry.clone();
            let sessions = server_sessions.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            info!(%peer, "accepted tcp connection");
                            let transport =
                                Transport::Tcp(crate::transport::tcp::TcpTransport::new(stream));
                            let session = Session::spawn(transport, registry.clone());
                            sessions.lock().push(session);
                        }
                        Err(e) => {
                            warn!(error = %e, "tcp accept failed");
                            break;
                        }
                    }
                }
            }));
        }

        #[cfg(feature = "websocket")]
        if let Some(listener) = ws_listener {
            info!(port = self.config.ws_port, "websocket listener up");
            let registry = registry.clone();
            let sessions = server_sessions.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            let registry = registry.clone();
                            let sessions = sessions.clone();
                            tokio::spawn(async move {
                                match crate::transport::websocket::WebSocketTransport::accept(
                                    stream,
                                )
                                .await
                                {
                                    Ok(transport) => {
                                        info!(%peer, "accepted websocket connection");
                                        let session = Session::spawn(
                                            Transport::WebSocket(transport),
                                            registry,
                                        );
                                        sessions.lock().push(session);
                                    }
                                    Err(e) => warn!(%peer, error = %e, "websocket handshake failed"),
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "websocket accept failed");
                            break;
                        }
                    }
                }
            }));
        }

        #[cfg(feature = "http")]
        if let Some(listener) = http_listener {
            info!(port = self.config.http_port, "http listener up");
            let router = http_router(registry.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).await {
                    warn!(error = %e, "http server stopped");
                }
            }));
        }

        #[cfg(feature = "udp")]
        if let Some(listener) = udp_listener {
            info!(port = self.config.udp_port, "udp listener up");
            let registry = registry.clone();
            let sessions = server_sessions.clone();
            tasks.push(tokio::spawn(async move {
                while let Ok(transport) = listener.accept().await {
                    let session = Session::spawn(Transport::Udp(transport), registry.clone());
                    sessions.lock().push(session);
                }
            }));
        }

        Ok(Rpc {
            shared: Arc::new(RpcShared {
                config: self.config,
                registry,
                connections: Mutex::new(HashMap::new()),
                server_sessions,
                listener_tasks: Mutex::new(tasks),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

/// The assembled runtime: listener set, POAs, connection table.
#[derive(Clone)]
pub struct Rpc {
    shared: Arc<RpcShared>,
}

pub(crate) struct RpcShared {
    config: Config,
    registry: Arc<PoaRegistry>,
    connections: Mutex<HashMap<Endpoint, Session>>,
    server_sessions: Arc<Mutex<Vec<Session>>>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("origin", &self.shared.config.uuid)
            .finish_non_exhaustive()
    }
}

impl Rpc {
    pub fn builder() -> RpcBuilder {
        RpcBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn origin(&self) -> Uuid {
        self.shared.config.uuid
    }

    /// The advertised URL list minted into activated references.
    pub fn urls(&self) -> String {
        self.shared.registry.host().urls.clone()
    }

    pub fn call_timeout(&self) -> Duration {
        self.shared.config.call_timeout
    }

    pub fn udp_retry(&self) -> UdpRetryConfig {
        self.shared.config.udp_retry
    }

    pub fn create_poa(&self, builder: PoaBuilder) -> Arc<Poa> {
        self.shared.registry.create_poa(builder)
    }

    /// Schemes this runtime can dial, in no particular order.
    pub fn dialable_schemes(&self) -> Vec<Scheme> {
        let mut schemes = Vec::new();
        #[cfg(feature = "shm")]
        schemes.push(Scheme::Mem);
        #[cfg(feature = "tcp")]
        schemes.push(Scheme::Tcp);
        #[cfg(feature = "websocket")]
        {
            schemes.push(Scheme::Ws);
            schemes.push(Scheme::Wss);
        }
        #[cfg(feature = "http")]
        {
            schemes.push(Scheme::Http);
            schemes.push(Scheme::Https);
        }
        #[cfg(feature = "udp")]
        schemes.push(Scheme::Udp);
        schemes
    }

    /// Wrap a reference for invocation through this runtime.
    pub fn object_from_id(&self, object: ObjectId) -> ObjectPtr {
        ObjectPtr::new(object, self.clone())
    }

    /// Wrap a reference that arrived on `session`; tethered references
    /// stay pinned to it.
    pub fn object_from_id_on(&self, object: ObjectId, session: &Session) -> ObjectPtr {
        if object.is_tethered() {
            ObjectPtr::tethered(object, session.clone())
        } else {
            ObjectPtr::new(object, self.clone())
        }
    }

    /// Parse the canonical text form and wrap it.
    pub fn object_from_text(&self, text: &str) -> Result<ObjectPtr, RpcError> {
        let object = ObjectId::from_text(text)
            .map_err(|e| RpcError::comm(format!("bad object reference: {e}")))?;
        Ok(self.object_from_id(object))
    }

    /// A session to `endpoint`: cached when alive, freshly dialed
    /// otherwise. TCP-like transports reconnect lazily here on the next
    /// call after a failure.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<Session, RpcError> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(RpcError::closed());
        }
        if let Some(session) = self.shared.connections.lock().get(endpoint) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }

        let transport = self.dial(endpoint).await?;
        let session = Session::spawn(transport, self.shared.registry.clone());

        let mut connections = self.shared.connections.lock();
        // Lost the race to another dialer: keep the existing live session.
        if let Some(existing) = connections.get(endpoint) {
            if !existing.is_closed() {
                session.fail("superseded by concurrent dial");
                return Ok(existing.clone());
            }
        }
        connections.insert(endpoint.clone(), session.clone());
        Ok(session)
    }

    async fn dial(&self, endpoint: &Endpoint) -> Result<Transport, RpcError> {
        match endpoint.scheme {
            #[cfg(feature = "tcp")]
            Scheme::Tcp => Ok(Transport::Tcp(
                crate::transport::tcp::TcpTransport::connect(&endpoint.host, endpoint.port)
                    .await?,
            )),
            #[cfg(feature = "websocket")]
            Scheme::Ws | Scheme::Wss => {
                let url = endpoint.to_string();
                Ok(Transport::WebSocket(
                    crate::transport::websocket::WebSocketTransport::connect(&url).await?,
                ))
            }
            #[cfg(feature = "http")]
            Scheme::Http | Scheme::Https => Ok(Transport::Http(
                crate::transport::http::HttpClientTransport::new(endpoint)?,
            )),
            #[cfg(feature = "udp")]
            Scheme::Udp => Ok(Transport::Udp(
                crate::transport::udp::UdpTransport::connect(&endpoint.host, endpoint.port)
                    .await?,
            )),
            #[cfg(feature = "shm")]
            Scheme::Mem => Ok(Transport::Shm(crate::transport::shm::ShmTransport::connect(
                endpoint.channel(),
                self.shared.config.uuid,
                self.shared.config.shm_wakeup,
            )?)),
            other => Err(RpcError::comm(format!(
                "no transport available for {other} endpoints"
            ))),
        }
    }

    /// Close listeners and every session. Pending calls complete with
    /// `CommFailure("connection closed")`.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("rpc runtime shutting down");
        for task in self.shared.listener_tasks.lock().drain(..) {
            task.abort();
        }
        for session in self.shared.server_sessions.lock().drain(..) {
            session.fail("connection closed");
        }
        let connections: Vec<_> = {
            let mut map = self.shared.connections.lock();
            map.drain().map(|(_, s)| s).collect()
        };
        for session in connections {
            session.fail("connection closed");
        }
    }
}

/// The HTTP acceptor: a single `POST /rpc` route forwarding bodies
/// verbatim to the dispatcher.
#[cfg(feature = "http")]
pub(crate) fn http_router(registry: Arc<PoaRegistry>) -> axum::Router {
    use axum::Router;
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::post;

    async fn rpc_handler(
        State(registry): State<Arc<PoaRegistry>>,
        body: bytes::Bytes,
    ) -> impl IntoResponse {
        let reply = crate::session::dispatch_oneshot(&registry, body.to_vec()).await;
        (
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            reply.into_bytes(),
        )
    }

    Router::new()
        .route(crate::transport::http::RPC_ROUTE, post(rpc_handler))
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_transports_mint_no_urls() {
        let rpc = Rpc::builder().build().await.unwrap();
        assert!(rpc.urls().is_empty());
        assert_eq!(rpc.config().tcp_port, 0);
        rpc.shutdown();
    }

    #[tokio::test]
    async fn ephemeral_tcp_advertises_bound_port() {
        let rpc = Rpc::builder()
            .tcp_ephemeral()
            .hostname("127.0.0.1")
            .build()
            .await
            .unwrap();
        let port = rpc.config().tcp_port;
        assert_ne!(port, 0);
        assert_eq!(rpc.urls(), format!("tcp://127.0.0.1:{port}"));
        rpc.shutdown();
    }

    #[tokio::test]
    async fn ssl_without_acceptor_is_refused() {
        let err = Rpc::builder()
            .http_ephemeral()
            .http_ssl(true, Some("cert.pem".into()), Some("key.pem".into()))
            .build()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tls"));
    }
}
