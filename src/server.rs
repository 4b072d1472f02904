//! Proxy server lifecycle
//!
//! [`ProxyServer`] owns two listeners: the traffic listener, which runs the
//! full filter chain in front of the upstream, and the metrics listener,
//! which only exposes the registry. Both are served from background tasks
//! so `run` returns as soon as they are bound; `stop` asks both to stop
//! accepting and drain, and `wait` resolves once they have.
//!
//! ```text
//! Created --run--> Running --stop--> Stopping --drained--> Stopped
//!    '----------------------stop------------------------------^
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::authenticate::{authenticate_middleware, AuthState};
use crate::chain::FilterChain;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::health::health_middleware;
use crate::metrics::{metrics_middleware, metrics_router, ProxyMetrics};
use crate::netfilter::{netfilter_middleware, Netfilter, NetfilterState};
use crate::proxy_protocol;
use crate::reverse_proxy::{connection_headers_middleware, ReverseProxy};
use crate::tls;
use crate::verifier::Verifier;

/// Bound on reading a PROXY header or completing a TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Configuration validated, nothing bound yet
    Created,
    /// Listeners bound and serving
    Running,
    /// Stop requested, connections draining
    Stopping,
    /// Both listeners closed
    Stopped,
}

/// Authenticating proxy in front of one upstream API server
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    verifiers: Vec<Arc<dyn Verifier>>,
    netfilter: Netfilter,
    metrics: Arc<ProxyMetrics>,
    state: Arc<Mutex<ServerState>>,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    addr: Mutex<Option<SocketAddr>>,
    metrics_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    /// Validate `config` and attach `verifiers`, consulted in order.
    ///
    /// Nothing is bound until [`run`](Self::run).
    pub fn new(config: ProxyConfig, verifiers: Vec<Arc<dyn Verifier>>) -> Result<Self, ProxyError> {
        config.validate()?;
        if verifiers.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "at least one verifier is required".to_string(),
            ));
        }
        let netfilter = Netfilter::new(&config.allowed_ips)?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            verifiers,
            netfilter,
            metrics: Arc::new(ProxyMetrics::new()),
            state: Arc::new(Mutex::new(ServerState::Created)),
            started: AtomicBool::new(false),
            shutdown,
            addr: Mutex::new(None),
            metrics_addr: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Bound traffic address, once running
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.addr.lock()
    }

    /// Bound metrics address, once running
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        *self.metrics_addr.lock()
    }

    /// Build the traffic router: health, metrics, connection-header cleanup,
    /// netfilter, authenticate, then the reverse proxy.
    pub fn make_router(&self) -> Result<Router, ProxyError> {
        let upstream = self.config.upstream.uri()?;
        let proxy = ReverseProxy::new(
            &upstream,
            self.config.server.flush_interval(),
            self.config.upstream.dial_timeout(),
            self.metrics.clone(),
        )?
        .with_shutdown(self.shutdown.subscribe());

        let metrics = self.metrics.clone();
        let netfilter = NetfilterState {
            filter: self.netfilter.clone(),
            metrics: self.metrics.clone(),
        };
        let auth = AuthState::new(self.verifiers.clone(), self.metrics.clone());

        Ok(FilterChain::new()
            .use_filter(|router| router.layer(from_fn(health_middleware)))
            .use_filter(move |router| router.layer(from_fn_with_state(metrics, metrics_middleware)))
            .use_filter(|router| router.layer(from_fn(connection_headers_middleware)))
            .use_filter(move |router| {
                router.layer(from_fn_with_state(netfilter, netfilter_middleware))
            })
            .use_filter(move |router| router.layer(from_fn_with_state(auth, authenticate_middleware)))
            .build(proxy.into_router()))
    }

    /// Bind both listeners and start serving in the background.
    ///
    /// Returns once the listeners are bound; bind failures are returned here.
    pub async fn run(&self) -> Result<(), ProxyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted);
        }
        if self.state() != ServerState::Created {
            return Err(ProxyError::Stopped);
        }

        let server = &self.config.server;
        let listen = server
            .socket_addr()
            .map_err(|e| ProxyError::InvalidConfig(format!("listen address: {e}")))?;
        let metrics_listen = server
            .metrics_socket_addr()
            .map_err(|e| ProxyError::InvalidConfig(format!("metrics listen address: {e}")))?;

        let router = self.make_router()?;
        let tls = match (&server.tls_cert, &server.tls_key) {
            (Some(cert), Some(key)) if server.tls_enabled() => Some(tls::acceptor(cert, key)?),
            _ => None,
        };

        let traffic_listener = bind(listen).await?;
        let metrics_listener = bind(metrics_listen).await?;
        let traffic_addr = traffic_listener.local_addr()?;
        let metrics_addr = metrics_listener.local_addr()?;
        *self.addr.lock() = Some(traffic_addr);
        *self.metrics_addr.lock() = Some(metrics_addr);

        info!(
            addr = %traffic_addr,
            tls = tls.is_some(),
            proxy_protocol = server.enable_proxy_protocol,
            upstream = %self.config.upstream.url,
            "Proxy listening"
        );
        info!(addr = %metrics_addr, "Metrics listening");

        // Settled before any task exists; from here on only the supervisor
        // moves the state to Stopped.
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Created => *state = ServerState::Running,
                // stop() raced with startup; the servers will see the signal
                ServerState::Stopped => *state = ServerState::Stopping,
                _ => {}
            }
        }

        let drain_timeout = server.shutdown_timeout();
        let traffic = tokio::spawn(serve(
            "traffic",
            traffic_listener,
            router,
            ConnectionOptions {
                tls,
                proxy_protocol: server.enable_proxy_protocol,
            },
            self.shutdown.subscribe(),
            drain_timeout,
        ));
        let metrics = tokio::spawn(serve(
            "metrics",
            metrics_listener,
            metrics_router(self.metrics.clone()),
            ConnectionOptions::default(),
            self.shutdown.subscribe(),
            drain_timeout,
        ));

        let state = self.state.clone();
        let supervisor = tokio::spawn(async move {
            for (name, result) in [("traffic", traffic.await), ("metrics", metrics.await)] {
                if let Err(e) = result {
                    warn!(listener = name, error = %e, "Server task ended abnormally");
                }
            }
            *state.lock() = ServerState::Stopped;
            info!("Proxy server stopped");
        });
        *self.task.lock() = Some(supervisor);

        Ok(())
    }

    /// Ask both servers to stop accepting and drain.
    ///
    /// Safe to call any number of times, before or after `run`.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ServerState::Created => *state = ServerState::Stopped,
                ServerState::Running => *state = ServerState::Stopping,
                ServerState::Stopping | ServerState::Stopped => {}
            }
        }
        if !self.shutdown.send_replace(true) {
            info!("Proxy server shutting down");
        }
    }

    /// Resolve once both servers have stopped.
    ///
    /// Returns immediately when the server never ran.
    pub async fn wait(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Server supervisor ended abnormally");
            }
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ProxyError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })
}

#[derive(Clone, Default)]
struct ConnectionOptions {
    tls: Option<TlsAcceptor>,
    proxy_protocol: bool,
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accept loop for one listener; drains connections after the stop signal
async fn serve(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    options: ConnectionOptions,
    mut shutdown: watch::Receiver<bool>,
    drain_timeout: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        options.clone(),
                        router.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(listener = name, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(listener = name, open = connections.len(), "Draining connections");

    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        warn!(
            listener = name,
            timeout = ?drain_timeout,
            "Shutdown timeout elapsed, closing remaining connections"
        );
        connections.abort_all();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    options: ConnectionOptions,
    router: Router,
    shutdown: watch::Receiver<bool>,
) {
    let client = if options.proxy_protocol {
        match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            proxy_protocol::read_header(&mut stream, peer),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Rejected connection without a valid PROXY header");
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "Timed out waiting for PROXY header");
                return;
            }
        }
    } else {
        peer
    };

    match options.tls {
        Some(acceptor) => {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls_stream)) => serve_connection(tls_stream, router, client, shutdown).await,
                Ok(Err(e)) => debug!(client = %client, error = %e, "TLS handshake failed"),
                Err(_) => debug!(client = %client, "TLS handshake timed out"),
            }
        }
        None => serve_connection(stream, router, client, shutdown).await,
    }
}

async fn serve_connection<I>(
    io: I,
    router: Router,
    client: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router.map_request(
        move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(ConnectInfo(client));
            request
        },
    ));

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut draining = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    debug!(client = %client, error = %e, "Connection closed with error");
                }
                break;
            }
            _ = stopped(&mut shutdown), if !draining => {
                draining = true;
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}
