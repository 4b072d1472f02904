//! Reverse proxy to the upstream API server
//!
//! Terminal handler of the filter chain. Requests that got this far have
//! been admitted and their headers rewritten for impersonation; here the
//! URI is pointed at the upstream, forwarding headers are added and the
//! round-trip is performed over a pooled hyper client.
//!
//! The upstream is usually an in-cluster API server whose certificate is
//! issued by the cluster CA, so upstream certificates are not verified.
//! Connection upgrades (`kubectl exec`, `attach`, `port-forward`) are
//! tunnelled once the upstream answers `101 Switching Protocols`; tunnels
//! are closed when the server is asked to stop.
//!
//! Headers a caller lists in `Connection` are dropped by
//! [`connection_headers_middleware`] at the front of the chain, before
//! authentication rewrites the request. The handler never lets `Connection`
//! remove the credential or impersonation headers set for the upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::uri::{Authority, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::impersonate::IMPERSONATE_PREFIX;
use crate::metrics::ProxyMetrics;

pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_ORIGIN_HOST: HeaderName = HeaderName::from_static("x-origin-host");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_PROXY_VERSION: HeaderName = HeaderName::from_static("x-proxy-version");

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Forwards requests to a single upstream
#[derive(Clone)]
pub struct ReverseProxy {
    inner: Arc<Inner>,
    shutdown: Option<watch::Receiver<bool>>,
}

struct Inner {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    client: UpstreamClient,
    flush_interval: Duration,
    metrics: Arc<ProxyMetrics>,
}

impl ReverseProxy {
    /// Build a proxy for `upstream`.
    ///
    /// A zero `flush_interval` buffers each upstream response in full before
    /// replying; otherwise body frames are relayed as they arrive, which
    /// watch requests depend on.
    pub fn new(
        upstream: &Uri,
        flush_interval: Duration,
        dial_timeout: Duration,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self, ProxyError> {
        let scheme = upstream
            .scheme()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidConfig(format!("upstream {upstream} has no scheme")))?;
        let authority = upstream
            .authority()
            .cloned()
            .ok_or_else(|| ProxyError::InvalidConfig(format!("upstream {upstream} has no host")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                scheme,
                authority,
                base_path: upstream.path().trim_end_matches('/').to_string(),
                client: build_client(dial_timeout)?,
                flush_interval,
                metrics,
            }),
            shutdown: None,
        })
    }

    /// Close upgraded connections once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Router that sends every request to this proxy
    pub fn into_router(self) -> Router {
        Router::new().fallback(proxy_handler).with_state(self)
    }

    fn upstream_uri(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
        let path = join_paths(&self.inner.base_path, original.path());
        let path_and_query = match original.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };
        Uri::builder()
            .scheme(self.inner.scheme.clone())
            .authority(self.inner.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }

    async fn forward(&self, mut request: Request<Body>) -> Response {
        let client_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let upgrade = upgrade_protocol(request.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let uri = match self.upstream_uri(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "Cannot map request onto upstream");
                return (StatusCode::BAD_REQUEST, "Bad Request").into_response();
            }
        };

        let mut headers = parts.headers;
        let original_host = headers
            .get(header::HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        strip_hop_by_hop(&mut headers);
        if let Some(protocol) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
        self.set_forwarding_headers(&mut headers, original_host, client_addr);

        let mut upstream_request = Request::new(body);
        *upstream_request.method_mut() = parts.method;
        *upstream_request.uri_mut() = uri;
        *upstream_request.headers_mut() = headers;

        debug!(
            method = %upstream_request.method(),
            uri = %upstream_request.uri(),
            "Forwarding request upstream"
        );

        let response = match self.inner.client.request(upstream_request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(upstream = %self.inner.authority, error = %e, "Upstream request failed");
                self.inner.metrics.upstream_error();
                return bad_gateway();
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            return self.tunnel(client_upgrade, response);
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(X_PROXY_VERSION, proxy_version());

        let body = if self.inner.flush_interval.is_zero() {
            match body.collect().await {
                Ok(collected) => Body::from(collected.to_bytes()),
                Err(e) => {
                    warn!(error = %e, "Failed to read upstream response");
                    self.inner.metrics.upstream_error();
                    return bad_gateway();
                }
            }
        } else {
            Body::new(body)
        };

        Response::from_parts(parts, body)
    }

    fn set_forwarding_headers(
        &self,
        headers: &mut HeaderMap,
        original_host: Option<HeaderValue>,
        client_addr: Option<SocketAddr>,
    ) {
        if let Ok(upstream_host) = HeaderValue::from_str(self.inner.authority.as_str()) {
            headers.insert(header::HOST, upstream_host.clone());
            headers.insert(X_ORIGIN_HOST, upstream_host);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(addr) = client_addr {
            let ip = addr.ip().to_string();
            let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
                _ => ip,
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }
    }

    /// Join the caller's and the upstream's upgraded connections
    fn tunnel(&self, client_upgrade: Option<OnUpgrade>, mut upstream: Response<Incoming>) -> Response {
        let Some(client_upgrade) = client_upgrade else {
            warn!("Upstream switched protocols on a request that did not ask to upgrade");
            self.inner.metrics.upstream_error();
            return bad_gateway();
        };
        let upstream_upgrade = hyper::upgrade::on(&mut upstream);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let pump = async {
                let (client, upstream) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "Connection upgrade failed");
                        return;
                    }
                };
                let mut client = TokioIo::new(client);
                let mut upstream = TokioIo::new(upstream);
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => debug!(sent, received, "Upgraded connection closed"),
                    Err(e) => debug!(error = %e, "Upgraded connection ended with error"),
                }
            };

            tokio::select! {
                _ = pump => {}
                _ = shutdown_requested(shutdown) => {
                    debug!("Closing upgraded connection for shutdown");
                }
            }
        });

        let (mut parts, _) = upstream.into_parts();
        parts.headers.insert(X_PROXY_VERSION, proxy_version());
        Response::from_parts(parts, Body::empty())
    }
}

/// Drop the headers a caller names in `Connection` before any filter acts
/// on the request.
///
/// Standard hop-by-hop names stay for the proxy handler, which needs
/// `Upgrade` to tunnel.
pub async fn connection_headers_middleware(mut request: Request<Body>, next: Next) -> Response {
    for name in connection_named(request.headers()) {
        if !HOP_BY_HOP.contains(&name.as_str()) {
            request.headers_mut().remove(name);
        }
    }
    next.run(request).await
}

pub async fn proxy_handler(State(proxy): State<ReverseProxy>, request: Request<Body>) -> Response {
    proxy.forward(request).await
}

fn build_client(dial_timeout: Duration) -> Result<UpstreamClient, ProxyError> {
    let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
    .map_err(|e| ProxyError::Tls(e.to_string()))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(dial_timeout));
    http.set_nodelay(true);

    // HTTP/1.1 only: upgrades are not carried over h2
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Protocol named in `Upgrade` when `Connection` asks for an upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if wants_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn connection_named(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// Set by the chain for the upstream; `Connection` cannot remove these
fn is_protected(name: &HeaderName) -> bool {
    *name == header::AUTHORIZATION || name.as_str().starts_with(IMPERSONATE_PREFIX)
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in connection_named(headers) {
        if !is_protected(&name) {
            headers.remove(name);
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

async fn shutdown_requested(shutdown: Option<watch::Receiver<bool>>) {
    match shutdown {
        // A dropped sender counts as a stop
        Some(mut shutdown) => {
            let _ = shutdown.wait_for(|stop| *stop).await;
        }
        None => std::future::pending().await,
    }
}

fn proxy_version() -> HeaderValue {
    HeaderValue::from_static(crate::VERSION)
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

/// Accepts any upstream certificate
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
