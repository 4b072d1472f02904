//! Network allow-list middleware
//!
//! Requests are admitted only when the client address falls inside one of
//! the configured networks. The list is parsed once at construction; an
//! empty list admits nobody, so allowing everything takes an explicit
//! `0.0.0.0/0` (and `::/0` for IPv6).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ipnet::IpNet;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::metrics::ProxyMetrics;

/// Parsed CIDR allow-list
#[derive(Debug, Clone)]
pub struct Netfilter {
    networks: Arc<[IpNet]>,
}

impl Netfilter {
    /// Parse `cidrs`; any unparsable entry fails construction.
    ///
    /// A bare address is accepted as a single-host network.
    pub fn new<S: AsRef<str>>(cidrs: &[S]) -> Result<Self, ProxyError> {
        let networks = cidrs
            .iter()
            .map(|cidr| parse_network(cidr.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        if networks.is_empty() {
            warn!("Network allow-list is empty; all requests will be denied");
        }

        Ok(Self {
            networks: networks.into(),
        })
    }

    /// Whether `ip` is inside any allowed network.
    ///
    /// IPv4-mapped IPv6 addresses are matched as their IPv4 form.
    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }
}

fn parse_network(value: &str) -> Result<IpNet, ProxyError> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    let invalid = || ProxyError::InvalidCidr {
        value: value.to_string(),
    };
    match value.parse::<IpAddr>().map_err(|_| invalid())? {
        IpAddr::V4(v4) => ipnet::Ipv4Net::new(v4, 32).map(IpNet::V4),
        IpAddr::V6(v6) => ipnet::Ipv6Net::new(v6, 128).map(IpNet::V6),
    }
    .map_err(|_| invalid())
}

/// State for [`netfilter_middleware`]
#[derive(Clone)]
pub struct NetfilterState {
    pub filter: Netfilter,
    pub metrics: Arc<ProxyMetrics>,
}

/// Deny requests whose client address is outside the allow-list.
///
/// Requests without connection info are denied.
pub async fn netfilter_middleware(
    State(state): State<NetfilterState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(&ConnectInfo(client_addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>()
    else {
        warn!("Request without a client address, denying");
        state.metrics.netfilter_denied();
        return forbidden();
    };

    if !state.filter.allows(client_addr.ip()) {
        debug!(client = %client_addr, "Client address not in allow-list");
        state.metrics.netfilter_denied();
        return forbidden();
    }

    next.run(request).await
}

pub(crate) fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Forbidden").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[test]
    fn test_invalid_cidr() {
        let err = Netfilter::new(&["10.0.0.0/8", "invalid value"]).unwrap_err();
        assert!(err.to_string().contains("invalid CIDR notation"));
    }

    #[test]
    fn test_empty_list_denies_all() {
        let filter = Netfilter::new::<&str>(&[]).unwrap();
        assert!(!filter.allows("127.0.0.1".parse().unwrap()));
        assert!(!filter.allows("::1".parse().unwrap()));
    }

    #[test]
    fn test_matching() {
        let filter = Netfilter::new(&["127.0.0.1/8", "10.10.0.0/16", "fd00::/8"]).unwrap();
        assert!(filter.allows("127.0.0.1".parse().unwrap()));
        assert!(filter.allows("127.200.3.4".parse().unwrap()));
        assert!(filter.allows("10.10.255.1".parse().unwrap()));
        assert!(!filter.allows("10.11.0.1".parse().unwrap()));
        assert!(filter.allows("fd12::1".parse().unwrap()));
        assert!(!filter.allows("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_allow_all_and_bare_address() {
        let filter = Netfilter::new(&["0.0.0.0/0"]).unwrap();
        assert!(filter.allows("8.8.8.8".parse().unwrap()));

        let filter = Netfilter::new(&["1.2.3.4"]).unwrap();
        assert!(filter.allows("1.2.3.4".parse().unwrap()));
        assert!(!filter.allows("1.2.3.5".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_mapped_address() {
        let filter = Netfilter::new(&["127.0.0.0/8"]).unwrap();
        assert!(filter.allows("::ffff:127.0.0.1".parse().unwrap()));
    }

    fn app(cidrs: &[&str], metrics: Arc<ProxyMetrics>) -> Router {
        let state = NetfilterState {
            filter: Netfilter::new(cidrs).unwrap(),
            metrics,
        };
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state, netfilter_middleware))
    }

    fn request_from(addr: &str) -> Request<Body> {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[tokio::test]
    async fn test_middleware_allows_and_denies() {
        let metrics = Arc::new(ProxyMetrics::new());

        let response = app(&["127.0.0.1/8"], metrics.clone())
            .oneshot(request_from("127.0.0.1:40000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&["1.2.3.4/32"], metrics.clone())
            .oneshot(request_from("127.0.0.1:40000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(metrics.snapshot().netfilter_denied, 1);
    }

    #[tokio::test]
    async fn test_middleware_denies_without_client_address() {
        let metrics = Arc::new(ProxyMetrics::new());
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app(&["0.0.0.0/0"], metrics).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
