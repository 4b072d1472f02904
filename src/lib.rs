//! kube-auth-proxy - authenticating reverse proxy for the Kubernetes API
//!
//! The proxy:
//! - Verifies bearer tokens against an OpenID Connect provider or a static
//!   signing key (e.g. the cluster's service-account key)
//! - Turns the verified identity into Kubernetes impersonation headers and
//!   presents its own credential upstream
//! - Restricts callers to an allow-list of networks
//! - Exposes Prometheus metrics on a separate listener
//!
//! Requests pass a fixed filter chain: health, metrics, connection-header
//! cleanup, netfilter, authenticate, then the reverse proxy.

pub mod authenticate;
pub mod chain;
pub mod claims;
pub mod config;
pub mod error;
pub mod health;
pub mod impersonate;
pub mod metrics;
pub mod netfilter;
pub mod proxy_protocol;
pub mod reverse_proxy;
pub mod server;
pub mod tls;
pub mod verifier;

// Re-export commonly used types
pub use claims::Claims;
pub use config::ProxyConfig;
pub use error::{ProxyError, VerifyError};
pub use impersonate::{Identity, Impersonation};
pub use metrics::ProxyMetrics;
pub use netfilter::Netfilter;
pub use server::{ProxyServer, ServerState};
pub use verifier::{OpenIdVerifier, StaticKeyVerifier, Verifier};

/// Library version, returned to callers as `X-Proxy-Version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
