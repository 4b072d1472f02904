//! Configuration module with TOML parsing and validation
//!
//! The proxy configuration is loaded once at startup, optionally overridden
//! from the command line, validated, and then frozen behind an `Arc` for the
//! lifetime of the server. Nothing is hot-reloaded: verifiers, the network
//! allow-list and the upstream transport are all built from this snapshot.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::Uri;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProxyError;

/// Current config schema version supported by this binary
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// Issuer used by legacy Kubernetes service-account tokens
pub const SERVICE_ACCOUNT_ISSUER: &str = "kubernetes/serviceaccount";

/// Main proxy configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Config schema version (default 1; error if > CURRENT_CONFIG_VERSION)
    pub version: Option<u32>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Upstream API server
    pub upstream: UpstreamConfig,
    /// Identity provider settings
    pub idp: IdpConfig,
    /// Networks allowed to reach the proxy, in CIDR notation. Empty by
    /// default; allowing every client takes an explicit `0.0.0.0/0`.
    pub allowed_ips: Vec<String>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: Some(CURRENT_CONFIG_VERSION),
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            idp: IdpConfig::default(),
            allowed_ips: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the proxied traffic listener binds to
    pub listen: String,
    /// Address the Prometheus metrics listener binds to
    pub metrics_listen: String,
    /// Path to the TLS certificate chain (PEM). Must be paired with `tls_key`.
    pub tls_cert: Option<PathBuf>,
    /// Path to the TLS private key (PEM). Must be paired with `tls_cert`.
    pub tls_key: Option<PathBuf>,
    /// Expect a PROXY protocol (v1 or v2) header on every inbound connection
    pub enable_proxy_protocol: bool,
    /// How often streamed upstream responses are flushed, in milliseconds.
    /// Zero buffers each response until it completes, which breaks watches.
    pub flush_interval_ms: u64,
    /// Upper bound on draining both servers during shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:10443".to_string(),
            metrics_listen: "0.0.0.0:8080".to_string(),
            tls_cert: None,
            tls_key: None,
            enable_proxy_protocol: false,
            flush_interval_ms: 10,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Traffic listener socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.listen.parse()
    }

    /// Metrics listener socket address
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.metrics_listen.parse()
    }

    /// Both halves of the TLS pair are configured
    pub fn tls_enabled(&self) -> bool {
        !is_blank(&self.tls_cert) && !is_blank(&self.tls_key)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Upstream API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the Kubernetes API server
    pub url: String,
    /// File holding the credential the proxy presents upstream.
    /// Read once by [`ProxyConfig::load_upstream_token`].
    pub token_path: Option<PathBuf>,
    /// The credential itself; populated from `token_path` at startup
    #[serde(skip_serializing)]
    pub token: String,
    /// Connect timeout for upstream connections
    pub dial_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "https://kubernetes.default.svc.cluster.local".to_string(),
            token_path: None,
            token: String::new(),
            dial_timeout_secs: 10,
        }
    }
}

impl UpstreamConfig {
    /// Parse the upstream URL, requiring an http(s) scheme and an authority
    pub fn uri(&self) -> Result<Uri, ProxyError> {
        let uri: Uri = self.url.parse().map_err(|e| {
            ProxyError::InvalidConfig(format!("upstream url {:?} is invalid: {}", self.url, e))
        })?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(ProxyError::InvalidConfig(format!(
                    "upstream url {:?} must use http or https",
                    self.url
                )))
            }
        }
        if uri.authority().is_none() {
            return Err(ProxyError::InvalidConfig(format!(
                "upstream url {:?} has no host",
                self.url
            )));
        }
        Ok(uri)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// OAuth client ID expected in the token audience
    pub client_id: String,
    /// OpenID issuer / discovery URL
    pub server_url: String,
    /// PEM public key used to verify tokens signed by the cluster itself
    pub signing_ca: Option<PathBuf>,
    /// Issuer expected on tokens checked against `signing_ca`
    pub service_account_issuer: String,
    /// Candidate username claims, in priority order
    pub user_claims: Vec<String>,
    /// Candidate group claims, in priority order
    pub group_claims: Vec<String>,
    /// Bound on discovery and key-set retrieval at startup
    pub discovery_timeout_secs: u64,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            server_url: String::new(),
            signing_ca: None,
            service_account_issuer: SERVICE_ACCOUNT_ISSUER.to_string(),
            user_claims: vec![
                "preferred_username".to_string(),
                "email".to_string(),
                "name".to_string(),
            ],
            group_claims: vec!["groups".to_string()],
            discovery_timeout_secs: 10,
        }
    }
}

impl IdpConfig {
    /// Signing CA path, if one is configured and non-empty
    pub fn signing_ca_path(&self) -> Option<&Path> {
        self.signing_ca
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Emit JSON instead of human-readable lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn is_blank(path: &Option<PathBuf>) -> bool {
    path.as_ref().map_or(true, |p| p.as_os_str().is_empty())
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: ProxyConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        Ok(config)
    }

    /// Read the upstream credential from `upstream.token_path`, if set.
    ///
    /// Surrounding whitespace is trimmed so files written with a trailing
    /// newline work unchanged.
    pub fn load_upstream_token(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.upstream.token_path.as_ref() else {
            return Ok(());
        };
        let token = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read upstream token {:?}: {}", path, e))?;
        self.upstream.token = token.trim().to_string();
        if self.upstream.token.is_empty() {
            return Err(anyhow::anyhow!("Upstream token file {:?} is empty", path));
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ProxyError> {
        if let Some(v) = self.version {
            if v > CURRENT_CONFIG_VERSION {
                return Err(ProxyError::InvalidConfig(format!(
                    "config version {} is newer than this binary supports (max {})",
                    v, CURRENT_CONFIG_VERSION
                )));
            }
        }

        self.server.socket_addr().map_err(|e| {
            ProxyError::InvalidConfig(format!("invalid listen address {:?}: {}", self.server.listen, e))
        })?;
        self.server.metrics_socket_addr().map_err(|e| {
            ProxyError::InvalidConfig(format!(
                "invalid metrics listen address {:?}: {}",
                self.server.metrics_listen, e
            ))
        })?;

        if is_blank(&self.server.tls_cert) != is_blank(&self.server.tls_key) {
            return Err(ProxyError::InvalidConfig(
                "tls_cert and tls_key must be set together".to_string(),
            ));
        }

        if self.upstream.url.trim().is_empty() {
            return Err(ProxyError::InvalidConfig("no upstream url".to_string()));
        }
        self.upstream.uri()?;

        if self.idp.server_url.is_empty() && self.idp.signing_ca_path().is_none() {
            return Err(ProxyError::InvalidConfig(
                "either an identity provider url or a signing ca must be configured".to_string(),
            ));
        }
        if !self.idp.server_url.is_empty() && self.idp.client_id.is_empty() {
            return Err(ProxyError::InvalidConfig("missing client id".to_string()));
        }
        if self.idp.user_claims.iter().all(|c| c.trim().is_empty()) {
            return Err(ProxyError::InvalidConfig(
                "at least one username claim is required".to_string(),
            ));
        }

        if self.allowed_ips.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "at least one allowed network is required (use 0.0.0.0/0 to allow all)"
                    .to_string(),
            ));
        }

        if self.upstream.token.is_empty() && self.upstream.token_path.is_none() {
            warn!("No upstream token configured; requests reach the API server without credentials");
        }

        Ok(())
    }

    /// Boolean form of [`validate`](Self::validate)
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}
