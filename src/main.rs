//! kube-auth-proxy - authenticating reverse proxy for the Kubernetes API
//!
//! Loads the configuration, discovers the identity providers, then serves
//! until SIGINT/SIGTERM and drains.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kube_auth_proxy::config::ProxyConfig;
use kube_auth_proxy::server::ProxyServer;
use kube_auth_proxy::verifier;

/// Authenticating reverse proxy for the Kubernetes API server
#[derive(Parser, Debug)]
#[command(name = "kube-auth-proxy")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "KUBE_AUTH_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Traffic listen address
    #[arg(long, env = "KUBE_AUTH_PROXY_LISTEN")]
    listen: Option<String>,

    /// Metrics listen address
    #[arg(long, env = "KUBE_AUTH_PROXY_METRICS_LISTEN")]
    metrics_listen: Option<String>,

    /// TLS certificate for the traffic listener
    #[arg(long, env = "KUBE_AUTH_PROXY_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key for the traffic listener
    #[arg(long, env = "KUBE_AUTH_PROXY_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Expect a PROXY protocol header on every connection
    #[arg(long, env = "KUBE_AUTH_PROXY_ENABLE_PROXY_PROTOCOL")]
    enable_proxy_protocol: bool,

    /// Upstream API server URL
    #[arg(long, env = "KUBE_AUTH_PROXY_UPSTREAM_URL")]
    upstream_url: Option<String>,

    /// File holding the token the proxy presents upstream
    #[arg(long, env = "KUBE_AUTH_PROXY_UPSTREAM_TOKEN_PATH")]
    upstream_token_path: Option<PathBuf>,

    /// OpenID client id (expected token audience)
    #[arg(long, env = "KUBE_AUTH_PROXY_CLIENT_ID")]
    client_id: Option<String>,

    /// OpenID issuer / discovery URL
    #[arg(long, env = "KUBE_AUTH_PROXY_IDP_SERVER_URL")]
    idp_server_url: Option<String>,

    /// PEM public key for verifying cluster-signed tokens
    #[arg(long, env = "KUBE_AUTH_PROXY_SIGNING_CA")]
    signing_ca: Option<PathBuf>,

    /// Allowed client networks (CIDR), comma separated
    #[arg(long, env = "KUBE_AUTH_PROXY_ALLOWED_IPS", value_delimiter = ',')]
    allowed_ips: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "KUBE_AUTH_PROXY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "KUBE_AUTH_PROXY_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start server)
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(listen) = &self.metrics_listen {
            config.server.metrics_listen = listen.clone();
        }
        if self.tls_cert.is_some() {
            config.server.tls_cert = self.tls_cert.clone();
        }
        if self.tls_key.is_some() {
            config.server.tls_key = self.tls_key.clone();
        }
        if self.enable_proxy_protocol {
            config.server.enable_proxy_protocol = true;
        }
        if let Some(url) = &self.upstream_url {
            config.upstream.url = url.clone();
        }
        if self.upstream_token_path.is_some() {
            config.upstream.token_path = self.upstream_token_path.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.idp.client_id = client_id.clone();
        }
        if let Some(url) = &self.idp_server_url {
            config.idp.server_url = url.clone();
        }
        if self.signing_ca.is_some() {
            config.idp.signing_ca = self.signing_ca.clone();
        }
        if !self.allowed_ips.is_empty() {
            config.allowed_ips = self.allowed_ips.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Only ring is compiled in, but reqwest and the upstream client must agree
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);

    init_logging(&config.logging.level, config.logging.json)?;

    info!("Starting kube-auth-proxy v{}", kube_auth_proxy::VERSION);
    match &args.config {
        Some(path) => info!("Configuration loaded from {:?}", path),
        None => info!("No configuration file, using defaults and command-line flags"),
    }

    config.load_upstream_token()?;
    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let verifiers = verifier::from_config(&config).await?;
    info!("{} verifier(s) configured", verifiers.len());

    let server = Arc::new(ProxyServer::new(config, verifiers)?);
    server.run().await?;

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown");
        }
    }

    server.stop();
    server.wait().await;

    info!("kube-auth-proxy shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        return std::future::pending().await;
    };
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await;
}
