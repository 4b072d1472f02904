//! Unit tests for configuration parsing and validation
//!
//! Tests for config struct field parsing, defaults, and validation.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use kube_auth_proxy::config::*;

#[test]
fn test_default_config() {
    let config = ProxyConfig::default();

    assert_eq!(config.version, Some(CURRENT_CONFIG_VERSION));
    assert!(config.allowed_ips.is_empty());
    assert_eq!(
        config.idp.user_claims,
        vec!["preferred_username", "email", "name"]
    );
    assert_eq!(config.idp.group_claims, vec!["groups"]);
    assert_eq!(config.idp.service_account_issuer, SERVICE_ACCOUNT_ISSUER);
    assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(10));
    assert_eq!(config.upstream.dial_timeout(), Duration::from_secs(10));
    assert!(!config.server.tls_enabled());

    // No identity provider and no allowed networks by default
    assert!(!config.is_valid());
}

#[test]
fn test_server_socket_addrs() {
    let config = ServerConfig::default();
    assert!(config.socket_addr().unwrap().port() > 0);
    assert!(config.metrics_socket_addr().unwrap().port() > 0);
}

#[test]
fn test_config_parsing_full() {
    let toml = r#"
version = 1
allowed_ips = ["10.0.0.0/8", "192.168.0.0/16"]

[server]
listen = "127.0.0.1:10443"
metrics_listen = "127.0.0.1:9090"
tls_cert = "/tls/tls.crt"
tls_key = "/tls/tls.key"
enable_proxy_protocol = true
flush_interval_ms = 0
shutdown_timeout_secs = 30

[upstream]
url = "https://10.96.0.1:443"
token_path = "/var/run/secrets/kubernetes.io/serviceaccount/token"
dial_timeout_secs = 5

[idp]
client_id = "kube"
server_url = "https://sso.example.com/realms/kore"
user_claims = ["email"]
group_claims = ["groups", "roles"]

[logging]
level = "debug"
json = true
"#;

    let config: ProxyConfig = toml::from_str(toml).unwrap();

    assert_eq!(config.server.listen, "127.0.0.1:10443");
    assert_eq!(config.server.metrics_listen, "127.0.0.1:9090");
    assert!(config.server.tls_enabled());
    assert!(config.server.enable_proxy_protocol);
    assert!(config.server.flush_interval().is_zero());
    assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(30));
    assert_eq!(config.upstream.uri().unwrap().host(), Some("10.96.0.1"));
    assert_eq!(config.upstream.dial_timeout(), Duration::from_secs(5));
    assert_eq!(config.idp.user_claims, vec!["email"]);
    assert_eq!(config.idp.group_claims, vec!["groups", "roles"]);
    assert_eq!(config.allowed_ips.len(), 2);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert!(config.is_valid());
}

#[test]
fn test_config_parsing_minimal() {
    let toml = r#"
allowed_ips = ["0.0.0.0/0"]

[idp]
signing_ca = "/etc/kubernetes/pki/sa.pub"
"#;

    let config: ProxyConfig = toml::from_str(toml).unwrap();

    assert!(config.idp.server_url.is_empty());
    assert_eq!(
        config.idp.signing_ca_path(),
        Some(PathBuf::from("/etc/kubernetes/pki/sa.pub").as_path())
    );
    assert_eq!(config.server.flush_interval(), Duration::from_millis(10));
    assert!(config.is_valid());
}

#[test]
fn test_upstream_token_is_never_serialized() {
    let mut config = ProxyConfig::default();
    config.upstream.token = "super-secret".to_string();

    let rendered = toml::to_string(&config).unwrap();
    assert!(!rendered.contains("super-secret"));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
allowed_ips = ["127.0.0.1"]

[upstream]
url = "http://127.0.0.1:8001"

[idp]
client_id = "kube"
server_url = "https://sso.example.com"
"#
    )
    .unwrap();

    let config = ProxyConfig::load(file.path()).unwrap();
    assert_eq!(config.upstream.url, "http://127.0.0.1:8001");
    assert!(config.is_valid());
}

#[test]
fn test_omitted_allow_list_fails_validation() {
    let toml = r#"
[idp]
signing_ca = "/etc/kubernetes/pki/sa.pub"
"#;

    let config: ProxyConfig = toml::from_str(toml).unwrap();
    assert!(config.allowed_ips.is_empty());

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("0.0.0.0/0"));
}

#[test]
fn test_load_missing_file() {
    assert!(ProxyConfig::load("/nonexistent/kube-auth-proxy.toml").is_err());
}

#[test]
fn test_load_malformed_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server\nlisten = ").unwrap();
    assert!(ProxyConfig::load(file.path()).is_err());
}

#[test]
fn test_load_upstream_token_rejects_empty_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut config = ProxyConfig::default();
    config.upstream.token_path = Some(file.path().to_path_buf());
    assert!(config.load_upstream_token().is_err());
}

#[test]
fn test_invalid_listen_address() {
    let mut config = ProxyConfig::default();
    config.idp.signing_ca = Some(PathBuf::from("/sa.pub"));
    config.server.listen = "not-an-address".to_string();

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("invalid listen address"));
}
