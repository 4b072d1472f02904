//! TLS termination for the traffic listener
//!
//! Loads a certificate chain and private key from PEM files into a rustls
//! server configuration. ALPN offers HTTP/2 and HTTP/1.1; the connection
//! builder serves whichever is negotiated.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ServerConfig;
use rustls_pemfile::certs;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::ProxyError;

const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Build a rustls server configuration from PEM files
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, ProxyError> {
    let cert_chain = load_certificates(cert_path)?;
    let private_key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
    .map_err(|e| ProxyError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, private_key)
    .map_err(|e| ProxyError::Tls(format!("certificate and key do not match: {e}")))?;

    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    info!(cert = ?cert_path, "TLS enabled on traffic listener");
    Ok(config)
}

/// Acceptor for the traffic listener
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ProxyError> {
    Ok(TlsAcceptor::from(Arc::new(load_server_config(
        cert_path, key_path,
    )?)))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let mut reader = open(path)?;
    let chain = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| key_load(path, e))?;

    if chain.is_empty() {
        return Err(key_load(path, "no certificates found"));
    }
    Ok(chain)
}

/// PKCS#8, PKCS#1 and SEC1 keys are accepted; the first key in the file wins.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| key_load(path, e))?
        .ok_or_else(|| key_load(path, "no private key found"))
}

fn open(path: &Path) -> Result<BufReader<File>, ProxyError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| key_load(path, e))
}

fn key_load(path: &Path, reason: impl ToString) -> ProxyError {
    ProxyError::KeyLoad {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_load_server_config() {
        let config = load_server_config(&fixture("server.crt"), &fixture("server.key")).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_pkcs1_key_is_accepted() {
        // signing_key.pem is PKCS#1 but does not match server.crt
        let result = load_server_config(&fixture("server.crt"), &fixture("signing_key.pem"));
        assert!(matches!(result, Err(ProxyError::Tls(_))));
    }

    #[test]
    fn test_missing_files() {
        let result = load_server_config(Path::new("/nonexistent.crt"), &fixture("server.key"));
        assert!(matches!(result, Err(ProxyError::KeyLoad { .. })));
    }

    #[test]
    fn test_file_without_certificates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = load_server_config(file.path(), &fixture("server.key")).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }
}
