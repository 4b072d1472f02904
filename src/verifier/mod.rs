//! Pluggable token verification
//!
//! A [`Verifier`] decides whether it can vouch for a request. Verifiers are
//! consulted in configuration order by the authenticate middleware; the
//! first to admit wins and an error from one never stops the others.
//!
//! Variants:
//! - [`OpenIdVerifier`] - OpenID Connect provider, keys from discovery + JWKS
//! - [`StaticKeyVerifier`] - PEM public key on disk (cluster-signed tokens)

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use tracing::info;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, VerifyError};
use crate::impersonate::Impersonation;

pub mod openid;
pub mod static_key;

pub use openid::{OpenIdOptions, OpenIdVerifier};
pub use static_key::StaticKeyVerifier;

/// Capability to admit a request on the strength of its credentials.
///
/// Implementations hold only read-only key material (or lock-free swap
/// cells) and are shared across all in-flight requests.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Short name used in logs and metrics labels
    fn name(&self) -> &str;

    /// Inspect `request` and, when its token is acceptable, rewrite its
    /// headers for impersonation.
    ///
    /// `Ok(false)` and `Err(_)` both mean "not admitted by this verifier".
    async fn admit(&self, request: &mut Request<Body>) -> Result<bool, VerifyError>;
}

/// Build the verifier list described by `config`.
///
/// The OpenID verifier (when `idp.server_url` is set) comes first, then the
/// static-key verifier (when `idp.signing_ca` is set). Discovery failures are
/// fatal: the proxy cannot start without knowing how to check tokens.
pub async fn from_config(config: &ProxyConfig) -> Result<Vec<Arc<dyn Verifier>>, ProxyError> {
    let impersonation = Arc::new(Impersonation::new(
        config.idp.user_claims.clone(),
        config.idp.group_claims.clone(),
        config.upstream.token.clone(),
    ));

    let mut verifiers: Vec<Arc<dyn Verifier>> = Vec::new();

    if !config.idp.server_url.is_empty() {
        let options = OpenIdOptions::new(&config.idp.client_id, &config.idp.server_url)
            .with_discovery_timeout(config.idp.discovery_timeout());
        let verifier = OpenIdVerifier::discover(options, impersonation.clone()).await?;
        info!(issuer = %verifier.issuer(), "OpenID verifier ready");
        verifiers.push(Arc::new(verifier));
    }

    if let Some(path) = config.idp.signing_ca_path() {
        let verifier = StaticKeyVerifier::from_pem_file(
            path,
            &config.idp.service_account_issuer,
            impersonation.clone(),
        )?;
        info!(path = ?path, issuer = %config.idp.service_account_issuer, "Static key verifier ready");
        verifiers.push(Arc::new(verifier));
    }

    if verifiers.is_empty() {
        return Err(ProxyError::InvalidConfig(
            "no identity verifiers configured".to_string(),
        ));
    }

    Ok(verifiers)
}
