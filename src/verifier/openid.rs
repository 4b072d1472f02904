//! OpenID Connect verifier
//!
//! Performs discovery against `{issuer}/.well-known/openid-configuration`
//! once at construction, then verifies bearer tokens against the published
//! JWKS. Tokens naming an unknown `kid` trigger a rate-limited key refresh so
//! rotation at the provider does not need a proxy restart.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::Verifier;
use crate::claims::Claims;
use crate::error::{ProxyError, VerifyError};
use crate::impersonate::{bearer_token, Impersonation};

/// Asymmetric algorithms accepted from an identity provider
const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Default bound on discovery + JWKS retrieval
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between JWKS refreshes triggered by unknown key ids
const DEFAULT_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Subset of the discovery document the verifier needs
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Construction options for [`OpenIdVerifier`]
#[derive(Debug, Clone)]
pub struct OpenIdOptions {
    pub client_id: String,
    pub issuer_url: String,
    pub discovery_timeout: Duration,
    pub key_refresh_interval: Duration,
}

impl OpenIdOptions {
    pub fn new(client_id: impl Into<String>, issuer_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            issuer_url: issuer_url.into(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            key_refresh_interval: DEFAULT_KEY_REFRESH_INTERVAL,
        }
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_key_refresh_interval(mut self, interval: Duration) -> Self {
        self.key_refresh_interval = interval;
        self
    }
}

/// Verifier backed by an OpenID Connect provider
pub struct OpenIdVerifier {
    client_id: String,
    issuer: String,
    jwks_uri: String,
    keys: ArcSwap<JwkSet>,
    last_refresh: Mutex<Instant>,
    key_refresh_interval: Duration,
    http_client: reqwest::Client,
    impersonation: Arc<Impersonation>,
}

impl OpenIdVerifier {
    /// Discover the provider and fetch its key set.
    ///
    /// Fails fast (within `discovery_timeout`) when the provider cannot be
    /// reached, returns malformed metadata, or advertises a different issuer.
    pub async fn discover(
        options: OpenIdOptions,
        impersonation: Arc<Impersonation>,
    ) -> Result<Self, ProxyError> {
        if options.client_id.is_empty() {
            return Err(ProxyError::InvalidConfig("missing client id".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(options.discovery_timeout)
            .connect_timeout(options.discovery_timeout)
            .build()
            .map_err(|e| ProxyError::Discovery(format!("failed to build HTTP client: {}", e)))?;

        let metadata = tokio::time::timeout(
            options.discovery_timeout,
            fetch_metadata(&http_client, &options.issuer_url),
        )
        .await
        .map_err(|_| {
            ProxyError::Discovery(format!(
                "timed out after {:?} discovering {}",
                options.discovery_timeout, options.issuer_url
            ))
        })??;

        if metadata.issuer.trim_end_matches('/') != options.issuer_url.trim_end_matches('/') {
            return Err(ProxyError::Discovery(format!(
                "issuer mismatch: expected {:?}, provider reported {:?}",
                options.issuer_url, metadata.issuer
            )));
        }

        let keys = tokio::time::timeout(
            options.discovery_timeout,
            fetch_jwks(&http_client, &metadata.jwks_uri),
        )
        .await
        .map_err(|_| {
            ProxyError::Discovery(format!("timed out fetching keys from {}", metadata.jwks_uri))
        })?
        .map_err(ProxyError::Discovery)?;

        info!(
            issuer = %metadata.issuer,
            jwks_uri = %metadata.jwks_uri,
            keys = keys.keys.len(),
            "OIDC discovery successful"
        );

        Ok(Self {
            client_id: options.client_id,
            issuer: metadata.issuer,
            jwks_uri: metadata.jwks_uri,
            keys: ArcSwap::from_pointee(keys),
            last_refresh: Mutex::new(Instant::now()),
            key_refresh_interval: options.key_refresh_interval,
            http_client,
            impersonation,
        })
    }

    /// Issuer reported by the provider
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);
        validation
    }

    /// Verify `token` and return its claims
    async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let header = decode_header(token)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(VerifyError::UnsupportedAlgorithm(header.alg));
        }

        let validation = self.validation(header.alg);
        let keys = self.keys.load_full();
        match verify_with(&keys, &header, token, &validation) {
            Err(VerifyError::UnknownKey(kid)) if kid.is_some() => {
                debug!(kid = ?kid, "Unknown signing key, refreshing key set");
                self.refresh_keys().await?;
                let keys = self.keys.load_full();
                verify_with(&keys, &header, token, &validation)
            }
            result => result,
        }
    }

    async fn refresh_keys(&self) -> Result<(), VerifyError> {
        {
            let mut last = self.last_refresh.lock();
            if last.elapsed() < self.key_refresh_interval {
                return Err(VerifyError::KeyRefresh(
                    "refreshed too recently".to_string(),
                ));
            }
            *last = Instant::now();
        }

        match fetch_jwks(&self.http_client, &self.jwks_uri).await {
            Ok(keys) => {
                info!(keys = keys.keys.len(), "Refreshed signing keys");
                self.keys.store(Arc::new(keys));
                Ok(())
            }
            Err(e) => {
                warn!(jwks_uri = %self.jwks_uri, error = %e, "Failed to refresh signing keys");
                Err(VerifyError::KeyRefresh(e))
            }
        }
    }
}

#[async_trait]
impl Verifier for OpenIdVerifier {
    fn name(&self) -> &str {
        "openid"
    }

    async fn admit(&self, request: &mut Request<Body>) -> Result<bool, VerifyError> {
        let token = bearer_token(request.headers())?.to_string();
        let claims = self.verify(&token).await?;
        let identity = self.impersonation.apply(request.headers_mut(), &claims)?;
        debug!(user = %identity.username, groups = ?identity.groups, "Token verified by OpenID provider");
        Ok(true)
    }
}

/// Verify `token` against the keys in `jwks` matching the header's `kid`.
///
/// Without a `kid`, every key in the set is tried in turn.
fn verify_with(
    jwks: &JwkSet,
    header: &Header,
    token: &str,
    validation: &Validation,
) -> Result<Claims, VerifyError> {
    let candidates: Vec<_> = match &header.kid {
        Some(kid) => jwks
            .keys
            .iter()
            .filter(|jwk| jwk.common.key_id.as_deref() == Some(kid.as_str()))
            .collect(),
        None => jwks.keys.iter().collect(),
    };

    if candidates.is_empty() {
        return Err(VerifyError::UnknownKey(header.kid.clone()));
    }

    let mut last_error = None;
    for jwk in candidates {
        let key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(e) => {
                last_error = Some(VerifyError::from(e));
                continue;
            }
        };
        match decode::<Claims>(token, &key, validation) {
            Ok(data) => return Ok(data.claims),
            Err(e) => last_error = Some(VerifyError::from(e)),
        }
    }

    Err(last_error.unwrap_or(VerifyError::UnknownKey(header.kid.clone())))
}

fn discovery_url(issuer_url: &str) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        issuer_url.trim_end_matches('/')
    )
}

async fn fetch_metadata(
    client: &reqwest::Client,
    issuer_url: &str,
) -> Result<ProviderMetadata, ProxyError> {
    let url = discovery_url(issuer_url);
    debug!(url = %url, "Fetching OIDC discovery document");

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ProxyError::Discovery(format!("failed to fetch {}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(ProxyError::Discovery(format!(
            "{} returned status {}",
            url,
            response.status()
        )));
    }

    let metadata: ProviderMetadata = response
        .json()
        .await
        .map_err(|e| ProxyError::Discovery(format!("invalid discovery document: {}", e)))?;

    if metadata.issuer.is_empty() {
        return Err(ProxyError::Discovery(
            "discovery document has no issuer".to_string(),
        ));
    }
    if metadata.jwks_uri.is_empty() {
        return Err(ProxyError::Discovery(
            "discovery document has no jwks_uri".to_string(),
        ));
    }

    Ok(metadata)
}

async fn fetch_jwks(client: &reqwest::Client, jwks_uri: &str) -> Result<JwkSet, String> {
    let response = client
        .get(jwks_uri)
        .send()
        .await
        .map_err(|e| format!("failed to fetch {}: {}", jwks_uri, e))?;

    if !response.status().is_success() {
        return Err(format!("{} returned status {}", jwks_uri, response.status()));
    }

    response
        .json::<JwkSet>()
        .await
        .map_err(|e| format!("invalid key set from {}: {}", jwks_uri, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_url_construction() {
        assert_eq!(
            discovery_url("https://auth.example.com/"),
            "https://auth.example.com/.well-known/openid-configuration"
        );
        assert_eq!(
            discovery_url("https://auth.example.com/realms/kore"),
            "https://auth.example.com/realms/kore/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_provider_metadata_optional_fields() {
        let json = r#"{
            "issuer": "https://auth.example.com",
            "jwks_uri": "https://auth.example.com/jwks"
        }"#;
        let metadata: ProviderMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.jwks_uri, "https://auth.example.com/jwks");
        assert!(metadata.id_token_signing_alg_values_supported.is_empty());
    }

    #[test]
    fn test_verify_with_unknown_kid() {
        let jwks = JwkSet { keys: vec![] };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("missing".to_string());
        let validation = Validation::new(Algorithm::RS256);

        let err = verify_with(&jwks, &header, "a.b.c", &validation).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownKey(Some(ref kid)) if kid == "missing"));
    }

    #[tokio::test]
    async fn test_discover_unreachable_provider_fails() {
        let options = OpenIdOptions::new("kube", "http://127.0.0.1:1")
            .with_discovery_timeout(Duration::from_secs(2));
        let impersonation = Arc::new(Impersonation::new(vec!["email".into()], vec![], String::new()));

        let result = OpenIdVerifier::discover(options, impersonation).await;
        assert!(matches!(result, Err(ProxyError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_discover_requires_client_id() {
        let options = OpenIdOptions::new("", "https://auth.example.com");
        let impersonation = Arc::new(Impersonation::new(vec!["email".into()], vec![], String::new()));

        let result = OpenIdVerifier::discover(options, impersonation).await;
        assert!(matches!(result, Err(ProxyError::InvalidConfig(_))));
    }
}
