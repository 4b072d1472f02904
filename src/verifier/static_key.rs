//! Static public key verifier
//!
//! Verifies tokens signed by a key the proxy already holds, typically the
//! cluster's service-account signing key. No discovery round-trip: the PEM
//! public key is read from disk once at construction. The audience is not
//! checked; issuer and expiry are.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use tracing::debug;

use super::Verifier;
use crate::claims::Claims;
use crate::error::{ProxyError, VerifyError};
use crate::impersonate::{bearer_token, Impersonation};

const ALLOWED_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Verifier backed by a fixed RSA public key
pub struct StaticKeyVerifier {
    key: DecodingKey,
    issuer: String,
    impersonation: Arc<Impersonation>,
}

impl StaticKeyVerifier {
    /// Load a PEM-encoded RSA public key from `path`
    pub fn from_pem_file(
        path: impl AsRef<Path>,
        issuer: &str,
        impersonation: Arc<Impersonation>,
    ) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| ProxyError::KeyLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_pem(&pem, issuer, impersonation).map_err(|e| match e {
            ProxyError::KeyLoad { reason, .. } => ProxyError::KeyLoad {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Build from PEM bytes already in memory
    pub fn from_pem(
        pem: &[u8],
        issuer: &str,
        impersonation: Arc<Impersonation>,
    ) -> Result<Self, ProxyError> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| ProxyError::KeyLoad {
            path: "<memory>".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            key,
            issuer: issuer.to_string(),
            impersonation,
        })
    }

    fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let header = decode_header(token)?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(VerifyError::UnsupportedAlgorithm(header.alg));
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;

        Ok(decode::<Claims>(token, &self.key, &validation)?.claims)
    }
}

#[async_trait]
impl Verifier for StaticKeyVerifier {
    fn name(&self) -> &str {
        "static-key"
    }

    async fn admit(&self, request: &mut Request<Body>) -> Result<bool, VerifyError> {
        let claims = self.verify(bearer_token(request.headers())?)?;
        let identity = self.impersonation.apply(request.headers_mut(), &claims)?;
        debug!(user = %identity.username, groups = ?identity.groups, "Token verified by static key");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SERVICE_ACCOUNT_ISSUER;
    use crate::impersonate::{IMPERSONATE_GROUP, IMPERSONATE_USER};
    use axum::http::header;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    const PRIVATE_KEY: &[u8] = include_bytes!("../../tests/fixtures/signing_key.pem");
    const PUBLIC_KEY: &[u8] = include_bytes!("../../tests/fixtures/signing_key.pub.pem");
    const OTHER_PRIVATE_KEY: &[u8] = include_bytes!("../../tests/fixtures/other_key.pem");

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn sign(key: &[u8], claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(key).unwrap(),
        )
        .unwrap()
    }

    fn verifier() -> StaticKeyVerifier {
        let impersonation = Arc::new(Impersonation::new(
            vec!["sub".into()],
            vec!["groups".into()],
            "proxy-token".into(),
        ));
        StaticKeyVerifier::from_pem(PUBLIC_KEY, SERVICE_ACCOUNT_ISSUER, impersonation).unwrap()
    }

    fn request(token: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/v1/namespaces")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_admits_valid_service_account_token() {
        let token = sign(
            PRIVATE_KEY,
            json!({
                "iss": SERVICE_ACCOUNT_ISSUER,
                "sub": "system:serviceaccount:kore:admin",
                "groups": ["system:serviceaccounts", "system:serviceaccounts:kore"],
                "exp": now() + 300,
            }),
        );
        let mut req = request(&token);

        assert!(verifier().admit(&mut req).await.unwrap());
        assert_eq!(
            req.headers().get(IMPERSONATE_USER).unwrap(),
            "system:serviceaccount:kore:admin"
        );
        assert_eq!(req.headers().get_all(IMPERSONATE_GROUP).iter().count(), 2);
        assert_eq!(req.headers().get(header::AUTHORIZATION).unwrap(), "Bearer proxy-token");
    }

    #[tokio::test]
    async fn test_rejects_expired_token() {
        let token = sign(
            PRIVATE_KEY,
            json!({"iss": SERVICE_ACCOUNT_ISSUER, "sub": "jane", "exp": now() - 3600}),
        );
        let result = verifier().admit(&mut request(&token)).await;
        assert!(matches!(result, Err(VerifyError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_rejects_wrong_issuer() {
        let token = sign(
            PRIVATE_KEY,
            json!({"iss": "https://evil.example.com", "sub": "jane", "exp": now() + 300}),
        );
        assert!(verifier().admit(&mut request(&token)).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_foreign_signature() {
        let token = sign(
            OTHER_PRIVATE_KEY,
            json!({"iss": SERVICE_ACCOUNT_ISSUER, "sub": "jane", "exp": now() + 300}),
        );
        assert!(verifier().admit(&mut request(&token)).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_symmetric_algorithm() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({"iss": SERVICE_ACCOUNT_ISSUER, "sub": "jane", "exp": now() + 300}),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let result = verifier().admit(&mut request(&token)).await;
        assert!(matches!(result, Err(VerifyError::UnsupportedAlgorithm(Algorithm::HS256))));
    }

    #[tokio::test]
    async fn test_missing_token() {
        let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let result = verifier().admit(&mut req).await;
        assert!(matches!(result, Err(VerifyError::MissingToken)));
    }

    #[test]
    fn test_from_pem_file_missing() {
        let impersonation = Arc::new(Impersonation::new(vec!["sub".into()], vec![], String::new()));
        let result =
            StaticKeyVerifier::from_pem_file("/nonexistent/sa.pub", SERVICE_ACCOUNT_ISSUER, impersonation);
        assert!(matches!(result, Err(ProxyError::KeyLoad { .. })));
    }
}
