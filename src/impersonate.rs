//! Kubernetes impersonation header rewriting
//!
//! Once a verifier has vouched for a token, the caller's identity is handed
//! to the API server through `Impersonate-*` headers while the proxy
//! presents its own credential. Every verifier funnels through
//! [`Impersonation::apply`] so the stripping and rewriting rules cannot drift
//! between identity providers.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::claims::Claims;
use crate::error::VerifyError;

/// `Impersonate-User`
pub const IMPERSONATE_USER: HeaderName = HeaderName::from_static("impersonate-user");
/// `Impersonate-Group`, repeated once per group
pub const IMPERSONATE_GROUP: HeaderName = HeaderName::from_static("impersonate-group");

/// Prefix shared by every impersonation header (`-User`, `-Group`, `-Uid`, `-Extra-*`)
pub const IMPERSONATE_PREFIX: &str = "impersonate-";

/// Identity resolved from a verified token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub groups: Vec<String>,
}

/// Claim lists and upstream credential shared by all verifiers
#[derive(Debug, Clone)]
pub struct Impersonation {
    user_claims: Vec<String>,
    group_claims: Vec<String>,
    upstream_token: String,
}

impl Impersonation {
    pub fn new(user_claims: Vec<String>, group_claims: Vec<String>, upstream_token: String) -> Self {
        Self {
            user_claims,
            group_claims,
            upstream_token,
        }
    }

    pub fn user_claims(&self) -> &[String] {
        &self.user_claims
    }

    pub fn group_claims(&self) -> &[String] {
        &self.group_claims
    }

    /// Resolve the identity carried by `claims`
    pub fn identity(&self, claims: &Claims) -> Result<Identity, VerifyError> {
        let username = claims
            .username(&self.user_claims)
            .ok_or(VerifyError::NoUsername)?;
        let groups = claims.groups(&self.group_claims);
        Ok(Identity { username, groups })
    }

    /// Rewrite `headers` to impersonate the identity carried by `claims`.
    ///
    /// Caller-supplied `Impersonate-*` headers are removed first, whether or
    /// not an identity is found. Each group becomes its own
    /// `Impersonate-Group` entry. `Authorization` is replaced with the
    /// upstream credential, or dropped when none is configured, so the
    /// caller's token never reaches the API server.
    pub fn apply(&self, headers: &mut HeaderMap, claims: &Claims) -> Result<Identity, VerifyError> {
        strip_impersonation_headers(headers);

        let identity = self.identity(claims)?;

        let user = HeaderValue::from_str(&identity.username)
            .map_err(|_| VerifyError::InvalidHeaderValue(identity.username.clone()))?;
        let mut groups = Vec::with_capacity(identity.groups.len());
        for group in &identity.groups {
            groups.push(
                HeaderValue::from_str(group)
                    .map_err(|_| VerifyError::InvalidHeaderValue(group.clone()))?,
            );
        }

        headers.insert(IMPERSONATE_USER, user);
        for group in groups {
            headers.append(IMPERSONATE_GROUP, group);
        }

        if self.upstream_token.is_empty() {
            headers.remove(header::AUTHORIZATION);
        } else {
            let bearer = HeaderValue::from_str(&format!("Bearer {}", self.upstream_token))
                .map_err(|_| VerifyError::InvalidHeaderValue("<upstream token>".to_string()))?;
            headers.insert(header::AUTHORIZATION, bearer);
        }

        Ok(identity)
    }
}

/// Remove every `Impersonate-*` header (user, group, uid, extra)
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    let spoofed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATE_PREFIX))
        .cloned()
        .collect();
    for name in spoofed {
        headers.remove(name);
    }
}

/// Bearer token from an `Authorization` header.
///
/// The scheme is matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, VerifyError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(VerifyError::MissingToken)?
        .to_str()
        .map_err(|_| VerifyError::MalformedHeader)?;

    let (scheme, token) = value
        .split_once(' ')
        .ok_or(VerifyError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(VerifyError::MissingToken);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(VerifyError::MissingToken);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rewriter(token: &str) -> Impersonation {
        Impersonation::new(
            vec!["preferred_username".into(), "email".into(), "name".into()],
            vec!["groups".into()],
            token.to_string(),
        )
    }

    fn claims(value: serde_json::Value) -> Claims {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_apply_sets_user_groups_and_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller"));

        let identity = rewriter("proxy-token")
            .apply(
                &mut headers,
                &claims(json!({"email": "jane@example.com", "groups": ["dev", "ops"]})),
            )
            .unwrap();

        assert_eq!(identity.username, "jane@example.com");
        assert_eq!(headers.get(IMPERSONATE_USER).unwrap(), "jane@example.com");
        let groups: Vec<_> = headers
            .get_all(IMPERSONATE_GROUP)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(groups, vec!["dev", "ops"]);
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer proxy-token");
    }

    #[test]
    fn test_apply_strips_spoofed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("impersonate-user", HeaderValue::from_static("system:admin"));
        headers.append("impersonate-group", HeaderValue::from_static("system:masters"));
        headers.insert("impersonate-uid", HeaderValue::from_static("0"));
        headers.insert("impersonate-extra-scopes", HeaderValue::from_static("all"));

        rewriter("t")
            .apply(&mut headers, &claims(json!({"name": "jane"})))
            .unwrap();

        assert_eq!(headers.get(IMPERSONATE_USER).unwrap(), "jane");
        assert!(headers.get(IMPERSONATE_GROUP).is_none());
        assert!(headers.get("impersonate-uid").is_none());
        assert!(headers.get("impersonate-extra-scopes").is_none());
    }

    #[test]
    fn test_apply_strips_even_without_username() {
        let mut headers = HeaderMap::new();
        headers.insert("impersonate-user", HeaderValue::from_static("system:admin"));

        let err = rewriter("t")
            .apply(&mut headers, &claims(json!({"sub": "123"})))
            .unwrap_err();

        assert!(matches!(err, VerifyError::NoUsername));
        assert!(headers.get(IMPERSONATE_USER).is_none());
    }

    #[test]
    fn test_apply_without_upstream_token_drops_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller"));

        rewriter("")
            .apply(&mut headers, &claims(json!({"name": "jane"})))
            .unwrap();

        assert!(headers.get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(matches!(bearer_token(&headers), Err(VerifyError::MissingToken)));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def.ghi");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert!(matches!(bearer_token(&headers), Err(VerifyError::MalformedHeader)));
    }
}
