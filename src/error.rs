//! Error types for proxy construction, startup, and per-request verification

use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while building or starting the proxy.
///
/// Every variant is surfaced to the caller before (or instead of) serving
/// traffic; none of them is raised on the request path.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An allow-list entry could not be parsed
    #[error("invalid CIDR notation: {value:?}")]
    InvalidCidr { value: String },

    /// OpenID discovery or JWKS retrieval failed
    #[error("identity provider discovery failed: {0}")]
    Discovery(String),

    /// Key material could not be loaded
    #[error("failed to load key material from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// TLS server configuration could not be built
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The server was asked to run twice
    #[error("proxy server already started")]
    AlreadyStarted,

    /// `run` was called after `stop`
    #[error("proxy server has been stopped")]
    Stopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reasons a single verifier declined to vouch for a request.
///
/// These never abort the request on their own; the authenticate middleware
/// moves on to the next verifier.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// No `Authorization: Bearer` header
    #[error("no bearer token found in request")]
    MissingToken,

    /// Header present but not a usable bearer token
    #[error("malformed authorization header")]
    MalformedHeader,

    /// Token failed signature, issuer, audience or expiry checks
    #[error("token verification failed: {0}")]
    InvalidToken(String),

    /// Token signed with an algorithm this verifier does not accept
    #[error("unsupported signing algorithm: {0:?}")]
    UnsupportedAlgorithm(jsonwebtoken::Algorithm),

    /// Token names a key id absent from the key set
    #[error("no signing key found for kid {0:?}")]
    UnknownKey(Option<String>),

    /// Key set could not be refreshed
    #[error("failed to refresh signing keys: {0}")]
    KeyRefresh(String),

    /// None of the configured username claims were present
    #[error("no username found")]
    NoUsername,

    /// A resolved identity could not be encoded as a header value
    #[error("identity value {0:?} is not a valid header value")]
    InvalidHeaderValue(String),
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        VerifyError::InvalidToken(err.to_string())
    }
}
