//! Readiness short-circuit
//!
//! Probes hit `/ready` on the traffic port. The filter sits in front of the
//! netfilter and authentication so a probe is never refused for lacking a
//! token or coming from outside the allow-list.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Path answered by [`health_middleware`]
pub const READY_PATH: &str = "/ready";

pub async fn health_middleware(request: Request<Body>, next: Next) -> Response {
    if is_probe(&request) {
        return (StatusCode::OK, "OK").into_response();
    }
    next.run(request).await
}

fn is_probe(request: &Request<Body>) -> bool {
    request.uri().path() == READY_PATH
        && (request.method() == Method::GET || request.method() == Method::HEAD)
}
