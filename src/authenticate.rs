//! Authentication middleware
//!
//! Consults each verifier in configuration order. The first verifier to
//! admit the request wins and the request continues down the chain with
//! the headers that verifier rewrote. Errors are per-verifier: they are
//! logged and the next verifier is tried. When nobody admits, the caller
//! gets a bare 403.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, info};

use crate::metrics::ProxyMetrics;
use crate::netfilter::forbidden;
use crate::verifier::Verifier;

/// State for [`authenticate_middleware`]
#[derive(Clone)]
pub struct AuthState {
    pub verifiers: Arc<[Arc<dyn Verifier>]>,
    pub metrics: Arc<ProxyMetrics>,
}

impl AuthState {
    pub fn new(verifiers: Vec<Arc<dyn Verifier>>, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            verifiers: verifiers.into(),
            metrics,
        }
    }
}

pub async fn authenticate_middleware(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    for verifier in state.verifiers.iter() {
        match verifier.admit(&mut request).await {
            Ok(true) => {
                debug!(verifier = verifier.name(), path = %request.uri().path(), "Request admitted");
                state.metrics.auth_admitted(verifier.name());
                return next.run(request).await;
            }
            Ok(false) => {
                debug!(verifier = verifier.name(), "Verifier declined request");
            }
            Err(e) => {
                debug!(verifier = verifier.name(), error = %e, "Verifier rejected request");
            }
        }
    }

    info!(
        method = %request.method(),
        path = %request.uri().path(),
        "Request not admitted by any verifier"
    );
    state.metrics.auth_failure();
    forbidden()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifyError;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    enum Outcome {
        Admit,
        Decline,
        Fail,
    }

    struct Fixed {
        name: &'static str,
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(name: &'static str, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Verifier for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn admit(&self, request: &mut Request<Body>) -> Result<bool, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcome {
                Outcome::Admit => {
                    request
                        .headers_mut()
                        .insert("x-admitted-by", self.name.parse().unwrap());
                    Ok(true)
                }
                Outcome::Decline => Ok(false),
                Outcome::Fail => Err(VerifyError::InvalidToken("bad signature".into())),
            }
        }
    }

    fn app(verifiers: Vec<Arc<dyn Verifier>>, metrics: Arc<ProxyMetrics>) -> Router {
        Router::new()
            .fallback(|req: Request<Body>| async move {
                req.headers()
                    .get("x-admitted-by")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string()
            })
            .layer(axum::middleware::from_fn_with_state(
                AuthState::new(verifiers, metrics),
                authenticate_middleware,
            ))
    }

    async fn body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_declined_request_is_forbidden() {
        let metrics = Arc::new(ProxyMetrics::new());
        let response = app(vec![Fixed::new("never", Outcome::Decline)], metrics.clone())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(metrics.snapshot().auth_failures, 1);
    }

    #[tokio::test]
    async fn test_error_does_not_stop_later_verifiers() {
        let metrics = Arc::new(ProxyMetrics::new());
        let failing = Fixed::new("failing", Outcome::Fail);
        let admitting = Fixed::new("second", Outcome::Admit);
        let response = app(vec![failing.clone(), admitting.clone()], metrics.clone())
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "second");
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().auth_admitted.get("second"), Some(&1));
    }

    #[tokio::test]
    async fn test_first_admission_wins() {
        let first = Fixed::new("first", Outcome::Admit);
        let second = Fixed::new("second", Outcome::Admit);
        let response = app(
            vec![first.clone(), second.clone()],
            Arc::new(ProxyMetrics::new()),
        )
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

        assert_eq!(body(response).await, "first");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_verifiers_denies() {
        let response = app(vec![], Arc::new(ProxyMetrics::new()))
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
