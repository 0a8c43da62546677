//! HTTP-01 challenge responder.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axum::extract::{Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::debug;

/// Path prefix the CA requests challenge tokens under.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges, keyed by token.
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponder {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeResponder {
    /// Create an empty responder.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the key authorization for `token`.
    pub fn insert(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.write().insert(token.into(), key_authorization.into());
    }

    /// Withdraw `token`.
    pub fn remove(&self, token: &str) {
        self.write().remove(token);
    }

    /// Key authorization published for `token`.
    pub fn get(&self, token: &str) -> Option<String> {
        self.read().get(token).cloned()
    }

    /// Router for the challenge listener.
    ///
    /// Serves published tokens. Any other GET or HEAD is redirected to HTTPS;
    /// other methods get 400.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&format!("{CHALLENGE_PATH_PREFIX}:token"), get(serve_token))
            .fallback(redirect_to_https)
            .with_state(self.clone())
    }
}

async fn serve_token(
    State(responder): State<ChallengeResponder>,
    Path(token): Path<String>,
) -> Response {
    match responder.get(&token) {
        Some(key_authorization) => {
            debug!(token = %token, "answering http-01 challenge");
            (
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect_to_https(request: Request) -> Response {
    if request.method() != Method::GET && request.method() != Method::HEAD {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let host = strip_port(host);

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("https://{host}{path}"))],
    )
        .into_response()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map(|i| &host[..=i]).unwrap_or(host);
    }
    host.split_once(':').map(|(h, _)| h).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    #[tokio::test]
    async fn serves_published_tokens() {
        let responder = ChallengeResponder::new();
        responder.insert("tok123", "tok123.thumbprint");

        let response = responder
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/.well-known/acme-challenge/tok123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"tok123.thumbprint");
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let responder = ChallengeResponder::new();
        responder.insert("tok123", "x");
        responder.remove("tok123");

        let response = responder
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/.well-known/acme-challenge/tok123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn other_get_requests_redirect_to_https() {
        let response = ChallengeResponder::new()
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/webhook?x=1")
                    .header(header::HOST, "bot.example.com:80")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://bot.example.com/webhook?x=1"
        );
    }

    #[tokio::test]
    async fn other_methods_are_bad_requests() {
        let response = ChallengeResponder::new()
            .router()
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/")
                    .header(header::HOST, "bot.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn tokens_survive_a_poisoned_lock() {
        let responder = ChallengeResponder::new();
        let poisoner = responder.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.tokens.write().unwrap();
            panic!("poison the token lock");
        })
        .join();

        responder.insert("tok123", "tok123.thumbprint");
        assert_eq!(responder.get("tok123").as_deref(), Some("tok123.thumbprint"));
        responder.remove("tok123");
        assert!(responder.get("tok123").is_none());
    }

    #[test]
    fn strips_ports_from_hosts() {
        assert_eq!(strip_port("bot.example.com:8080"), "bot.example.com");
        assert_eq!(strip_port("bot.example.com"), "bot.example.com");
        assert_eq!(strip_port("[::1]:80"), "[::1]");
    }
}
