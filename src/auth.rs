//! HTTP basic-auth middleware.
//!
//! Requests must carry `Authorization: Basic ..` credentials whose username
//! matches exactly and whose password verifies against a PHC-format argon2
//! hash. Anything else is rejected with a `WWW-Authenticate: Basic` challenge.

use std::fmt;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use tracing::{debug, warn};

use crate::error::{AuthError, ServerError};
use crate::metrics;

/// Configured basic-auth credentials.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    hashed_password: String,
}

impl BasicAuth {
    /// Validate and build credentials.
    ///
    /// An empty username or hashed password is a configuration error.
    pub fn new(
        username: impl Into<String>,
        hashed_password: impl Into<String>,
    ) -> Result<Self, ServerError> {
        let username = username.into();
        let hashed_password = hashed_password.into();
        if username.is_empty() {
            return Err(ServerError::EmptyUsername);
        }
        if hashed_password.is_empty() {
            return Err(ServerError::EmptyHashedPassword);
        }
        Ok(Self {
            username,
            hashed_password,
        })
    }

    /// The configured username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check presented credentials.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let (username, password) =
            parse_basic_auth(headers).ok_or(AuthError::MissingCredentials)?;

        if username != self.username {
            return Err(AuthError::UnknownUser(username));
        }

        let hashed_password = self.hashed_password.clone();
        tokio::task::spawn_blocking(move || verify_password(&hashed_password, &password))
            .await
            .map_err(|e| AuthError::InvalidPassword(e.to_string()))?
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn verify_password(hashed_password: &str, password: &str) -> Result<(), AuthError> {
    let hash =
        PasswordHash::new(hashed_password).map_err(|e| AuthError::InvalidPassword(e.to_string()))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &hash)
        .map_err(|e| AuthError::InvalidPassword(e.to_string()))
}

/// Hash `password` into the PHC string format expected by [`BasicAuth`].
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// Extract `(username, password)` from an `Authorization: Basic` header.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// Middleware enforcing basic auth before the wrapped handler runs.
pub async fn require_basic_auth(
    State(auth): State<Arc<BasicAuth>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if let Err(e) = auth.authenticate(request.headers()).await {
        match &e {
            AuthError::InvalidPassword(reason) => warn!(error = %reason, "basic auth failed"),
            _ => debug!(error = %e, "basic auth rejected"),
        }
        metrics::record_auth_failure(&e);
        return Err(e);
    }
    Ok(next.run(request).await)
}

/// Wrap `router` so every request must pass basic auth.
pub fn protect(router: Router, auth: BasicAuth) -> Router {
    router.layer(middleware::from_fn_with_state(
        Arc::new(auth),
        require_basic_auth,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch;
    use crate::envelope::{WebhookRequest, WebhookResponse};
    use crate::registry::{ActionResult, Actions};
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app(calls: Arc<AtomicUsize>) -> Router {
        let mut actions = Actions::new();
        actions.set("hello", move |_: &WebhookRequest| -> ActionResult {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(WebhookResponse::empty())
        });
        let auth = BasicAuth::new("dialog", hash_password("s3cret").unwrap()).unwrap();
        protect(dispatch::router(Arc::new(actions)), auth)
    }

    fn request(authorization: Option<String>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::from(r#"{"action":"hello"}"#)).unwrap()
    }

    fn basic(username: &str, password: &str) -> Option<String> {
        Some(format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))))
    }

    #[test]
    fn empty_fields_are_distinct_configuration_errors() {
        assert!(matches!(
            BasicAuth::new("", "hash"),
            Err(ServerError::EmptyUsername)
        ));
        assert!(matches!(
            BasicAuth::new("dialog", ""),
            Err(ServerError::EmptyHashedPassword)
        ));
        assert!(matches!(BasicAuth::new("", ""), Err(ServerError::EmptyUsername)));
    }

    #[test]
    fn parses_basic_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            basic("user", "pa:ss").unwrap().parse().unwrap(),
        );
        assert_eq!(
            parse_basic_auth(&headers),
            Some(("user".to_owned(), "pa:ss".to_owned()))
        );

        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(parse_basic_auth(&headers), None);

        headers.insert(header::AUTHORIZATION, "Basic !!!".parse().unwrap());
        assert_eq!(parse_basic_auth(&headers), None);
    }

    #[tokio::test]
    async fn missing_credentials_get_401_challenge() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = app(calls.clone()).oneshot(request(None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_username_gets_403_challenge() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = app(calls.clone())
            .oneshot(request(basic("mallory", "s3cret")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_password_gets_403_challenge() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = app(calls.clone())
            .oneshot(request(basic("dialog", "guess")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unparsable_stored_hash_fails_closed() {
        let auth = BasicAuth::new("dialog", "not-a-phc-string").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            basic("dialog", "anything").unwrap().parse().unwrap(),
        );

        let err = auth.authenticate(&headers).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidPassword(_)));
    }

    #[tokio::test]
    async fn valid_credentials_reach_the_dispatcher() {
        let calls = Arc::new(AtomicUsize::new(0));
        let response = app(calls.clone())
            .oneshot(request(basic("dialog", "s3cret")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
