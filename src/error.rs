//! Unified error types for the fulfillment server.

use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::registry::ActionError;
use crate::server::ListenerKind;

/// Lifecycle and startup errors returned by [`crate::Server`].
#[derive(Error, Debug)]
pub enum ServerError {
    /// Basic auth is enabled but no username is configured.
    #[error("fulfillment: basic auth username is empty")]
    EmptyUsername,

    /// Basic auth is enabled but no hashed password is configured.
    #[error("fulfillment: basic auth hashed password is empty")]
    EmptyHashedPassword,

    /// The server was already started once.
    #[error("fulfillment: server already started")]
    AlreadyStarted,

    /// The server was shut down. Returned by the start functions after a
    /// graceful shutdown, and when starting a server that was shut down.
    #[error("fulfillment: server closed")]
    Closed,

    /// A listener could not bind its address.
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        /// Which listener failed.
        listener: ListenerKind,
        /// The address it tried to bind.
        addr: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A listener's accept loop failed.
    #[error("{listener} listener failed: {source}")]
    Serve {
        /// Which listener failed.
        listener: ListenerKind,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// TLS material could not be loaded or configured.
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// A listener did not finish draining within the shutdown timeout.
    #[error("{listener} listener did not drain within {timeout:?}")]
    ShutdownTimeout {
        /// Which listener is still draining.
        listener: ListenerKind,
        /// The configured drain timeout.
        timeout: Duration,
    },
}

impl ServerError {
    /// Whether this is the graceful-close result rather than a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, ServerError::Closed)
    }
}

/// Per-request errors raised by the fulfillment dispatcher.
///
/// Each maps to a status code with an empty body; details only go to the log.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Request used a method other than POST.
    #[error("method {0} not allowed")]
    MethodNotAllowed(axum::http::Method),

    /// The request body could not be read.
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] axum::Error),

    /// The request body is not valid JSON.
    #[error("malformed request envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    /// No action is registered under the requested name.
    #[error("action {0} not supported")]
    UnsupportedAction(String),

    /// The action handler returned an error.
    #[error("action {action} failed: {source}")]
    ActionFailed {
        /// The action that failed.
        action: String,
        /// Error returned by the handler.
        #[source]
        source: ActionError,
    },

    /// The response envelope could not be serialized.
    #[error("failed to serialize response for action {action}: {source}")]
    Serialize {
        /// The action whose response failed to serialize.
        action: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            DispatchError::ReadBody(_)
            | DispatchError::MalformedEnvelope(_)
            | DispatchError::UnsupportedAction(_) => StatusCode::BAD_REQUEST,
            DispatchError::ActionFailed { .. } | DispatchError::Serialize { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short label used for the `outcome` metric dimension.
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::MethodNotAllowed(_) => "method_not_allowed",
            DispatchError::ReadBody(_) => "unreadable_body",
            DispatchError::MalformedEnvelope(_) => "malformed",
            DispatchError::UnsupportedAction(_) => "unsupported",
            DispatchError::ActionFailed { .. } => "action_failed",
            DispatchError::Serialize { .. } => "serialize_failed",
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        self.status().into_response()
    }
}

/// Basic-auth rejections.
#[derive(Error, Debug)]
pub enum AuthError {
    /// No usable `Authorization: Basic` header was sent.
    #[error("missing basic auth credentials")]
    MissingCredentials,

    /// The username does not match the configured one.
    #[error("unknown username {0}")]
    UnknownUser(String),

    /// The password did not verify against the stored hash.
    #[error("password verification failed: {0}")]
    InvalidPassword(String),
}

impl AuthError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingCredentials => StatusCode::UNAUTHORIZED,
            AuthError::UnknownUser(_) | AuthError::InvalidPassword(_) => StatusCode::FORBIDDEN,
        }
    }

    /// Short label used for the `reason` metric dimension.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::UnknownUser(_) => "unknown_user",
            AuthError::InvalidPassword(_) => "invalid_password",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (self.status(), [(header::WWW_AUTHENTICATE, "Basic")]).into_response()
    }
}

/// Certificate cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem error in the directory cache.
    #[error("cache io error on {key}: {source}")]
    Io {
        /// Cache key being accessed.
        key: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Key cannot be mapped to a cache entry.
    #[error("invalid cache key: {0:?}")]
    InvalidKey(String),
}

/// Automatic certificate issuance errors.
#[derive(Error, Debug)]
pub enum AcmeError {
    /// ACME protocol error reported by the client library.
    #[error("acme protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    /// Key or CSR generation failed.
    #[error("certificate request generation failed: {0}")]
    Csr(#[from] rcgen::Error),

    /// Certificate cache failed.
    #[error("certificate cache error: {0}")]
    Cache(#[from] CacheError),

    /// Cached account or certificate record is corrupt.
    #[error("invalid cache record: {0}")]
    Record(#[from] serde_json::Error),

    /// Certificate material could not be loaded into rustls.
    #[error("certificate load error: {0}")]
    Tls(#[from] TlsError),

    /// The CA offered no HTTP-01 challenge for the domain.
    #[error("no http-01 challenge offered for {0}")]
    NoHttpChallenge(String),

    /// The order ended in a non-ready state.
    #[error("order for {domain} ended in state {status}")]
    OrderFailed {
        /// Domain being ordered.
        domain: String,
        /// Final order status.
        status: String,
    },

    /// The order did not become ready in time.
    #[error("order for {0} timed out")]
    Timeout(String),
}

/// TLS configuration errors.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Certificate or key file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// PEM decoding failed.
    #[error("invalid pem: {0}")]
    Pem(#[from] rustls::pki_types::pem::Error),

    /// PEM input held no certificates.
    #[error("no certificates found")]
    NoCertificates,

    /// rustls rejected the key or configuration.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// Neither a domain nor certificate files were provided.
    #[error("tls requires a domain or certificate and key files")]
    MissingCertificate,
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_map_to_status_codes() {
        assert_eq!(
            DispatchError::MethodNotAllowed(axum::http::Method::GET).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            DispatchError::UnsupportedAction("missing".into()).status(),
            StatusCode::BAD_REQUEST
        );
        let failed = DispatchError::ActionFailed {
            action: "hello".into(),
            source: "boom".into(),
        };
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn auth_errors_carry_challenge_header() {
        let response = AuthError::UnknownUser("mallory".into()).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");

        let response = AuthError::MissingCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic");
    }

    #[test]
    fn configuration_errors_are_distinct() {
        assert_ne!(
            ServerError::EmptyUsername.to_string(),
            ServerError::EmptyHashedPassword.to_string()
        );
        assert!(ServerError::Closed.is_closed());
        assert!(!ServerError::AlreadyStarted.is_closed());
    }
}
