//! Fulfillment webhook server for conversational-AI platforms.
//!
//! The platform POSTs a JSON envelope naming an action; the server looks the
//! action up in a registry of handlers, runs it and returns its JSON response.
//!
//! ```text
//! POST /  {"queryResult": {"action": "hello", ...}}
//!   -> basic auth
//!   -> dispatcher -> Actions["hello"] -> WebhookResponse
//!   <- 200 {"fulfillmentText": "Hello World!"}
//! ```
//!
//! # Modules
//!
//! - [`envelope`]: Request and response envelopes
//! - [`registry`]: Action handlers keyed by name
//! - [`dispatch`]: The fulfillment HTTP handler
//! - [`auth`]: Basic-auth middleware
//! - [`health`]: Health endpoint
//! - [`acme`]: Automatic certificates over HTTP-01
//! - [`tls`]: rustls configuration
//! - [`server`]: Listener lifecycle and graceful shutdown
//! - [`signal`]: OS shutdown signals
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`metrics`]: Prometheus metric names and helpers

pub mod acme;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod signal;
pub mod tls;

pub use config::ServerConfig;
pub use envelope::{WebhookRequest, WebhookResponse};
pub use error::{Result, ServerError};
pub use registry::{Action, ActionError, ActionResult, Actions};
pub use server::{ListenerKind, Server, ServerState};
pub use signal::ShutdownSignal;
pub use tls::TlsFiles;
