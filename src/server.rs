//! Fulfillment server lifecycle.
//!
//! A [`Server`] owns three listeners:
//!
//! - the fulfillment listener, serving the action dispatcher (optionally
//!   behind basic auth, optionally over TLS)
//! - the health listener, reporting [`Server::status`] on `/health`
//! - the ACME challenge listener, answering HTTP-01 challenges when a domain
//!   is configured
//!
//! Startup configuration errors are returned before any listener binds. Once
//! serving, health and challenge listener failures are logged; a challenge
//! listener failure also marks the server unhealthy.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::http::StatusCode;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use strum::Display;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::acme::{CertCache, CertManager, DirCache};
use crate::auth::{self, BasicAuth};
use crate::config::{ServerConfig, DEFAULT_ADDR, DEFAULT_TLS_ADDR};
use crate::dispatch;
use crate::error::{ServerError, TlsError};
use crate::health::{self, HealthStatus};
use crate::registry::{Action, Actions};
use crate::signal::{self, ShutdownSignal};
use crate::tls::{self, CertResolver, TlsFiles};

/// The listeners a server manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ListenerKind {
    /// Serves fulfillment requests.
    Fulfillment,
    /// Serves `/health`.
    Health,
    /// Serves ACME HTTP-01 challenges.
    AcmeChallenge,
}

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ServerState {
    /// Built, not yet started.
    Unstarted,
    /// Listeners are running.
    Serving,
    /// Shutdown in progress.
    ShuttingDown,
    /// Shut down; cannot be restarted.
    Stopped,
}

struct Listener {
    kind: ListenerKind,
    stop: watch::Sender<bool>,
    running: watch::Sender<bool>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl Listener {
    fn new(kind: ListenerKind) -> Self {
        Self {
            kind,
            stop: watch::channel(false).0,
            running: watch::channel(false).0,
            local_addr: watch::channel(None).0,
        }
    }

    fn stop_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut stop = self.stop.subscribe();
        async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        }
    }

    async fn bind(&self, addr: &str) -> Result<TcpListener, ServerError> {
        let bind_error = |source| ServerError::Bind {
            listener: self.kind,
            addr: addr.to_owned(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;
        self.local_addr.send_replace(Some(local));
        info!(listener = %self.kind, addr = %local, "listening");
        Ok(listener)
    }

    async fn serve(&self, listener: TcpListener, router: Router) -> Result<(), ServerError> {
        self.running.send_replace(true);
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(self.stop_requested())
            .await;
        self.running.send_replace(false);
        result.map_err(|source| ServerError::Serve {
            listener: self.kind,
            source,
        })
    }

    async fn serve_tls(
        &self,
        listener: TcpListener,
        router: Router,
        config: RustlsConfig,
    ) -> Result<(), ServerError> {
        let serve_error = |source| ServerError::Serve {
            listener: self.kind,
            source,
        };
        let listener = listener.into_std().map_err(serve_error)?;

        let handle = axum_server::Handle::new();
        let stopper = handle.clone();
        let stop = self.stop_requested();
        let watcher = tokio::spawn(async move {
            stop.await;
            stopper.graceful_shutdown(None);
        });

        self.running.send_replace(true);
        let result = axum_server::from_tcp_rustls(listener, config)
            .handle(handle)
            .serve(router.into_make_service())
            .await;
        watcher.abort();
        self.running.send_replace(false);
        result.map_err(serve_error)
    }

    async fn run(&self, addr: &str, router: Router) -> Result<(), ServerError> {
        let listener = self.bind(addr).await?;
        self.serve(listener, router).await
    }

    /// Stop accepting and wait for in-flight requests, bounded by `timeout`.
    async fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        self.stop.send_replace(true);
        let mut running = self.running.subscribe();
        let drained = tokio::time::timeout(timeout, running.wait_for(|busy| !*busy))
            .await
            .is_ok();
        if drained {
            Ok(())
        } else {
            Err(ServerError::ShutdownTimeout {
                listener: self.kind,
                timeout,
            })
        }
    }
}

struct Inner {
    config: ServerConfig,
    actions: Arc<Actions>,
    cert_cache: Option<Arc<dyn CertCache>>,
    status: HealthStatus,
    state: Mutex<ServerState>,
    fulfillment: Listener,
    health: Listener,
    acme_challenge: Listener,
    renewal: Mutex<Option<AbortHandle>>,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    actions: Actions,
    cert_cache: Option<Arc<dyn CertCache>>,
}

impl ServerBuilder {
    /// Register a single action, replacing any previous handler for `name`.
    pub fn action(mut self, name: impl Into<String>, action: impl Action) -> Self {
        self.actions.set(name, action);
        self
    }

    /// Replace the whole action registry.
    pub fn actions(mut self, actions: Actions) -> Self {
        self.actions = actions;
        self
    }

    /// Store ACME state in `cache` instead of the configured directory.
    pub fn cert_cache(mut self, cache: Arc<dyn CertCache>) -> Self {
        self.cert_cache = Some(cache);
        self
    }

    /// Finish building the server.
    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(Inner {
                config: self.config,
                actions: Arc::new(self.actions),
                cert_cache: self.cert_cache,
                status: HealthStatus::new(),
                state: Mutex::new(ServerState::Unstarted),
                fulfillment: Listener::new(ListenerKind::Fulfillment),
                health: Listener::new(ListenerKind::Health),
                acme_challenge: Listener::new(ListenerKind::AcmeChallenge),
                renewal: Mutex::new(None),
            }),
        }
    }
}

/// A fulfillment server.
///
/// Cloning is cheap and every clone controls the same listeners, so one clone
/// can serve while another shuts it down.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// Start building a server from `config`.
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder {
            config,
            actions: Actions::new(),
            cert_cache: None,
        }
    }

    /// Build a server from `config` and `actions`.
    pub fn new(config: ServerConfig, actions: Actions) -> Self {
        Self::builder(config).actions(actions).build()
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The registered actions.
    pub fn actions(&self) -> &Actions {
        &self.inner.actions
    }

    /// Status reported by the health endpoint.
    pub fn status(&self) -> StatusCode {
        self.inner.status.get()
    }

    /// Set the status reported by the health endpoint.
    pub fn set_status(&self, status: StatusCode) {
        self.inner.status.set(status);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.lock_state()
    }

    /// Address a listener is bound to, once it has bound.
    pub fn local_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        *self.listener(kind).local_addr.borrow()
    }

    /// Wait until a listener has bound, returning its address, or `None` if
    /// it is shut down first.
    pub async fn listening(&self, kind: ListenerKind) -> Option<SocketAddr> {
        let listener = self.listener(kind);
        let mut addr = listener.local_addr.subscribe();
        let mut stop = listener.stop.subscribe();
        let bound = tokio::select! {
            bound = addr.wait_for(Option::is_some) => bound.ok().and_then(|addr| *addr),
            _ = stop.wait_for(|stopped| *stopped) => None,
        };
        bound
    }

    fn listener(&self, kind: ListenerKind) -> &Listener {
        match kind {
            ListenerKind::Fulfillment => &self.inner.fulfillment,
            ListenerKind::Health => &self.inner.health,
            ListenerKind::AcmeChallenge => &self.inner.acme_challenge,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_renewal(&self) -> MutexGuard<'_, Option<AbortHandle>> {
        self.inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the renewal task for shutdown, or stop it if shutdown already began.
    fn track_renewal(&self, renewal: AbortHandle) {
        let state = self.lock_state();
        if *state == ServerState::Serving {
            *self.lock_renewal() = Some(renewal);
        } else {
            renewal.abort();
        }
    }

    fn begin_serving(&self) -> Result<(), ServerError> {
        let mut state = self.lock_state();
        match *state {
            ServerState::Unstarted => {
                *state = ServerState::Serving;
                Ok(())
            }
            ServerState::Serving => Err(ServerError::AlreadyStarted),
            ServerState::ShuttingDown | ServerState::Stopped => Err(ServerError::Closed),
        }
    }

    fn fulfillment_router(&self, auth: Option<BasicAuth>) -> Router {
        let router = dispatch::router(self.inner.actions.clone());
        let router = match auth {
            Some(auth) => {
                info!(username = %auth.username(), "basic auth enabled");
                auth::protect(router, auth)
            }
            None => router,
        };
        router.layer(TraceLayer::new_for_http())
    }

    fn spawn_health(&self) {
        let addr = self.inner.config.health_addr().to_owned();
        let router = health::router(self.inner.status.clone());
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.inner.health.run(&addr, router).await {
                error!(error = %e, "health listener failed");
            }
        });
    }

    fn spawn_acme_challenge(&self, router: Router) {
        let addr = self.inner.config.acme_challenge_addr().to_owned();
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.inner.acme_challenge.run(&addr, router).await {
                server.set_status(StatusCode::SERVICE_UNAVAILABLE);
                error!(error = %e, "acme challenge listener failed");
            }
        });
    }

    fn cert_manager(&self, domain: &str) -> Arc<CertManager> {
        tls::install_crypto_provider();
        let config = &self.inner.config;
        let cache: Arc<dyn CertCache> = match &self.inner.cert_cache {
            Some(cache) => cache.clone(),
            None => Arc::new(DirCache::new(config.cache_directory())),
        };
        Arc::new(
            CertManager::new(domain, cache)
                .with_directory_url(config.acme_directory_url.clone())
                .with_contact(config.acme_contact.clone()),
        )
    }

    /// Serve fulfillment requests over plain HTTP.
    ///
    /// Listens on `addr` (default `0.0.0.0:80`) for fulfillment and
    /// `health_addr` (default `0.0.0.0:8080`) for health checks. Never returns
    /// `Ok`; after a graceful shutdown the result is [`ServerError::Closed`].
    pub async fn listen_and_serve(&self) -> Result<Infallible, ServerError> {
        let auth = self.inner.config.basic_auth()?;
        self.begin_serving()?;

        let addr = self.inner.config.fulfillment_addr(DEFAULT_ADDR).to_owned();
        let router = self.fulfillment_router(auth);

        self.spawn_health();
        self.set_status(StatusCode::OK);

        self.inner.fulfillment.run(&addr, router).await?;
        Err(ServerError::Closed)
    }

    /// Serve fulfillment requests over TLS.
    ///
    /// Listens on `addr` (default `0.0.0.0:443`), `health_addr` (default
    /// `0.0.0.0:8080`) and, when a domain is configured, `acme_challenge_addr`
    /// (default `0.0.0.0:80`).
    ///
    /// With a domain, certificates are obtained automatically from the ACME
    /// directory, which implies acceptance of the CA's terms of service;
    /// `files`, if given, serve any other name. Without a domain `files` is
    /// required. Never returns `Ok`; after a graceful shutdown the result is
    /// [`ServerError::Closed`].
    pub async fn listen_and_serve_tls(
        &self,
        files: Option<TlsFiles>,
    ) -> Result<Infallible, ServerError> {
        let auth = self.inner.config.basic_auth()?;

        let fallback = match &files {
            Some(files) => Some(files.load().await?),
            None => None,
        };
        let manager = self.inner.config.domain().map(|d| self.cert_manager(d));
        if manager.is_none() && fallback.is_none() {
            return Err(TlsError::MissingCertificate.into());
        }
        let tls_config = tls::server_config(CertResolver::new(manager.clone(), fallback))?;

        self.begin_serving()?;

        let addr = self
            .inner
            .config
            .fulfillment_addr(DEFAULT_TLS_ADDR)
            .to_owned();
        let router = self.fulfillment_router(auth);

        if let Some(manager) = manager {
            info!(domain = %manager.domain(), "automatic certificates enabled");
            self.set_status(StatusCode::OK);
            self.spawn_acme_challenge(manager.challenges().router());
            let renewal = tokio::spawn(manager.run());
            self.track_renewal(renewal.abort_handle());
        } else {
            self.set_status(StatusCode::OK);
        }

        self.spawn_health();

        let listener = self.inner.fulfillment.bind(&addr).await?;
        self.inner
            .fulfillment
            .serve_tls(listener, router, RustlsConfig::from_config(tls_config))
            .await?;
        Err(ServerError::Closed)
    }

    /// Run [`Server::listen_and_serve`] until one of `signals` arrives, then
    /// shut down. An empty list means interrupt and terminate.
    pub async fn listen_and_serve_until_signal(
        &self,
        signals: &[ShutdownSignal],
    ) -> std::io::Result<()> {
        let server = self.clone();
        self.until_signal(signals, async move { server.listen_and_serve().await })
            .await
    }

    /// Run [`Server::listen_and_serve_tls`] until one of `signals` arrives,
    /// then shut down. An empty list means interrupt and terminate.
    pub async fn listen_and_serve_tls_until_signal(
        &self,
        files: Option<TlsFiles>,
        signals: &[ShutdownSignal],
    ) -> std::io::Result<()> {
        let server = self.clone();
        self.until_signal(signals, async move { server.listen_and_serve_tls(files).await })
            .await
    }

    async fn until_signal<F>(&self, signals: &[ShutdownSignal], serve: F) -> std::io::Result<()>
    where
        F: Future<Output = Result<Infallible, ServerError>> + Send + 'static,
    {
        let received = signal::wait_for(signals)?;

        tokio::spawn(async move {
            let Err(e) = serve.await;
            if !e.is_closed() {
                error!(error = %e, "fulfillment server failed");
            }
        });

        let signal = received.await;
        info!(signal = %signal, "Shutdown signal received, exiting...");
        self.shutdown().await;
        Ok(())
    }

    /// Gracefully shut down the health, fulfillment and challenge listeners.
    ///
    /// Each listener is stopped independently; failures are logged and never
    /// returned. Safe to call on a server that never started.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::ShuttingDown;
        }

        let timeout = self.inner.config.shutdown_timeout();
        for listener in [
            &self.inner.health,
            &self.inner.fulfillment,
            &self.inner.acme_challenge,
        ] {
            match listener.shutdown(timeout).await {
                Ok(()) => debug!(listener = %listener.kind, "listener stopped"),
                Err(e) => error!(listener = %listener.kind, error = %e, "listener shutdown failed"),
            }
        }

        if let Some(renewal) = self.lock_renewal().take() {
            renewal.abort();
        }

        *self.lock_state() = ServerState::Stopped;
        info!("server stopped");
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("actions", &self.inner.actions)
            .field("status", &self.status())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
