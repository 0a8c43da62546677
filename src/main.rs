//! Fulfillment webhook server entry point.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fulfillment::config::{ServerConfig, DEFAULT_ADDR, DEFAULT_TLS_ADDR};
use fulfillment::metrics;
use fulfillment::signal::DEFAULT_SIGNALS;
use fulfillment::{auth, ActionResult, Actions, Server, TlsFiles, WebhookRequest, WebhookResponse};

/// Fulfillment webhook server.
#[derive(Parser, Debug)]
#[command(name = "fulfillment-webhook")]
#[command(about = "Webhook fulfillment server for conversational-AI platforms")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Serve Prometheus metrics on this address.
    #[arg(long, global = true, env = "FULFILLMENT_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve fulfillment over plain HTTP (default).
    Serve {
        #[command(flatten)]
        listen: ListenArgs,
    },

    /// Serve fulfillment over TLS.
    ///
    /// With FULFILLMENT_DOMAIN set, certificates are obtained automatically;
    /// otherwise --cert and --key are required.
    ServeTls {
        #[command(flatten)]
        listen: ListenArgs,

        /// PEM certificate chain.
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key.
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Check configuration validity.
    CheckConfig,

    /// Print the hash to use for FULFILLMENT_BASIC_AUTH_HASHED_PASSWORD.
    HashPassword {
        /// Password to hash.
        password: String,
    },
}

/// Listen address overrides.
#[derive(ClapArgs, Debug, Default)]
struct ListenArgs {
    /// Fulfillment listen address.
    #[arg(long)]
    addr: Option<String>,

    /// Health listen address.
    #[arg(long)]
    health_addr: Option<String>,

    /// ACME challenge listen address.
    #[arg(long)]
    acme_challenge_addr: Option<String>,
}

impl ListenArgs {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(addr) = self.addr {
            config.addr = Some(addr);
        }
        if let Some(addr) = self.health_addr {
            config.health_addr = Some(addr);
        }
        if let Some(addr) = self.acme_challenge_addr {
            config.acme_challenge_addr = Some(addr);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("fulfillment=debug,tower_http=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Initialize metrics
    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }
    metrics::init_metrics();

    // Handle subcommands
    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(),
        Some(Command::HashPassword { password }) => cmd_hash_password(&password),
        Some(Command::ServeTls { listen, cert, key }) => {
            let files = cert.zip(key).map(|(cert, key)| TlsFiles::new(cert, key));
            cmd_serve_tls(listen, files).await
        }
        Some(Command::Serve { listen }) => cmd_serve(listen).await,
        None => cmd_serve(ListenArgs::default()).await,
    }
}

/// Load configuration, apply CLI overrides and build the server.
fn build_server(listen: ListenArgs) -> anyhow::Result<Server> {
    info!("Loading configuration...");
    let mut config = ServerConfig::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    listen.apply(&mut config);

    if let Err(e) = config.basic_auth() {
        error!("Invalid configuration: {}", e);
        return Err(anyhow::anyhow!("Configuration validation failed: {}", e));
    }

    let mut actions = Actions::new();
    actions.set("hello", |request: &WebhookRequest| -> ActionResult {
        Ok(WebhookResponse::reply_to(request, "Hello World!"))
    });
    info!("Registered actions: {:?}", actions.names());

    Ok(Server::new(config, actions))
}

/// Serve over plain HTTP until interrupted.
async fn cmd_serve(listen: ListenArgs) -> anyhow::Result<()> {
    let server = build_server(listen)?;
    server.listen_and_serve_until_signal(&DEFAULT_SIGNALS).await?;
    Ok(())
}

/// Serve over TLS until interrupted.
async fn cmd_serve_tls(listen: ListenArgs, files: Option<TlsFiles>) -> anyhow::Result<()> {
    let server = build_server(listen)?;
    if server.config().domain().is_none() && files.is_none() {
        return Err(anyhow::anyhow!(
            "serve-tls needs FULFILLMENT_DOMAIN or --cert and --key"
        ));
    }
    server
        .listen_and_serve_tls_until_signal(files, &DEFAULT_SIGNALS)
        .await?;
    Ok(())
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("FULFILLMENT WEBHOOK - CONFIGURATION CHECK");
    println!("======================================================================");

    // Load configuration
    print!("Loading configuration... ");
    let config = match ServerConfig::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    // Validate basic auth
    print!("Validating basic auth... ");
    match config.basic_auth() {
        Ok(Some(auth)) => {
            println!("OK");
            println!("  Username: {}", auth.username());
        }
        Ok(None) => println!("DISABLED"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    // Show configuration summary
    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!(
        "  Address: {} (plain) / {} (tls)",
        config.fulfillment_addr(DEFAULT_ADDR),
        config.fulfillment_addr(DEFAULT_TLS_ADDR)
    );
    println!("  Health Address: {}", config.health_addr());
    match config.domain() {
        Some(domain) => {
            println!("  Domain: {}", domain);
            println!("  Challenge Address: {}", config.acme_challenge_addr());
            println!("  Certificate Cache: {}", config.cache_directory().display());
            println!("  ACME Directory: {}", config.acme_directory_url);
        }
        None => println!("  Domain: (none, static certificates only)"),
    }
    println!("  Shutdown Timeout: {:?}", config.shutdown_timeout());
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Hash a password for the basic auth configuration.
fn cmd_hash_password(password: &str) -> anyhow::Result<()> {
    if password.is_empty() {
        return Err(anyhow::anyhow!("Password must not be empty"));
    }
    let hash = auth::hash_password(password).map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", hash);
    Ok(())
}
