//! Server configuration, optionally loaded from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::auth::BasicAuth;
use crate::error::ServerError;

/// Environment variable prefix used by [`ServerConfig::load`].
pub const ENV_PREFIX: &str = "FULFILLMENT_";

/// Default fulfillment address for plain HTTP.
pub const DEFAULT_ADDR: &str = "0.0.0.0:80";
/// Default fulfillment address for TLS.
pub const DEFAULT_TLS_ADDR: &str = "0.0.0.0:443";
/// Default health listener address.
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";
/// Default ACME HTTP-01 challenge listener address.
pub const DEFAULT_ACME_CHALLENGE_ADDR: &str = "0.0.0.0:80";
/// Directory used to cache certificates when none is configured.
pub const DEFAULT_CACHE_DIRECTORY: &str = "/var/lib/fulfillment/certs";
/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Fulfillment server configuration.
///
/// Set once before startup. Every field can be supplied through a
/// `FULFILLMENT_`-prefixed environment variable, e.g. `FULFILLMENT_ADDR`.
#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    // === Listeners ===
    /// Fulfillment listen address. Defaults to port 80 (plain) or 443 (TLS).
    #[serde(default)]
    pub addr: Option<String>,

    /// Health listen address. Defaults to `0.0.0.0:8080`.
    #[serde(default)]
    pub health_addr: Option<String>,

    /// ACME HTTP-01 challenge listen address. Defaults to `0.0.0.0:80`.
    #[serde(default)]
    pub acme_challenge_addr: Option<String>,

    // === Basic Auth ===
    /// Basic auth username. Required unless auth is disabled.
    #[serde(default)]
    pub basic_auth_username: String,

    /// PHC-format argon2 hash of the basic auth password. Required unless auth
    /// is disabled.
    #[serde(default)]
    pub basic_auth_hashed_password: String,

    /// Disable basic auth for fulfillment requests.
    #[serde(default)]
    pub disable_basic_auth: bool,

    // === Automatic Certificates ===
    /// Fully qualified domain. When set, TLS certificates are obtained
    /// automatically.
    #[serde(default)]
    pub domain: Option<String>,

    /// Directory for cached certificates and the ACME account.
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    /// ACME directory URL.
    #[serde(default = "default_acme_directory_url")]
    pub acme_directory_url: String,

    /// Contact URIs registered with the ACME account, e.g. `mailto:ops@example.com`.
    #[serde(default)]
    pub acme_contact: Vec<String>,

    // === Lifecycle ===
    /// Per-listener drain timeout during shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn default_acme_directory_url() -> String {
    LETS_ENCRYPT_DIRECTORY.to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: None,
            health_addr: None,
            acme_challenge_addr: None,
            basic_auth_username: String::new(),
            basic_auth_hashed_password: String::new(),
            disable_basic_auth: false,
            domain: None,
            cache_directory: None,
            acme_directory_url: default_acme_directory_url(),
            acme_contact: Vec::new(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("addr", &self.addr)
            .field("health_addr", &self.health_addr)
            .field("acme_challenge_addr", &self.acme_challenge_addr)
            .field("basic_auth_username", &self.basic_auth_username)
            .field("disable_basic_auth", &self.disable_basic_auth)
            .field("domain", &self.domain)
            .field("cache_directory", &self.cache_directory)
            .field("acme_directory_url", &self.acme_directory_url)
            .field("acme_contact", &self.acme_contact)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed(ENV_PREFIX).from_env()
    }

    /// Validate the basic auth settings.
    ///
    /// Returns `None` when auth is disabled.
    pub fn basic_auth(&self) -> Result<Option<BasicAuth>, ServerError> {
        if self.disable_basic_auth {
            return Ok(None);
        }
        BasicAuth::new(
            self.basic_auth_username.clone(),
            self.basic_auth_hashed_password.clone(),
        )
        .map(Some)
    }

    /// The configured domain, ignoring blank values.
    pub fn domain(&self) -> Option<&str> {
        non_blank(&self.domain)
    }

    /// Fulfillment listen address, or `default` when unset or blank.
    pub fn fulfillment_addr<'a>(&'a self, default: &'a str) -> &'a str {
        non_blank(&self.addr).unwrap_or(default)
    }

    /// Health listen address, falling back to [`DEFAULT_HEALTH_ADDR`].
    pub fn health_addr(&self) -> &str {
        non_blank(&self.health_addr).unwrap_or(DEFAULT_HEALTH_ADDR)
    }

    /// ACME challenge listen address, falling back to
    /// [`DEFAULT_ACME_CHALLENGE_ADDR`].
    pub fn acme_challenge_addr(&self) -> &str {
        non_blank(&self.acme_challenge_addr).unwrap_or(DEFAULT_ACME_CHALLENGE_ADDR)
    }

    /// Certificate cache directory, falling back to the default.
    pub fn cache_directory(&self) -> &Path {
        self.cache_directory
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CACHE_DIRECTORY))
    }

    /// Per-listener drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_values_are_sensible() {
        let config = ServerConfig::default();
        assert_eq!(config.acme_directory_url, LETS_ENCRYPT_DIRECTORY);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache_directory(), Path::new(DEFAULT_CACHE_DIRECTORY));
        assert!(!config.disable_basic_auth);
        assert!(config.domain().is_none());
    }

    #[test]
    fn basic_auth_rejects_empty_username() {
        let config = ServerConfig {
            basic_auth_hashed_password: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".into(),
            ..ServerConfig::default()
        };

        assert!(matches!(config.basic_auth(), Err(ServerError::EmptyUsername)));
    }

    #[test]
    fn basic_auth_rejects_empty_hashed_password() {
        let config = ServerConfig {
            basic_auth_username: "dialog".into(),
            ..ServerConfig::default()
        };

        assert!(matches!(
            config.basic_auth(),
            Err(ServerError::EmptyHashedPassword)
        ));
    }

    #[test]
    fn disabled_auth_skips_validation() {
        let config = ServerConfig {
            disable_basic_auth: true,
            ..ServerConfig::default()
        };

        assert!(config.basic_auth().unwrap().is_none());
    }

    #[test]
    fn loads_prefixed_variables() {
        let vars = vec![
            ("FULFILLMENT_ADDR".to_string(), "127.0.0.1:9000".to_string()),
            ("FULFILLMENT_DISABLE_BASIC_AUTH".to_string(), "true".to_string()),
            ("FULFILLMENT_DOMAIN".to_string(), "bot.example.com".to_string()),
            (
                "FULFILLMENT_ACME_CONTACT".to_string(),
                "mailto:a@example.com,mailto:b@example.com".to_string(),
            ),
        ];

        let config: ServerConfig = envy::prefixed(ENV_PREFIX).from_iter(vars).unwrap();

        assert_eq!(config.addr.as_deref(), Some("127.0.0.1:9000"));
        assert!(config.disable_basic_auth);
        assert_eq!(config.domain(), Some("bot.example.com"));
        assert_eq!(
            config.acme_contact,
            vec!["mailto:a@example.com", "mailto:b@example.com"]
        );
        assert_eq!(config.health_addr, None);
    }

    #[test]
    fn blank_addresses_fall_back_to_defaults() {
        let config = ServerConfig {
            addr: Some(String::new()),
            health_addr: Some("   ".into()),
            acme_challenge_addr: None,
            ..ServerConfig::default()
        };

        assert_eq!(config.fulfillment_addr(DEFAULT_ADDR), DEFAULT_ADDR);
        assert_eq!(config.fulfillment_addr(DEFAULT_TLS_ADDR), DEFAULT_TLS_ADDR);
        assert_eq!(config.health_addr(), DEFAULT_HEALTH_ADDR);
        assert_eq!(config.acme_challenge_addr(), DEFAULT_ACME_CHALLENGE_ADDR);
    }

    #[test]
    fn empty_address_variable_reads_as_unset() {
        let vars = vec![
            ("FULFILLMENT_ADDR".to_string(), String::new()),
            ("FULFILLMENT_HEALTH_ADDR".to_string(), "127.0.0.1:9090".to_string()),
        ];

        let config: ServerConfig = envy::prefixed(ENV_PREFIX).from_iter(vars).unwrap();

        assert_eq!(config.fulfillment_addr(DEFAULT_TLS_ADDR), DEFAULT_TLS_ADDR);
        assert_eq!(config.health_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn blank_domain_is_ignored() {
        let config = ServerConfig {
            domain: Some("  ".into()),
            ..ServerConfig::default()
        };
        assert!(config.domain().is_none());
    }
}
