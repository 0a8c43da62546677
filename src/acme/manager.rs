//! Certificate manager for a single domain.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, warn};

use super::cache::CertCache;
use super::challenge::ChallengeResponder;
use crate::config::LETS_ENCRYPT_DIRECTORY;
use crate::error::AcmeError;
use crate::metrics;
use crate::tls;

/// Cache key holding the ACME account credentials.
pub const ACCOUNT_KEY: &str = "acme_account+key";

/// Age after which a certificate is renewed. CA certificates last 90 days.
const RENEW_AFTER: time::Duration = time::Duration::days(60);

/// Delay between renewal checks after a successful check.
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Delay before retrying after a failed attempt.
const RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Maximum polls while waiting on the CA.
const MAX_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct CachedCertificate {
    certificate_chain: String,
    private_key: String,
    #[serde(with = "time::serde::rfc3339")]
    issued_at: OffsetDateTime,
}

impl CachedCertificate {
    fn is_fresh(&self) -> bool {
        OffsetDateTime::now_utc() - self.issued_at < RENEW_AFTER
    }
}

/// Obtains and renews the certificate for one domain.
///
/// Only the configured domain is served; the match is case-insensitive and
/// ignores a trailing dot.
pub struct CertManager {
    domain: String,
    cache: Arc<dyn CertCache>,
    directory_url: String,
    contact: Vec<String>,
    challenges: ChallengeResponder,
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl CertManager {
    /// Create a manager for `domain` storing state in `cache`.
    pub fn new(domain: impl Into<String>, cache: Arc<dyn CertCache>) -> Self {
        Self {
            domain: domain.into(),
            cache,
            directory_url: LETS_ENCRYPT_DIRECTORY.to_string(),
            contact: Vec::new(),
            challenges: ChallengeResponder::new(),
            current: RwLock::new(None),
        }
    }

    /// Use a different ACME directory, e.g. a staging environment.
    pub fn with_directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_url = url.into();
        self
    }

    /// Contact URIs registered with a new account.
    pub fn with_contact(mut self, contact: Vec<String>) -> Self {
        self.contact = contact;
        self
    }

    /// The managed domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Responder for the HTTP-01 challenge listener.
    pub fn challenges(&self) -> &ChallengeResponder {
        &self.challenges
    }

    /// Whether `host` is the managed domain.
    pub fn is_allowed_host(&self, host: &str) -> bool {
        host.trim_end_matches('.').eq_ignore_ascii_case(&self.domain)
    }

    /// The certificate currently served, if one has been loaded.
    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make sure a fresh certificate is installed.
    ///
    /// Uses the cached certificate while it is fresh, otherwise obtains a new
    /// one from the CA and caches it.
    #[instrument(skip(self), fields(domain = %self.domain))]
    pub async fn ensure_certificate(&self) -> Result<(), AcmeError> {
        if let Some(record) = self.cached_certificate().await? {
            if record.is_fresh() {
                self.install(&record)?;
                debug!("using cached certificate issued at {}", record.issued_at);
                return Ok(());
            }
            info!("certificate due for renewal");
        }

        let record = self.obtain().await?;
        self.cache
            .put(&self.domain, &serde_json::to_vec(&record)?)
            .await?;
        self.install(&record)?;
        metrics::record_certificate_obtained();
        info!("certificate obtained");
        Ok(())
    }

    /// Keep the certificate fresh until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            let delay = match self.ensure_certificate().await {
                Ok(()) => RENEWAL_CHECK_INTERVAL,
                Err(e) => {
                    error!(domain = %self.domain, error = %e, "failed to obtain certificate");
                    metrics::record_certificate_failure();
                    RETRY_DELAY
                }
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn cached_certificate(&self) -> Result<Option<CachedCertificate>, AcmeError> {
        let Some(data) = self.cache.get(&self.domain).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&data) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "ignoring corrupt cached certificate");
                Ok(None)
            }
        }
    }

    fn install(&self, record: &CachedCertificate) -> Result<(), AcmeError> {
        let key = tls::certified_key_from_pem(
            record.certificate_chain.as_bytes(),
            record.private_key.as_bytes(),
        )?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(key));
        Ok(())
    }

    async fn account(&self) -> Result<Account, AcmeError> {
        tls::install_crypto_provider();
        if let Some(data) = self.cache.get(ACCOUNT_KEY).await? {
            let credentials: AccountCredentials = serde_json::from_slice(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;
        self.cache
            .put(ACCOUNT_KEY, &serde_json::to_vec(&credentials)?)
            .await?;
        info!(directory = %self.directory_url, "registered acme account");
        Ok(account)
    }

    async fn obtain(&self) -> Result<CachedCertificate, AcmeError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(self.domain.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        let mut tokens = Vec::new();
        let mut result = Ok(());
        for authz in &authorizations {
            if !matches!(authz.status, AuthorizationStatus::Pending) {
                continue;
            }
            let Some(challenge) = authz
                .challenges
                .iter()
                .find(|c| matches!(c.r#type, ChallengeType::Http01))
            else {
                result = Err(AcmeError::NoHttpChallenge(self.domain.clone()));
                break;
            };

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .insert(challenge.token.clone(), key_authorization.as_str());
            tokens.push(challenge.token.clone());

            if let Err(e) = order.set_challenge_ready(&challenge.url).await {
                result = Err(e.into());
                break;
            }
        }

        let outcome = match result {
            Ok(()) => self.finish(&mut order).await,
            Err(e) => Err(e),
        };
        for token in &tokens {
            self.challenges.remove(token);
        }
        outcome
    }

    async fn finish(&self, order: &mut Order) -> Result<CachedCertificate, AcmeError> {
        let mut delay = Duration::from_millis(250);
        let mut attempts = 0;
        let status = loop {
            tokio::time::sleep(delay).await;
            let status = order.refresh().await?.status;
            if matches!(
                status,
                OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid
            ) {
                break status;
            }
            attempts += 1;
            if attempts >= MAX_POLL_ATTEMPTS {
                return Err(AcmeError::Timeout(self.domain.clone()));
            }
            delay *= 2;
        };
        if !matches!(status, OrderStatus::Ready) {
            return Err(AcmeError::OrderFailed {
                domain: self.domain.clone(),
                status: format!("{status:?}"),
            });
        }

        let mut params = CertificateParams::new(vec![self.domain.clone()])?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair = KeyPair::generate()?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let certificate_chain = loop {
            if let Some(chain) = order.certificate().await? {
                break chain;
            }
            attempts += 1;
            if attempts >= MAX_POLL_ATTEMPTS {
                return Err(AcmeError::Timeout(self.domain.clone()));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        Ok(CachedCertificate {
            certificate_chain,
            private_key: key_pair.serialize_pem(),
            issued_at: OffsetDateTime::now_utc(),
        })
    }
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("domain", &self.domain)
            .field("directory_url", &self.directory_url)
            .field("has_certificate", &self.certified_key().is_some())
            .finish_non_exhaustive()
    }
}
