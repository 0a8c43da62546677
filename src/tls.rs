//! rustls server configuration for the secured fulfillment listener.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use tracing::debug;

use crate::acme::CertManager;
use crate::error::TlsError;

/// Certificate chain and private key PEM files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate chain, leaf first.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

impl TlsFiles {
    /// Pair a certificate chain file with its key file.
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Read and parse both files.
    pub async fn load(&self) -> Result<CertifiedKey, TlsError> {
        let cert = read(&self.cert).await?;
        let key = read(&self.key).await?;
        certified_key_from_pem(&cert, &key)
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path).await.map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Make ring the process-wide rustls crypto provider.
///
/// Client connections made by the ACME library build their TLS configuration
/// from the process default, which cannot be chosen automatically when more
/// than one provider is compiled in. Later calls are no-ops.
pub fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Build a signing certificate from a PEM chain and PEM private key.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, TlsError> {
    let chain = CertificateDer::pem_slice_iter(cert_pem).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Picks the certificate for each handshake.
///
/// Names accepted by the certificate manager get its current certificate;
/// everything else gets the static certificate, if any.
pub struct CertResolver {
    manager: Option<Arc<CertManager>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl CertResolver {
    /// Create a resolver. At least one source should be present.
    pub fn new(manager: Option<Arc<CertManager>>, fallback: Option<CertifiedKey>) -> Self {
        Self {
            manager,
            fallback: fallback.map(Arc::new),
        }
    }

    fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let (Some(manager), Some(name)) = (&self.manager, server_name) {
            if manager.is_allowed_host(name) {
                if let Some(key) = manager.certified_key() {
                    return Some(key);
                }
            }
        }
        self.fallback.clone()
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver")
            .field("manager", &self.manager)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// Build the rustls server configuration around `resolver`.
pub fn server_config(resolver: CertResolver) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::MemoryCache;

    fn self_signed(name: &str) -> (String, String) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        (cert.pem(), signing_key.serialize_pem())
    }

    #[test]
    fn parses_pem_material() {
        let (cert, key) = self_signed("bot.example.com");
        let certified = certified_key_from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn rejects_empty_chain() {
        let (_, key) = self_signed("bot.example.com");
        assert!(matches!(
            certified_key_from_pem(b"", key.as_bytes()),
            Err(TlsError::NoCertificates)
        ));
    }

    #[tokio::test]
    async fn loads_files_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let (cert, key) = self_signed("bot.example.com");
        std::fs::write(tmp.path().join("cert.pem"), cert).unwrap();
        std::fs::write(tmp.path().join("key.pem"), key).unwrap();

        let files = TlsFiles::new(tmp.path().join("cert.pem"), tmp.path().join("key.pem"));
        assert!(files.load().await.is_ok());

        let missing = TlsFiles::new(tmp.path().join("nope.pem"), tmp.path().join("key.pem"));
        assert!(matches!(missing.load().await, Err(TlsError::Read { .. })));
    }

    #[test]
    fn resolver_falls_back_to_static_certificate() {
        let (cert, key) = self_signed("static.example.com");
        let fallback = certified_key_from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
        let manager = Arc::new(CertManager::new(
            "bot.example.com",
            Arc::new(MemoryCache::new()),
        ));
        let resolver = CertResolver::new(Some(manager), Some(fallback));

        assert!(resolver.resolve_name(Some("bot.example.com")).is_some());
        assert!(resolver.resolve_name(Some("other.example.com")).is_some());
        assert!(resolver.resolve_name(None).is_some());
    }

    #[test]
    fn resolver_without_fallback_requires_managed_name() {
        let manager = Arc::new(CertManager::new(
            "bot.example.com",
            Arc::new(MemoryCache::new()),
        ));
        let resolver = CertResolver::new(Some(manager), None);

        assert!(resolver.resolve_name(Some("bot.example.com")).is_none());
        assert!(resolver.resolve_name(Some("other.example.com")).is_none());
    }

    #[test]
    fn crypto_provider_install_is_repeatable() {
        install_crypto_provider();
        install_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }

    #[test]
    fn builds_server_config() {
        let (cert, key) = self_signed("bot.example.com");
        let fallback = certified_key_from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
        let config = server_config(CertResolver::new(None, Some(fallback))).unwrap();
        assert_eq!(config.alpn_protocols[1], b"http/1.1".to_vec());
    }
}
