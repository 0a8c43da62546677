//! Certificate caches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::CacheError;

/// Storage for ACME account credentials and certificates as opaque bytes.
#[async_trait]
pub trait CertCache: Send + Sync + 'static {
    /// Fetch the data stored under `key`, or `None` on a cache miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `data` under `key`, replacing any previous value.
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Remove `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Cache storing one file per key inside a directory.
///
/// The directory is created on first write.
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    /// Create a cache rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(CacheError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(key))
    }

    async fn ensure_dir(&self, key: &str) -> Result<(), CacheError> {
        let io = |source| CacheError::Io {
            key: key.to_owned(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(io)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CertCache for DirCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path(key)?;
        self.ensure_dir(key).await?;

        let tmp = self.dir.join(format!(".{key}.tmp"));
        let io = |source| CacheError::Io {
            key: key.to_owned(),
            source,
        };
        tokio::fs::write(&tmp, data).await.map_err(io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io)?;

        debug!(key, dir = %self.dir.display(), "cache entry written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

/// In-process cache. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_cache_stores_and_deletes_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(tmp.path().join("certs"));

        assert_eq!(cache.get("bot.example.com").await.unwrap(), None);

        cache.put("bot.example.com", b"pem data").await.unwrap();
        assert_eq!(
            cache.get("bot.example.com").await.unwrap().as_deref(),
            Some(&b"pem data"[..])
        );

        cache.put("bot.example.com", b"renewed").await.unwrap();
        assert_eq!(
            cache.get("bot.example.com").await.unwrap().as_deref(),
            Some(&b"renewed"[..])
        );

        cache.delete("bot.example.com").await.unwrap();
        assert_eq!(cache.get("bot.example.com").await.unwrap(), None);
        cache.delete("bot.example.com").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dir_cache_directory_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(tmp.path().join("certs"));
        cache.put("acme_account+key", b"{}").await.unwrap();

        let mode = std::fs::metadata(cache.dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn dir_cache_rejects_path_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DirCache::new(tmp.path());

        assert!(matches!(
            cache.put("../escape", b"x").await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(cache.get("").await, Err(CacheError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let cache = MemoryCache::new();
        cache.put("k", b"v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
