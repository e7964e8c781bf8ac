//! Process-wide cache of compiled TLS contexts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::tls::{compile, TlsConfig};
use crate::Error;

/// Memoises compiled TLS contexts, keyed structurally on [`TlsConfig`].
///
/// At most one compile runs per key; simultaneous requesters for the same
/// configuration await the single in-flight build. Entries are immutable once
/// cached and shared by reference count. A failed build caches nothing, so
/// the next requester retries.
#[derive(Debug, Clone, Default)]
pub struct SslContextCache {
    entries: Arc<Mutex<HashMap<TlsConfig, Arc<OnceCell<Arc<rustls::ClientConfig>>>>>>,
}

impl SslContextCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache. All factories share it, so equal
    /// configurations compile once per process.
    pub fn shared() -> Self {
        static SHARED: std::sync::OnceLock<SslContextCache> = std::sync::OnceLock::new();
        SHARED.get_or_init(SslContextCache::new).clone()
    }

    /// Fetch the compiled context for `config`, compiling it on first use.
    pub async fn get_or_compile(
        &self,
        config: &TlsConfig,
    ) -> Result<Arc<rustls::ClientConfig>, Error> {
        let cell = {
            let mut entries = self.entries.lock().expect("ssl context cache poisoned");
            entries.entry(config.clone()).or_default().clone()
        };

        let context = cell
            .get_or_try_init(|| async { compile(config).map(Arc::new) })
            .await?;
        Ok(context.clone())
    }

    /// The number of cached configurations.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("ssl context cache poisoned")
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tls::CertificateVerification;

    fn insecure() -> TlsConfig {
        TlsConfig {
            verification: CertificateVerification::DangerouslyDisableVerification,
            ..TlsConfig::default()
        }
    }

    #[tokio::test]
    async fn equal_configs_share_one_context() {
        let cache = SslContextCache::new();

        let first = cache.get_or_compile(&insecure()).await.unwrap();
        let second = cache.get_or_compile(&insecure()).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn distinct_configs_compile_separately() {
        let cache = SslContextCache::new();

        let plain = insecure();
        let pinned = TlsConfig {
            alpn: vec![b"h2".to_vec()],
            ..insecure()
        };

        let first = cache.get_or_compile(&plain).await.unwrap();
        let second = cache.get_or_compile(&pinned).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_requesters_share_the_inflight_build() {
        let cache = SslContextCache::new();
        let config = insecure();

        let (a, b, c) = tokio::join!(
            cache.get_or_compile(&config),
            cache.get_or_compile(&config),
            cache.get_or_compile(&config),
        );

        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(cache.len(), 1);
    }
}
