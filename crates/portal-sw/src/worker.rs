//! The offline worker: precache, eviction, fetch handling and the
//! out-of-band hooks.

use std::sync::Arc;
use std::time::Duration;

use portal_common::{retry_with_backoff, with_timeout};
use portal_net::{Fetch, NetError, Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Cache, CacheKey, CacheStorage, CachedResponse};
use crate::config::WorkerConfig;
use crate::error::ServiceWorkerError;
use crate::events::{NotificationOptions, SyncOutcome, SYNC_RESULTS_TAG};
use crate::router::{Disposition, Router};
use crate::strategy::{FetchOutcome, Strategy, StrategyContext};

/// One deployment of the offline worker, bound to a cache version.
pub struct OfflineWorker {
    config: WorkerConfig,
    root: Url,
    router: Router,
    caches: CacheStorage,
    fetcher: Arc<dyn Fetch>,
}

impl OfflineWorker {
    /// Create a worker from a validated config.
    pub fn new(
        config: WorkerConfig,
        caches: CacheStorage,
        fetcher: Arc<dyn Fetch>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let root = config.root_url();
        let router = Router::new(&root, config.data_service.clone());

        Ok(Self {
            config,
            root,
            router,
            caches,
            fetcher,
        })
    }

    /// The cache version this worker owns.
    pub fn version(&self) -> &str {
        &self.config.cache_version
    }

    /// Application root; also the registration scope.
    pub fn root_url(&self) -> &Url {
        &self.root
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Populate the current version's cache with every precache entry.
    ///
    /// All or nothing: the first entry that cannot be fetched, answers with a
    /// non-2xx status or cannot be stored fails the install. Running it again
    /// overwrites the same keys.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let cache = self
            .caches
            .open(&self.config.cache_version)
            .await
            .map_err(|e| self.install_failed(e))?;

        for path in &self.config.precache {
            self.precache_entry(&cache, path).await.map_err(|reason| {
                warn!(version = %self.config.cache_version, path = %path, reason = %reason, "Precache failed");
                self.install_failed(reason)
            })?;
        }

        info!(
            version = %self.config.cache_version,
            entries = self.config.precache.len(),
            "Precache complete"
        );
        Ok(())
    }

    async fn precache_entry(&self, cache: &Cache, path: &str) -> Result<(), String> {
        let url = self
            .root
            .join(path)
            .map_err(|e| format!("{path}: {e}"))?;

        let retry = self.config.precache_retry();
        let response = retry_with_backoff(&retry, || self.fetch_precache(url.clone()))
            .await
            .map_err(|e| format!("{path}: {e}"))?;

        // Stored without key headers; keyed lookups fall back to this entry.
        cache
            .put(&CacheKey::get(&url), CachedResponse::capture(response))
            .await
            .map_err(|e| format!("{path}: {e}"))?;

        debug!(url = %url, "Precached");
        Ok(())
    }

    async fn fetch_precache(&self, url: Url) -> Result<Response, String> {
        let response = with_timeout(self.network_timeout(), self.fetcher.fetch(Request::get(url)))
            .await
            .map_err(NetError::from)
            .and_then(|r| r)
            .map_err(|e| e.to_string())?;

        if !response.ok() {
            return Err(format!("unexpected status {}", response.status));
        }
        Ok(response)
    }

    fn install_failed(&self, reason: impl ToString) -> ServiceWorkerError {
        ServiceWorkerError::InstallFailed {
            version: self.config.cache_version.clone(),
            reason: reason.to_string(),
        }
    }

    /// Delete every cache whose name is not the current version. Returns the
    /// deleted names.
    pub async fn evict_stale(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut evicted = Vec::new();
        for name in self.caches.keys().await? {
            if name == self.config.cache_version {
                continue;
            }
            if self.caches.delete(&name).await? {
                info!(cache = %name, current = %self.config.cache_version, "Evicted stale cache");
                evicted.push(name);
            }
        }
        Ok(evicted)
    }

    /// Route one intercepted request and run its strategy.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        let strategy = match self.router.classify(&request) {
            Disposition::Passthrough => return FetchOutcome::Passthrough,
            Disposition::NetworkFirst => Strategy::NetworkFirst,
            Disposition::CacheFirst => Strategy::CacheFirst,
        };

        let cache = match self.caches.open(&self.config.cache_version).await {
            Ok(cache) => cache,
            Err(e) => {
                // Without a cache handle there is nothing to fall back to.
                warn!(version = %self.config.cache_version, error = %e, "Cache open failed, passing through");
                return FetchOutcome::Passthrough;
            }
        };

        let ctx = StrategyContext {
            cache: &cache,
            fetcher: self.fetcher.as_ref(),
            network_timeout: self.network_timeout(),
            key_headers: &self.config.key_headers,
        };
        strategy.execute(&ctx, request).await
    }

    /// Background-sync hook.
    pub fn handle_sync(&self, tag: &str) -> SyncOutcome {
        if tag == SYNC_RESULTS_TAG {
            info!(tag, "Background sync requested");
            SyncOutcome::Acknowledged
        } else {
            debug!(tag, "Ignoring unknown sync tag");
            SyncOutcome::Ignored
        }
    }

    /// Notification descriptor for a push message.
    pub fn push_notification(&self, payload: Option<&str>) -> NotificationOptions {
        NotificationOptions::for_push(&self.config.notification, payload)
    }

    fn network_timeout(&self) -> Duration {
        self.config.network_timeout()
    }
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("version", &self.config.cache_version)
            .field("root", &self.root.as_str())
            .finish()
    }
}
