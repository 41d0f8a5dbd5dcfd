//! Registration container: worker lifecycle per scope and event dispatch.
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── ServiceWorkerRegistration (one per scope)
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     ├── Clients
//!     └── Notifications
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use portal_net::Request;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};
use url::Url;

use crate::clients::{ClientId, ClientMatchOptions, ClientType, Clients};
use crate::error::ServiceWorkerError;
use crate::events::{Notification, NotificationId, Notifications, SyncOutcome};
use crate::strategy::FetchOutcome;
use crate::worker::OfflineWorker;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Precaching.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Evicting stale caches.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or install failed.
    Redundant,
}

// ==================== Service Worker ====================

/// A worker instance inside a registration.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    /// Cache version of the deployment.
    pub version: String,
    pub state: ServiceWorkerState,
    /// Time of last state change.
    pub state_changed_at: Instant,
    worker: Arc<OfflineWorker>,
}

impl ServiceWorker {
    pub fn new(worker: Arc<OfflineWorker>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: worker.version().to_string(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            worker,
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    /// Whether fetches should be routed through this worker.
    pub fn controls_fetches(&self) -> bool {
        matches!(
            self.state,
            ServiceWorkerState::Activating | ServiceWorkerState::Activated
        )
    }

    pub fn worker(&self) -> &Arc<OfflineWorker> {
        &self.worker
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            version: self.version.clone(),
            state: self.state,
        }
    }
}

// ==================== Registration ====================

/// A registration: at most one worker per slot.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// The worker fetches are routed to, if any.
    pub fn controller(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.controls_fetches())
    }

    /// Start installing a new worker. Any worker already installing is
    /// superseded and returned marked redundant.
    pub fn update(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        self.installing.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Move the installing worker `id` to waiting.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<(), ServiceWorkerError> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Installed);
                if let Some(mut old) = self.waiting.replace(worker) {
                    old.set_state(ServiceWorkerState::Redundant);
                }
                Ok(())
            }
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(format!(
                    "{id} is no longer installing"
                )))
            }
        }
    }

    /// Drop the installing worker `id` after a failed install.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        match self.installing.take() {
            Some(mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Redundant);
                Some(worker)
            }
            other => {
                self.installing = other;
                None
            }
        }
    }

    /// Promote the waiting worker to active (state `Activating`). Returns the
    /// replaced worker, marked redundant.
    pub fn skip_waiting(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);
        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Finish activation of the active worker `id`.
    pub fn activation_complete(&mut self, id: ServiceWorkerId) -> Result<(), ServiceWorkerError> {
        match self.active.as_mut() {
            Some(worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                Ok(())
            }
            _ => Err(ServiceWorkerError::StateError(format!(
                "{id} is no longer the active worker"
            ))),
        }
    }

    /// Mark every worker redundant and empty the slots.
    pub fn unregister(&mut self) {
        for slot in [&mut self.installing, &mut self.waiting, &mut self.active] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.installing.is_none() && self.waiting.is_none() && self.active.is_none()
    }

    pub fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            scope: self.scope.clone(),
            installing: self.installing.as_ref().map(ServiceWorker::snapshot),
            waiting: self.waiting.as_ref().map(ServiceWorker::snapshot),
            active: self.active.as_ref().map(ServiceWorker::snapshot),
        }
    }
}

/// Serializable view of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: ServiceWorkerId,
    pub version: String,
    pub state: ServiceWorkerState,
}

/// Serializable view of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationSnapshot {
    pub scope: Url,
    pub installing: Option<WorkerSnapshot>,
    pub waiting: Option<WorkerSnapshot>,
    pub active: Option<WorkerSnapshot>,
}

// ==================== Events ====================

/// Events emitted by the container.
#[derive(Debug, Clone)]
pub enum ServiceWorkerEvent {
    /// A worker changed state.
    StateChange {
        scope: Url,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { scope: Url, version: String },
    /// Precache failed; the worker is redundant.
    InstallFailed {
        scope: Url,
        version: String,
        reason: String,
    },
    /// Stale caches were deleted during activation.
    CachesEvicted { scope: Url, names: Vec<String> },
    /// A client is now controlled by `worker_id`.
    ControllerChange {
        client_id: ClientId,
        worker_id: ServiceWorkerId,
    },
    NotificationShown(Notification),
    NotificationClosed(NotificationId),
    WindowOpened { client_id: ClientId, url: Url },
    WindowFocused { client_id: ClientId },
}

// ==================== Container ====================

/// Host side of the worker: owns registrations, clients and notifications.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Per-scope job lock; register and unregister run one at a time.
    jobs: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,

    pub clients: Arc<RwLock<Clients>>,

    pub notifications: Arc<RwLock<Notifications>>,

    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                jobs: Arc::new(Mutex::new(HashMap::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                notifications: Arc::new(RwLock::new(Notifications::new())),
                event_tx,
            },
            event_rx,
        )
    }

    /// Install, activate and let `worker` claim its scope.
    ///
    /// On install failure the new worker is redundant and whatever was active
    /// before keeps control. Jobs for the same scope queue behind each other;
    /// a second register starts only after the first has claimed or failed.
    pub async fn register(
        &self,
        worker: Arc<OfflineWorker>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let scope = worker.root_url().clone();
        let version = worker.version().to_string();
        let job = self.job_lock(&scope).await;
        let _job = job.lock().await;

        let record = ServiceWorker::new(worker.clone());
        let id = record.id;

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope.to_string())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));
            if let Some(old) = registration.update(record) {
                self.emit_state(&scope, old.id, old.state);
            }
        }
        info!(scope = %scope, version = %version, worker = %id, "Installing worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            scope: scope.clone(),
            version: version.clone(),
        });
        self.emit_state(&scope, id, ServiceWorkerState::Installing);

        if let Err(e) = worker.install().await {
            warn!(scope = %scope, version = %version, error = %e, "Install failed");
            let mut registrations = self.registrations.write().await;
            if let Some(registration) = registrations.get_mut(scope.as_str()) {
                if registration.install_failed(id).is_some() {
                    self.emit_state(&scope, id, ServiceWorkerState::Redundant);
                }
                if registration.is_empty() {
                    registrations.remove(scope.as_str());
                }
            }
            self.emit(ServiceWorkerEvent::InstallFailed {
                scope: scope.clone(),
                version,
                reason: e.to_string(),
            });
            return Err(e);
        }

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope.as_str())
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            registration.install_complete(id)?;
            self.emit_state(&scope, id, ServiceWorkerState::Installed);

            if let Some(old) = registration.skip_waiting() {
                self.emit_state(&scope, old.id, old.state);
            }
            self.emit_state(&scope, id, ServiceWorkerState::Activating);
        }

        match worker.evict_stale().await {
            Ok(names) if !names.is_empty() => self.emit(ServiceWorkerEvent::CachesEvicted {
                scope: scope.clone(),
                names,
            }),
            Ok(_) => {}
            Err(e) => warn!(scope = %scope, error = %e, "Stale cache eviction failed"),
        }

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope.as_str())
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
            registration.activation_complete(id)?;
        }
        self.emit_state(&scope, id, ServiceWorkerState::Activated);
        info!(scope = %scope, version = %version, worker = %id, "Worker activated");

        let claimed = self.clients.write().await.claim(&scope, id);
        for client_id in claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: id,
            });
        }

        Ok(id)
    }

    /// Route a request through the controlling worker of its scope. Requests
    /// outside every scope pass through.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        let worker = {
            let registrations = self.registrations.read().await;
            find_registration(&registrations, &request.url)
                .and_then(|r| r.controller())
                .map(|w| w.worker().clone())
        };

        match worker {
            Some(worker) => worker.handle_fetch(request).await,
            None => FetchOutcome::Passthrough,
        }
    }

    /// Deliver a background-sync event.
    pub async fn dispatch_sync(
        &self,
        scope: &Url,
        tag: &str,
    ) -> Result<SyncOutcome, ServiceWorkerError> {
        let worker = self.active_worker(scope).await?;
        Ok(worker.handle_sync(tag))
    }

    /// Deliver a push message; completes once the notification is shown.
    pub async fn dispatch_push(
        &self,
        scope: &Url,
        payload: Option<&str>,
    ) -> Result<Notification, ServiceWorkerError> {
        let worker = self.active_worker(scope).await?;
        let options = worker.push_notification(payload);
        let title = worker.config().notification.title.clone();

        let notification =
            self.notifications
                .write()
                .await
                .show(worker.root_url().clone(), &title, options);
        info!(notification = ?notification.id, "Showing push notification");
        self.emit(ServiceWorkerEvent::NotificationShown(notification.clone()));
        Ok(notification)
    }

    /// Close a notification, then focus a window at the application root or
    /// open one there.
    pub async fn notification_click(
        &self,
        id: NotificationId,
    ) -> Result<ClientId, ServiceWorkerError> {
        let notification = self
            .notifications
            .write()
            .await
            .close(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {id:?}")))?;
        self.emit(ServiceWorkerEvent::NotificationClosed(id));

        let root = notification.scope;
        let controller = self.controller_id(&root).await;

        let mut clients = self.clients.write().await;
        let options = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        };
        let existing = clients
            .match_all(&root, &options)
            .into_iter()
            .find(|c| c.url == root)
            .map(|c| c.id);

        match existing {
            Some(client_id) => {
                clients.focus(client_id)?;
                self.emit(ServiceWorkerEvent::WindowFocused { client_id });
                Ok(client_id)
            }
            None => {
                let client_id = clients.open_window(root.clone(), controller);
                self.emit(ServiceWorkerEvent::WindowOpened {
                    client_id,
                    url: root,
                });
                Ok(client_id)
            }
        }
    }

    /// Track a page loaded at `url`; it is controlled if an active worker's
    /// scope covers it.
    pub async fn add_client(&self, url: Url) -> ClientId {
        let controller = self.controller_id(&url).await;
        let client = crate::clients::Client {
            controller,
            ..crate::clients::Client::window(url)
        };
        self.clients.write().await.add(client)
    }

    /// Snapshot of the registration whose scope covers `url`.
    pub async fn get_registration(&self, url: &Url) -> Option<RegistrationSnapshot> {
        let registrations = self.registrations.read().await;
        find_registration(&registrations, url).map(ServiceWorkerRegistration::snapshot)
    }

    /// All registration scopes.
    pub async fn get_registrations(&self) -> Vec<Url> {
        let registrations = self.registrations.read().await;
        let mut scopes: Vec<Url> = registrations.values().map(|r| r.scope.clone()).collect();
        scopes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        scopes
    }

    /// Remove a registration; its workers become redundant.
    pub async fn unregister(&self, scope: &Url) -> bool {
        let job = self.job_lock(scope).await;
        let _job = job.lock().await;

        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope.as_str()) {
            Some(mut registration) => {
                registration.unregister();
                info!(scope = %scope, "Unregistered");
                true
            }
            None => false,
        }
    }

    async fn job_lock(&self, scope: &Url) -> Arc<Mutex<()>> {
        self.jobs
            .lock()
            .await
            .entry(scope.to_string())
            .or_default()
            .clone()
    }

    async fn active_worker(&self, scope: &Url) -> Result<Arc<OfflineWorker>, ServiceWorkerError> {
        let registrations = self.registrations.read().await;
        registrations
            .get(scope.as_str())
            .and_then(|r| r.get_active())
            .filter(|w| w.is_active())
            .map(|w| w.worker().clone())
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("active worker for {scope}")))
    }

    async fn controller_id(&self, url: &Url) -> Option<ServiceWorkerId> {
        let registrations = self.registrations.read().await;
        find_registration(&registrations, url)
            .and_then(|r| r.controller())
            .map(|w| w.id)
    }

    fn emit_state(&self, scope: &Url, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            scope: scope.clone(),
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }
}

impl Default for ServiceWorkerContainer {
    fn default() -> Self {
        Self::new().0
    }
}

/// Registration with the longest scope that prefixes `url`.
fn find_registration<'a>(
    registrations: &'a HashMap<String, ServiceWorkerRegistration>,
    url: &Url,
) -> Option<&'a ServiceWorkerRegistration> {
    registrations
        .values()
        .filter(|r| url.as_str().starts_with(r.scope.as_str()))
        .max_by_key(|r| r.scope.as_str().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheKey, CacheStorage, CachedResponse, MemoryBackend};
    use crate::error::CacheError;
    use async_trait::async_trait;
    use std::time::Duration;
    use crate::config::{StorageConfig, WorkerConfig};
    use crate::events::SYNC_RESULTS_TAG;
    use crate::strategy::ResponseSource;
    use crate::testing::MockFetch;

    fn root() -> Url {
        Url::parse("https://portal.example/").unwrap()
    }

    fn worker(version: &str, caches: &CacheStorage, fetcher: &Arc<MockFetch>) -> Arc<OfflineWorker> {
        let config = WorkerConfig {
            cache_version: version.to_string(),
            origin: root(),
            precache: vec!["/".to_string(), "/manifest.json".to_string()],
            storage: StorageConfig::Memory,
            ..WorkerConfig::default()
        };
        Arc::new(OfflineWorker::new(config, caches.clone(), fetcher.clone()).unwrap())
    }

    fn fetcher() -> Arc<MockFetch> {
        let fetcher = Arc::new(MockFetch::new());
        fetcher.respond("/", 200, "<html>portal</html>");
        fetcher.respond("/manifest.json", 200, "{}");
        fetcher
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_registration_slots() {
        let caches = CacheStorage::memory();
        let fetcher = fetcher();
        let mut registration = ServiceWorkerRegistration::new(root());

        let first = ServiceWorker::new(worker("v1", &caches, &fetcher));
        let first_id = first.id;
        assert!(registration.update(first).is_none());
        assert_eq!(
            registration.installing.as_ref().unwrap().state,
            ServiceWorkerState::Installing
        );

        registration.install_complete(first_id).unwrap();
        assert!(registration.installing.is_none());
        assert_eq!(registration.waiting.as_ref().unwrap().state, ServiceWorkerState::Installed);

        assert!(registration.skip_waiting().is_none());
        assert!(registration.controller().is_some());
        registration.activation_complete(first_id).unwrap();
        assert!(registration.get_active().unwrap().is_active());

        let second = ServiceWorker::new(worker("v2", &caches, &fetcher));
        let second_id = second.id;
        registration.update(second);
        registration.install_complete(second_id).unwrap();
        let replaced = registration.skip_waiting().unwrap();
        assert_eq!(replaced.id, first_id);
        assert!(replaced.is_redundant());
    }

    #[test]
    fn test_stale_install_complete_is_rejected() {
        let caches = CacheStorage::memory();
        let fetcher = fetcher();
        let mut registration = ServiceWorkerRegistration::new(root());

        let first = ServiceWorker::new(worker("v1", &caches, &fetcher));
        let first_id = first.id;
        registration.update(first);
        let superseded = registration
            .update(ServiceWorker::new(worker("v2", &caches, &fetcher)))
            .unwrap();
        assert!(superseded.is_redundant());

        assert!(matches!(
            registration.install_complete(first_id),
            Err(ServiceWorkerError::StateError(_))
        ));
        assert!(registration.installing.is_some());
    }

    #[tokio::test]
    async fn test_register_activates_and_claims() {
        let (container, mut rx) = ServiceWorkerContainer::new();
        let caches = CacheStorage::memory();
        let fetcher = fetcher();
        let page = container.add_client(root()).await;

        let id = container.register(worker("v1", &caches, &fetcher)).await.unwrap();

        let snapshot = container.get_registration(&root()).await.unwrap();
        let active = snapshot.active.unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.state, ServiceWorkerState::Activated);
        assert!(snapshot.installing.is_none() && snapshot.waiting.is_none());

        assert_eq!(container.clients.read().await.get(page).unwrap().controller, Some(id));

        let states: Vec<ServiceWorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ServiceWorkerEvent::StateChange { worker_id, new_state, .. } if worker_id == id => {
                    Some(new_state)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let (container, mut rx) = ServiceWorkerContainer::new();
        let caches = CacheStorage::memory();
        let fetcher = fetcher();
        let v1 = container.register(worker("v1", &caches, &fetcher)).await.unwrap();

        fetcher.respond("/manifest.json", 404, "gone");
        let err = container.register(worker("v2", &caches, &fetcher)).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));

        let snapshot = container.get_registration(&root()).await.unwrap();
        assert_eq!(snapshot.active.unwrap().id, v1);
        assert!(snapshot.installing.is_none());
        assert!(caches.has("v1").await.unwrap());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ServiceWorkerEvent::InstallFailed { version, .. } if version == "v2")));
    }

    #[tokio::test]
    async fn test_first_install_failure_leaves_no_registration() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let fetcher = fetcher();
        fetcher.set_offline(true);

        assert!(container
            .register(worker("v1", &CacheStorage::memory(), &fetcher))
            .await
            .is_err());
        assert!(container.get_registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_evicts_old_version() {
        let (container, mut rx) = ServiceWorkerContainer::new();
        let caches = CacheStorage::memory();
        let fetcher = fetcher();
        container.register(worker("v1", &caches, &fetcher)).await.unwrap();
        container.register(worker("v2", &caches, &fetcher)).await.unwrap();

        assert_eq!(caches.keys().await.unwrap(), vec!["v2".to_string()]);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ServiceWorkerEvent::CachesEvicted { names, .. } if names == &vec!["v1".to_string()]
        )));
    }

    /// Memory store whose cache listing stalls, so eviction of one deploy
    /// overlaps the start of the next.
    struct SlowListing(MemoryBackend);

    #[async_trait]
    impl CacheBackend for SlowListing {
        async fn open(&self, cache: &str) -> Result<(), CacheError> {
            self.0.open(cache).await
        }
        async fn has(&self, cache: &str) -> Result<bool, CacheError> {
            self.0.has(cache).await
        }
        async fn delete_cache(&self, cache: &str) -> Result<bool, CacheError> {
            self.0.delete_cache(cache).await
        }
        async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.cache_names().await
        }
        async fn get(&self, cache: &str, key: &CacheKey) -> Result<Option<CachedResponse>, CacheError> {
            self.0.get(cache, key).await
        }
        async fn put(&self, cache: &str, key: &CacheKey, entry: CachedResponse) -> Result<(), CacheError> {
            self.0.put(cache, key, entry).await
        }
        async fn delete(&self, cache: &str, key: &CacheKey) -> Result<bool, CacheError> {
            self.0.delete(cache, key).await
        }
        async fn keys(&self, cache: &str) -> Result<Vec<CacheKey>, CacheError> {
            self.0.keys(cache).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_registers_run_in_order() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let caches = CacheStorage::new(Arc::new(SlowListing(MemoryBackend::new())));
        let fetcher = fetcher();

        let (first, second) = tokio::join!(
            container.register(worker("v1", &caches, &fetcher)),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                container.register(worker("v2", &caches, &fetcher)).await
            }
        );
        first.unwrap();
        let second = second.unwrap();

        let active = container.get_registration(&root()).await.unwrap().active.unwrap();
        assert_eq!(active.id, second);
        assert_eq!(active.version, "v2");
        assert_eq!(active.state, ServiceWorkerState::Activated);
        assert_eq!(caches.keys().await.unwrap(), vec!["v2".to_string()]);
        assert_eq!(caches.open("v2").await.unwrap().keys().await.unwrap().len(), 2);

        fetcher.set_offline(true);
        let outcome = container.handle_fetch(Request::get(root())).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    }

    #[tokio::test]
    async fn test_handle_fetch_without_worker_passes_through() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let outcome = container
            .handle_fetch(Request::get(root().join("/app.js").unwrap()))
            .await;
        assert!(matches!(outcome, FetchOutcome::Passthrough));
    }

    #[tokio::test]
    async fn test_handle_fetch_uses_active_worker() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let fetcher = fetcher();
        container
            .register(worker("v1", &CacheStorage::memory(), &fetcher))
            .await
            .unwrap();
        let calls = fetcher.calls();

        let outcome = container.handle_fetch(Request::get(root())).await;

        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
        assert_eq!(fetcher.calls(), calls);
    }

    #[tokio::test]
    async fn test_sync_and_push_need_active_worker() {
        let (container, _rx) = ServiceWorkerContainer::new();
        assert!(matches!(
            container.dispatch_sync(&root(), SYNC_RESULTS_TAG).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
        assert!(container.dispatch_push(&root(), None).await.is_err());

        let fetcher = fetcher();
        container
            .register(worker("v1", &CacheStorage::memory(), &fetcher))
            .await
            .unwrap();
        assert_eq!(
            container.dispatch_sync(&root(), SYNC_RESULTS_TAG).await.unwrap(),
            SyncOutcome::Acknowledged
        );
        assert_eq!(
            container.dispatch_sync(&root(), "other").await.unwrap(),
            SyncOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_push_then_click_opens_root_window() {
        let (container, mut rx) = ServiceWorkerContainer::new();
        let fetcher = fetcher();
        let id = container
            .register(worker("v1", &CacheStorage::memory(), &fetcher))
            .await
            .unwrap();
        drain(&mut rx);

        let notification = container.dispatch_push(&root(), Some("New results")).await.unwrap();
        assert_eq!(notification.title, "Student Portal");
        assert_eq!(notification.options.body, "New results");
        assert_eq!(container.notifications.read().await.get_notifications(&root()).len(), 1);

        let client_id = container.notification_click(notification.id).await.unwrap();

        assert!(container.notifications.read().await.get(notification.id).is_none());
        let clients = container.clients.read().await;
        let client = clients.get(client_id).unwrap();
        assert_eq!(client.url, root());
        assert!(client.focused);
        assert_eq!(client.controller, Some(id));

        let events = drain(&mut rx);
        assert!(matches!(events[0], ServiceWorkerEvent::NotificationShown(_)));
        assert!(matches!(events[1], ServiceWorkerEvent::NotificationClosed(n) if n == notification.id));
        assert!(matches!(events[2], ServiceWorkerEvent::WindowOpened { .. }));
    }

    #[tokio::test]
    async fn test_click_focuses_existing_root_window() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let fetcher = fetcher();
        container
            .register(worker("v1", &CacheStorage::memory(), &fetcher))
            .await
            .unwrap();
        let home = container.add_client(root()).await;
        let other = container.add_client(root().join("/admin").unwrap()).await;
        container.clients.write().await.focus(other).unwrap();

        let notification = container.dispatch_push(&root(), None).await.unwrap();
        let clicked = container.notification_click(notification.id).await.unwrap();

        assert_eq!(clicked, home);
        assert!(container.clients.read().await.get(home).unwrap().focused);
        assert!(matches!(
            container.notification_click(notification.id).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister() {
        let (container, _rx) = ServiceWorkerContainer::new();
        let fetcher = fetcher();
        container
            .register(worker("v1", &CacheStorage::memory(), &fetcher))
            .await
            .unwrap();

        assert!(container.unregister(&root()).await);
        assert!(!container.unregister(&root()).await);
        assert!(container.get_registration(&root()).await.is_none());
    }
}
