//! Registration and the host-facing entry points.

use std::path::Path;
use std::sync::Arc;

use carniceria_common::{retry_with_backoff, RetryConfig};
use carniceria_core::WorkerConfig;
use carniceria_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::notification::{Notification, NotificationCenter, NotificationId, NotificationPermission};
use crate::worker::{ClickOutcome, ServiceWorker, WorkerScope};
use crate::{ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState};

// ==================== Registration ====================

/// The worker versions registered for the storefront origin.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    pub active: Option<Arc<ServiceWorker>>,
}

impl ServiceWorkerRegistration {
    /// Create an empty registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Start installing a new version, replacing any unfinished one.
    pub fn update(&mut self, worker: Arc<ServiceWorker>) {
        if let Some(previous) = self.installing.replace(worker) {
            previous.set_state(ServiceWorkerState::Redundant);
        }
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self) {
        if let Some(worker) = self.installing.take() {
            worker.set_state(ServiceWorkerState::Installed);
            if let Some(previous) = self.waiting.replace(worker) {
                previous.set_state(ServiceWorkerState::Redundant);
            }
        }
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self) -> Option<Arc<ServiceWorker>> {
        let worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Promote the waiting worker to active, retiring the old one.
    ///
    /// The new worker still has to run its activate handler.
    pub fn skip_waiting(&mut self) -> Option<Arc<ServiceWorker>> {
        let worker = self.waiting.take()?;
        if let Some(old) = self.active.replace(Arc::clone(&worker)) {
            old.set_state(ServiceWorkerState::Redundant);
        }
        Some(worker)
    }

    /// Unregister (mark every version redundant).
    pub fn unregister(&mut self) {
        for worker in [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
        {
            worker.set_state(ServiceWorkerState::Redundant);
        }
    }
}

// ==================== Container ====================

/// Host-facing container: owns the registration and the shared scope, and
/// routes platform events to the active worker.
pub struct ServiceWorkerContainer {
    registration: RwLock<ServiceWorkerRegistration>,
    scope: WorkerScope,
}

impl ServiceWorkerContainer {
    /// Create a container with empty cache storage.
    ///
    /// Notification permission starts granted: a push subscription cannot
    /// exist without it.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        scope: Url,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        Self::with_storage(fetcher, scope, CacheStorage::new())
    }

    /// Create a container over existing cache storage.
    pub fn with_storage(
        fetcher: Arc<dyn Fetcher>,
        scope: Url,
        storage: CacheStorage,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker_scope = WorkerScope::new(
            fetcher,
            storage,
            NotificationCenter::new(NotificationPermission::Granted),
            event_tx,
        );

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                scope: worker_scope,
            },
            event_rx,
        )
    }

    /// Create a container whose cache storage is loaded from the configured
    /// snapshot, if any.
    ///
    /// When the snapshot names the generation of the last activated worker,
    /// a worker serving that generation is activated right away, so stored
    /// responses are available before any new install succeeds.
    pub async fn restore(
        fetcher: Arc<dyn Fetcher>,
        config: &WorkerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        let storage = match &config.snapshot_path {
            Some(path) => CacheStorage::load(path, config.cache_quota_bytes).await?,
            None => match config.cache_quota_bytes {
                Some(quota) => CacheStorage::with_quota(quota),
                None => CacheStorage::new(),
            },
        };
        let restored = storage
            .active()
            .filter(|name| storage.has(name))
            .map(str::to_string);

        let (container, events) = Self::with_storage(fetcher, config.origin.clone(), storage);
        if let Some(cache_name) = restored {
            let mut previous = config.clone();
            previous.cache_name = cache_name;
            let worker = Arc::new(ServiceWorker::new(&previous, container.scope.clone())?);
            worker.set_state(ServiceWorkerState::Activated);
            info!(worker = worker.id.raw(), cache = %worker.cache_name(), "Restored active worker");
            container.registration.write().await.active = Some(worker);
        }
        Ok((container, events))
    }

    // ==================== Lifecycle ====================

    /// Register a new worker version and bring it to activated.
    ///
    /// Install is retried up to `install_attempts` times. If it never
    /// succeeds, the new version becomes redundant and the previous active
    /// version keeps serving. On success the new version skips waiting,
    /// deletes stale generations and claims every client.
    pub async fn register(
        &self,
        config: &WorkerConfig,
    ) -> Result<Arc<ServiceWorker>, ServiceWorkerError> {
        let worker = Arc::new(ServiceWorker::new(config, self.scope.clone())?);
        self.scope
            .caches
            .write()
            .await
            .set_quota(config.cache_quota_bytes);

        self.registration.write().await.update(Arc::clone(&worker));
        info!(worker = worker.id.raw(), cache = %worker.cache_name(), "Update found");
        self.scope.emit(ServiceWorkerEvent::UpdateFound {
            cache_name: worker.cache_name().to_string(),
        });

        let retry = RetryConfig::attempts(config.install_attempts);
        let installed = retry_with_backoff(&retry, |attempt| {
            let worker = Arc::clone(&worker);
            async move {
                debug!(worker = worker.id.raw(), attempt, "Install attempt");
                worker.install().await
            }
        })
        .await;

        if let Err(e) = installed {
            warn!(worker = worker.id.raw(), error = %e, "Install failed, keeping current version");
            self.discard_failed_install(&worker).await;
            return Err(e);
        }

        let previous = self.registration.read().await.active.clone();
        if let Some(previous) = previous {
            // writes started by the outgoing version land before cleanup
            previous.settle().await;
        }

        {
            let mut registration = self.registration.write().await;
            registration.install_complete();
            registration.skip_waiting();
        }

        let deleted = worker.activate().await;
        info!(
            worker = worker.id.raw(),
            cache = %worker.cache_name(),
            deleted = deleted.len(),
            "Worker activated"
        );
        Ok(worker)
    }

    async fn discard_failed_install(&self, worker: &Arc<ServiceWorker>) {
        let active_cache = {
            let mut registration = self.registration.write().await;
            registration.install_failed();
            registration.active.as_ref().map(|w| w.cache_name().to_string())
        };

        if active_cache.as_deref() != Some(worker.cache_name()) {
            let mut caches = self.scope.caches.write().await;
            if caches.get(worker.cache_name()).is_some_and(|c| c.is_empty()) {
                caches.delete(worker.cache_name());
            }
        }
    }

    /// The worker controlling new requests.
    pub async fn controller(&self) -> Option<Arc<ServiceWorker>> {
        self.registration.read().await.active.clone()
    }

    /// Unregister every version. Cache storage is left untouched.
    pub async fn unregister(&self) -> bool {
        let mut registration = self.registration.write().await;
        let had_active = registration.active.is_some();
        if let Some(active) = &registration.active {
            active.settle().await;
        }
        registration.unregister();
        self.scope.caches.write().await.set_active(None);
        had_active
    }

    // ==================== Events ====================

    /// Route a request through the active worker.
    ///
    /// `Ok(None)` means the host should perform the request itself: either no
    /// worker is active or the worker chose not to intercept.
    pub async fn handle_fetch(&self, request: &Request) -> Result<Option<Response>, ServiceWorkerError> {
        match self.controller().await {
            Some(worker) => worker.handle_fetch(request).await,
            None => Ok(None),
        }
    }

    /// Deliver a push payload. A payload that cannot be shown is logged and
    /// dropped.
    pub async fn deliver_push(&self, data: Option<&[u8]>) -> Option<Notification> {
        let worker = self.controller().await?;
        match worker.handle_push(data).await {
            Ok(notification) => Some(notification),
            Err(e) => {
                warn!(error = %e, "Dropping push message");
                None
            }
        }
    }

    /// Deliver a notification click.
    pub async fn notification_click(
        &self,
        id: NotificationId,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        let worker = self
            .controller()
            .await
            .ok_or_else(|| ServiceWorkerError::State("no active worker".to_string()))?;
        worker.handle_notification_click(id).await
    }

    // ==================== Host State ====================

    /// Open a client view. It is controlled by the active worker, if any.
    pub async fn connect_client(&self, url: Url) -> String {
        let mut client = Client::window(url);
        client.controller = self.controller().await.map(|w| w.id);
        self.scope.clients.write().await.add(client)
    }

    pub async fn set_notification_permission(&self, permission: NotificationPermission) {
        self.scope
            .notifications
            .write()
            .await
            .set_permission(permission);
    }

    /// Names of every stored cache generation, sorted.
    pub async fn cache_names(&self) -> Vec<String> {
        self.scope.caches.read().await.keys()
    }

    /// Shared cache storage.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.scope.caches)
    }

    /// Shared clients.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        Arc::clone(&self.scope.clients)
    }

    /// Shared notification center.
    pub fn notifications(&self) -> Arc<RwLock<NotificationCenter>> {
        Arc::clone(&self.scope.notifications)
    }

    /// Wait for the active worker's background cache writes.
    pub async fn flush(&self) {
        if let Some(worker) = self.controller().await {
            worker.settle().await;
        }
    }

    /// Flush, then write cache storage to `path`.
    pub async fn persist(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        self.flush().await;
        self.scope.caches.read().await.save(path).await
    }
}
