//! A single service worker version and its event handlers.

use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use carniceria_common::with_timeout;
use carniceria_core::WorkerConfig;
use carniceria_net::{Fetcher, Request, Response, ResponseSource, UrlPattern};
use futures::future::{join_all, try_join_all};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::notification::{Notification, NotificationCenter, NotificationId, PushMessage};
use crate::strategy::{classify, is_storable, Strategy};
use crate::{ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState};

// ==================== Scope ====================

/// State shared by every worker version of one registration.
#[derive(Clone)]
pub struct WorkerScope {
    pub caches: Arc<RwLock<CacheStorage>>,
    pub clients: Arc<RwLock<Clients>>,
    pub notifications: Arc<RwLock<NotificationCenter>>,
    pub fetcher: Arc<dyn Fetcher>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl WorkerScope {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
        notifications: NotificationCenter,
        events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Self {
        Self {
            caches: Arc::new(RwLock::new(caches)),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(notifications)),
            fetcher,
            events,
        }
    }

    pub(crate) fn emit(&self, event: ServiceWorkerEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

// ==================== Click Outcome ====================

/// What a notification click did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// An open client already showed the target and was focused.
    Focused(String),
    /// A new window client was opened at the target.
    Opened(String),
}

// ==================== Service Worker ====================

/// Background cache writes that must settle before the worker may be torn
/// down.
#[derive(Default)]
struct WaitUntil {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WaitUntil {
    fn push(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    async fn settle(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background cache write panicked");
            }
        }
    }
}

/// One version of the offline worker.
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,
    cache_name: String,
    origin: Url,
    precache: Vec<Url>,
    offline_page: RequestKey,
    api: UrlPattern,
    network_timeout: Duration,
    icon: Url,
    badge: Url,
    default_target: Url,
    state: StdRwLock<ServiceWorkerState>,
    pending: WaitUntil,
    scope: WorkerScope,
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("cache_name", &self.cache_name)
            .field("state", &self.state())
            .finish()
    }
}

impl ServiceWorker {
    /// Create a worker version from a validated configuration.
    pub fn new(config: &WorkerConfig, scope: WorkerScope) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let notifications = &config.notifications;

        Ok(Self {
            id: ServiceWorkerId::next(),
            cache_name: config.cache_name.clone(),
            origin: config.origin.clone(),
            precache: config.precache_urls()?,
            offline_page: RequestKey::get(&config.offline_page_url()?),
            api: UrlPattern::contains(&config.api_pattern),
            network_timeout: config.network_timeout(),
            icon: config.resolve(&notifications.icon)?,
            badge: config.resolve(&notifications.badge)?,
            default_target: config.resolve(&notifications.default_url)?,
            state: StdRwLock::new(ServiceWorkerState::Parsed),
            pending: WaitUntil::default(),
            scope,
        })
    }

    /// Cache generation this version owns.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Current state.
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state() == ServiceWorkerState::Redundant
    }

    pub(crate) fn set_state(&self, state: ServiceWorkerState) {
        {
            let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!(worker = self.id.raw(), ?state, "Worker state changed");
        self.scope.emit(ServiceWorkerEvent::StateChange {
            worker_id: self.id,
            new_state: state,
        });
    }

    /// Wait for every background cache write started so far.
    pub async fn settle(&self) {
        self.pending.settle().await;
    }

    // ==================== Install ====================

    /// Install handler: open this version's generation and store every
    /// manifest asset.
    ///
    /// All assets are fetched before any is stored; one failure stores
    /// nothing. Returns the number of stored entries.
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        self.set_state(ServiceWorkerState::Installing);
        info!(cache = %self.cache_name, assets = self.precache.len(), "Installing");

        self.scope.caches.write().await.open(&self.cache_name);

        let fetched =
            try_join_all(self.precache.iter().map(|url| self.fetch_precache(url))).await?;
        let count = fetched.len();

        self.scope
            .caches
            .write()
            .await
            .put_all(&self.cache_name, fetched)?;

        self.set_state(ServiceWorkerState::Installed);
        info!(cache = %self.cache_name, entries = count, "Install complete");
        Ok(count)
    }

    async fn fetch_precache(&self, url: &Url) -> Result<CacheEntry, ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self.scope.fetcher.fetch(&request).await.map_err(|e| {
            ServiceWorkerError::InstallFetchFailure {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        if !response.ok() {
            return Err(ServiceWorkerError::InstallFetchFailure {
                url: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }

        trace!(url = %url, bytes = response.body_len(), "Precached asset");
        Ok(CacheEntry::from_response(&RequestKey::get(url), response))
    }

    // ==================== Activate ====================

    /// Activate handler: delete every generation but this version's, then
    /// claim all clients. Returns the deleted generation names.
    pub async fn activate(&self) -> Vec<String> {
        self.set_state(ServiceWorkerState::Activating);

        let deleted = {
            let mut caches = self.scope.caches.write().await;
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| *name != self.cache_name)
                .collect();
            for name in &stale {
                info!(cache = %name, "Deleting stale cache generation");
                caches.delete(name);
            }
            caches.set_active(Some(&self.cache_name));
            stale
        };

        self.claim().await;
        self.set_state(ServiceWorkerState::Activated);
        deleted
    }

    /// Take control of every open client.
    pub async fn claim(&self) -> Vec<String> {
        let changed = self.scope.clients.write().await.claim(self.id);
        for client_id in &changed {
            self.scope.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: self.id,
            });
        }
        info!(worker = self.id.raw(), clients = changed.len(), "Claimed clients");
        changed
    }

    // ==================== Fetch ====================

    /// Strategy this worker applies to `request`.
    pub fn classify(&self, request: &Request) -> Strategy {
        classify(request, &self.api)
    }

    /// Fetch handler.
    ///
    /// `Ok(None)` means the request was not intercepted and should go to the
    /// network untouched.
    pub async fn handle_fetch(
        &self,
        request: &Request,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let strategy = self.classify(request);
        trace!(url = %request.url, method = %request.method, ?strategy, "Fetch event");

        match strategy {
            Strategy::Passthrough => Ok(None),
            Strategy::NetworkFirst => self.network_first(request).await.map(Some),
            Strategy::CacheFirst => self.cache_first(request).await.map(Some),
        }
    }

    async fn network_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let key = RequestKey::from(request);
        let fetched = with_timeout(self.network_timeout, || self.scope.fetcher.fetch(request)).await;

        let failure = match fetched {
            Ok(Ok(response)) => {
                if !response.ok() {
                    return Ok(response);
                }
                let (caller, copy) = response.tee();
                self.store_in_background(key, copy);
                return Ok(caller);
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => {
                debug!(key = %key, category = e.category(), "Network-first fetch abandoned");
                e.to_string()
            }
        };

        debug!(key = %key, error = %failure, "Network failed, trying cache");
        match self.lookup(&key).await {
            Some(stored) => Ok(stored),
            None => Err(ServiceWorkerError::Network(failure)),
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let key = RequestKey::from(request);
        if let Some(stored) = self.lookup(&key).await {
            trace!(key = %key, "Cache hit");
            return Ok(stored);
        }

        match self.scope.fetcher.fetch(request).await {
            Ok(response) if is_storable(&response) => {
                let (caller, copy) = response.tee();
                self.store_in_background(key, copy);
                Ok(caller)
            }
            Ok(response) => Ok(response),
            Err(e) => {
                if request.accepts_html() {
                    if let Some(page) = self.lookup(&self.offline_page).await {
                        debug!(url = %request.url, "Serving offline page");
                        return Ok(page.with_source(ResponseSource::OfflineFallback));
                    }
                }
                Err(ServiceWorkerError::Network(e.to_string()))
            }
        }
    }

    /// Stored response for `key` in this version's generation.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let caches = self.scope.caches.read().await;
        let entry = caches.match_in(&self.cache_name, key)?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    fn store_in_background(&self, key: RequestKey, response: Response) {
        let caches = Arc::clone(&self.scope.caches);
        let cache_name = self.cache_name.clone();

        let handle = tokio::spawn(async move {
            let entry = CacheEntry::from_response(&key, response);
            match caches.write().await.put(&cache_name, entry) {
                Ok(()) => trace!(cache = %cache_name, key = %key, "Stored response"),
                Err(e) => warn!(cache = %cache_name, key = %key, error = %e, "Cache write failed"),
            }
        });
        self.pending.push(handle);
    }

    // ==================== Push ====================

    /// Push handler: parse the payload and show a notification.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Result<Notification, ServiceWorkerError> {
        let message = PushMessage::parse(data)?;

        let target = match message.url.as_deref() {
            Some(url) if !url.is_empty() => self
                .origin
                .join(url)
                .map_err(|e| ServiceWorkerError::PushParse(format!("target '{}': {}", url, e)))?,
            _ => self.default_target.clone(),
        };

        let notification = self.scope.notifications.write().await.show(
            message.title,
            message.body,
            self.icon.clone(),
            self.badge.clone(),
            target,
        )?;

        info!(id = ?notification.id, target = %notification.target, "Push notification shown");
        self.scope.emit(ServiceWorkerEvent::NotificationShown {
            id: notification.id,
            title: notification.title.clone(),
        });
        Ok(notification)
    }

    /// Notification click handler: close the notification, then focus a
    /// window already showing its target or open a new one.
    pub async fn handle_notification_click(
        &self,
        id: NotificationId,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        let notification = self
            .scope
            .notifications
            .write()
            .await
            .close(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {:?}", id)))?;

        let outcome = {
            let mut clients = self.scope.clients.write().await;
            let options = ClientMatchOptions {
                include_uncontrolled: false,
                client_type: ClientType::Window,
            };
            let existing = clients
                .match_all(&options, Some(self.id))
                .into_iter()
                .find(|c| c.url == notification.target)
                .map(|c| c.id.clone());

            match existing {
                Some(client_id) => {
                    clients.focus(&client_id)?;
                    ClickOutcome::Focused(client_id)
                }
                None => {
                    let client = clients.open_window(notification.target.clone(), Some(self.id));
                    ClickOutcome::Opened(client.id)
                }
            }
        };

        info!(id = ?id, ?outcome, "Notification clicked");
        self.scope.emit(ServiceWorkerEvent::NotificationClicked {
            id,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use carniceria_net::NetError;
    use http::StatusCode;

    struct Unreachable;

    #[async_trait]
    impl Fetcher for Unreachable {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Err(NetError::Offline(request.url.to_string()))
        }
    }

    fn scope() -> (WorkerScope, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scope = WorkerScope::new(
            Arc::new(Unreachable),
            CacheStorage::new(),
            NotificationCenter::default(),
            tx,
        );
        (scope, rx)
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(Url::parse("https://shop.example/").unwrap(), "v1")
            .with_precache(["/index.html"])
    }

    #[test]
    fn test_new_worker_is_parsed() {
        let (scope, _rx) = scope();
        let worker = ServiceWorker::new(&config(), scope).unwrap();
        assert_eq!(worker.state(), ServiceWorkerState::Parsed);
        assert_eq!(worker.cache_name(), "v1");
        assert!(!worker.is_active());
    }

    #[test]
    fn test_new_worker_rejects_invalid_config() {
        let (scope, _rx) = scope();
        let mut bad = config();
        bad.cache_name = String::new();
        assert!(matches!(
            ServiceWorker::new(&bad, scope),
            Err(ServiceWorkerError::Config(_))
        ));
    }

    #[test]
    fn test_set_state_emits_once() {
        let (scope, mut rx) = scope();
        let worker = ServiceWorker::new(&config(), scope).unwrap();

        worker.set_state(ServiceWorkerState::Installing);
        worker.set_state(ServiceWorkerState::Installing);

        assert_eq!(
            rx.try_recv().unwrap(),
            ServiceWorkerEvent::StateChange {
                worker_id: worker.id,
                new_state: ServiceWorkerState::Installing,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_install_offline_fails_and_stores_nothing() {
        let (scope, _rx) = scope();
        let caches = Arc::clone(&scope.caches);
        let worker = ServiceWorker::new(&config(), scope).unwrap();

        let err = worker.install().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFetchFailure { .. }));
        assert!(caches.read().await.get("v1").unwrap().is_empty());
        assert_eq!(worker.state(), ServiceWorkerState::Installing);
    }

    #[tokio::test]
    async fn test_cache_first_serves_stored_entry_offline() {
        let (scope, _rx) = scope();
        let url = Url::parse("https://shop.example/index.html").unwrap();
        {
            let mut caches = scope.caches.write().await;
            caches.open("v1");
            let key = RequestKey::get(&url);
            let stored = Response::new(url.clone(), StatusCode::OK, "<h1>Carnicería</h1>");
            caches.put("v1", CacheEntry::from_response(&key, stored)).unwrap();
        }
        let worker = ServiceWorker::new(&config(), scope).unwrap();

        let response = worker
            .handle_fetch(&Request::get(url))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.text().unwrap(), "<h1>Carnicería</h1>");
    }
}
