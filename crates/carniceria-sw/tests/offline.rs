//! End-to-end behavior of the offline worker against a scripted network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use carniceria_core::WorkerConfig;
use carniceria_net::{Fetcher, NetError, Request, Response, ResponseSource, ResponseType};
use carniceria_sw::{
    ClickOutcome, RequestKey, ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerState,
};
use http::{Method, StatusCode};
use url::Url;

const ORIGIN: &str = "https://shop.example/";
const API: &str = "https://abc.supabase.co/rest/v1/products?select=*";

/// Network double: fixed routes, a call counter and an offline switch.
#[derive(Default)]
struct ScriptedNetwork {
    routes: Mutex<HashMap<String, (StatusCode, String)>>,
    calls: AtomicUsize,
    offline: AtomicBool,
}

impl ScriptedNetwork {
    fn route(&self, url: &str, status: StatusCode, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for ScriptedNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }
        let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
        let (status, body) = route.unwrap_or((StatusCode::NOT_FOUND, String::new()));
        let response = Response::new(request.url.clone(), status, body);
        if request.url.origin() == url(ORIGIN).origin() {
            Ok(response)
        } else {
            Ok(response.with_type(ResponseType::Cors))
        }
    }
}

/// Answers like the wrapped network until stalled, then hangs far past any
/// sensible timeout before answering.
struct StallingNetwork {
    inner: Arc<ScriptedNetwork>,
    stalled: AtomicBool,
}

#[async_trait]
impl Fetcher for StallingNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        self.inner.fetch(request).await
    }
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn storefront() -> Arc<ScriptedNetwork> {
    let network = Arc::new(ScriptedNetwork::default());
    network.route("https://shop.example/", StatusCode::OK, "<h1>Inicio</h1>");
    network.route("https://shop.example/index.html", StatusCode::OK, "<h1>Inicio</h1>");
    network.route("https://shop.example/offline.html", StatusCode::OK, "<h1>Sin conexión</h1>");
    network.route("https://shop.example/css/styles.css", StatusCode::OK, "body{}");
    network
}

fn config(cache_name: &str, manifest: &[&str]) -> WorkerConfig {
    WorkerConfig::new(url(ORIGIN), cache_name).with_precache(manifest.iter().copied())
}

fn container(network: &Arc<ScriptedNetwork>) -> ServiceWorkerContainer {
    let (container, _events) = ServiceWorkerContainer::new(network.clone(), url(ORIGIN));
    container
}

async fn stored_count(container: &ServiceWorkerContainer, cache_name: &str) -> usize {
    container
        .caches()
        .read()
        .await
        .get(cache_name)
        .map(|c| c.len())
        .unwrap_or(0)
}

#[tokio::test]
async fn precached_assets_are_served_offline_without_network() {
    let network = storefront();
    let container = container(&network);
    container
        .register(&config("v1", &["/", "/css/styles.css"]))
        .await
        .unwrap();
    assert_eq!(stored_count(&container, "v1").await, 2);

    let before = network.calls();
    network.go_offline();

    let response = container
        .handle_fetch(&Request::get(url("https://shop.example/css/styles.css")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "body{}");
    assert_eq!(network.calls(), before);
}

#[tokio::test]
async fn install_fails_atomically_when_one_asset_is_missing() {
    let network = storefront();
    let container = container(&network);

    let err = container
        .register(&config("v1", &["/", "/css/missing.css"]))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceWorkerError::InstallFetchFailure { ref url, .. } if url.ends_with("/css/missing.css")));
    assert!(container.controller().await.is_none());
    assert_eq!(stored_count(&container, "v1").await, 0);
}

#[tokio::test]
async fn failed_update_keeps_previous_version_serving() {
    let network = storefront();
    let container = container(&network);
    let v1 = container.register(&config("v1", &["/"])).await.unwrap();

    let result = container
        .register(&config("v2", &["/", "/css/missing.css"]))
        .await;
    assert!(result.is_err());

    assert!(v1.is_active());
    assert_eq!(container.controller().await.unwrap().id, v1.id);
    assert_eq!(container.cache_names().await, vec!["v1".to_string()]);
}

#[tokio::test]
async fn install_is_retried_up_to_the_configured_attempts() {
    let network = Arc::new(ScriptedNetwork::default());
    let container = container(&network);
    let mut config = config("v1", &["/"]);
    config.install_attempts = 3;

    let result = container.register(&config).await;

    assert!(matches!(result, Err(ServiceWorkerError::InstallFetchFailure { .. })));
    assert_eq!(network.calls(), 3);
}

#[tokio::test]
async fn reinstalling_the_same_manifest_is_idempotent() {
    let network = storefront();
    let container = container(&network);
    let manifest = ["/", "/css/styles.css"];

    container.register(&config("v1", &manifest)).await.unwrap();
    container.register(&config("v1", &manifest)).await.unwrap();

    assert_eq!(container.cache_names().await, vec!["v1".to_string()]);
    assert_eq!(stored_count(&container, "v1").await, 2);
}

#[tokio::test]
async fn activation_deletes_every_other_generation() {
    let network = storefront();
    let container = container(&network);
    {
        let caches = container.caches();
        let mut caches = caches.write().await;
        caches.open("v1");
        caches.open("legacy-images");
    }

    let worker = container.register(&config("v2", &["/"])).await.unwrap();

    assert_eq!(worker.state(), ServiceWorkerState::Activated);
    assert_eq!(container.cache_names().await, vec!["v2".to_string()]);
}

#[tokio::test]
async fn api_success_returns_network_and_stores_a_copy() {
    let network = storefront();
    network.route(API, StatusCode::OK, r#"[{"name":"Tomahawk"}]"#);
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    let response = container
        .handle_fetch(&Request::get(url(API)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.source, ResponseSource::Network);
    assert_eq!(response.text().unwrap(), r#"[{"name":"Tomahawk"}]"#);

    container.flush().await;
    let caches = container.caches();
    let caches = caches.read().await;
    let stored = caches.match_in("v1", &RequestKey::get(&url(API))).unwrap();
    assert_eq!(stored.body, br#"[{"name":"Tomahawk"}]"#.to_vec());
}

#[tokio::test]
async fn api_failure_serves_the_last_stored_copy() {
    let network = storefront();
    network.route(API, StatusCode::OK, "[1,2,3]");
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    container.handle_fetch(&Request::get(url(API))).await.unwrap();
    container.flush().await;
    network.go_offline();

    let response = container
        .handle_fetch(&Request::get(url(API)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "[1,2,3]");
}

#[tokio::test(start_paused = true)]
async fn slow_api_falls_back_to_the_stored_copy_after_the_timeout() {
    let scripted = storefront();
    scripted.route(API, StatusCode::OK, "[1,2,3]");
    let network = Arc::new(StallingNetwork {
        inner: scripted,
        stalled: AtomicBool::new(false),
    });
    let (container, _events) = ServiceWorkerContainer::new(network.clone(), url(ORIGIN));
    let mut config = config("v1", &["/"]);
    config.network_timeout_ms = 100;
    container.register(&config).await.unwrap();

    container.handle_fetch(&Request::get(url(API))).await.unwrap();
    container.flush().await;
    network.stalled.store(true, Ordering::SeqCst);

    let started = tokio::time::Instant::now();
    let response = container
        .handle_fetch(&Request::get(url(API)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "[1,2,3]");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn api_failure_without_stored_copy_is_a_network_error() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();
    network.go_offline();

    let result = container.handle_fetch(&Request::get(url(API))).await;
    assert!(matches!(result, Err(ServiceWorkerError::Network(_))));
}

#[tokio::test]
async fn api_server_errors_are_returned_but_not_stored() {
    let network = storefront();
    network.route(API, StatusCode::SERVICE_UNAVAILABLE, "busy");
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    let response = container
        .handle_fetch(&Request::get(url(API)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

    container.flush().await;
    let caches = container.caches();
    assert!(caches
        .read()
        .await
        .match_in("v1", &RequestKey::get(&url(API)))
        .is_none());
}

#[tokio::test]
async fn non_get_requests_are_never_intercepted() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();
    let before = stored_count(&container, "v1").await;

    let post = Request::post(url(API), Bytes::from_static(b"{}"));
    assert!(container.handle_fetch(&post).await.unwrap().is_none());

    let put = Request::new(Method::PUT, url("https://shop.example/css/styles.css"));
    assert!(container.handle_fetch(&put).await.unwrap().is_none());

    container.flush().await;
    assert_eq!(stored_count(&container, "v1").await, before);
}

#[tokio::test]
async fn cache_miss_fetches_and_stores_same_origin_success() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    let css = url("https://shop.example/css/styles.css");
    let response = container
        .handle_fetch(&Request::get(css.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.source, ResponseSource::Network);

    container.flush().await;
    let before = network.calls();
    let again = container
        .handle_fetch(&Request::get(css))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.source, ResponseSource::Cache);
    assert_eq!(network.calls(), before);
}

#[tokio::test]
async fn cache_miss_does_not_store_cross_origin_or_errors() {
    let network = storefront();
    network.route("https://cdn.example/font.woff2", StatusCode::OK, "font");
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    let font = container
        .handle_fetch(&Request::get(url("https://cdn.example/font.woff2")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(font.response_type, ResponseType::Cors);

    let missing = container
        .handle_fetch(&Request::get(url("https://shop.example/img/nope.png")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(missing.status, StatusCode::NOT_FOUND);

    container.flush().await;
    assert_eq!(stored_count(&container, "v1").await, 1);
}

#[tokio::test]
async fn offline_document_request_gets_the_offline_page() {
    let network = storefront();
    let container = container(&network);
    container
        .register(&config("v1", &["/", "/offline.html"]))
        .await
        .unwrap();
    network.go_offline();

    let page = container
        .handle_fetch(&Request::navigate(url("https://shop.example/catalog.html")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(page.source, ResponseSource::OfflineFallback);
    assert_eq!(page.text().unwrap(), "<h1>Sin conexión</h1>");

    let image = container
        .handle_fetch(&Request::get(url("https://shop.example/img/tomahawk.png")))
        .await;
    assert!(matches!(image, Err(ServiceWorkerError::Network(_))));
}

#[tokio::test]
async fn lookups_ignore_entries_in_other_generations() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v2", &["/"])).await.unwrap();
    {
        let caches = container.caches();
        let mut caches = caches.write().await;
        let css = url("https://shop.example/css/styles.css");
        caches.open("stray");
        caches
            .put(
                "stray",
                carniceria_sw::CacheEntry::from_response(
                    &RequestKey::get(&css),
                    Response::new(css.clone(), StatusCode::OK, "stale"),
                ),
            )
            .unwrap();
    }
    network.go_offline();

    let result = container
        .handle_fetch(&Request::get(url("https://shop.example/css/styles.css")))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn push_shows_notification_and_click_opens_target() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    let notification = container
        .deliver_push(Some(
            br#"{"title":"Oferta","body":"Tomahawk -20%","url":"/catalog.html"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(notification.title, "Oferta");
    assert_eq!(notification.target, url("https://shop.example/catalog.html"));
    assert_eq!(notification.icon, url("https://shop.example/img/icon-192.png"));

    let outcome = container.notification_click(notification.id).await.unwrap();
    let client_id = match outcome {
        ClickOutcome::Opened(id) => id,
        other => panic!("expected a new window, got {:?}", other),
    };

    let clients = container.clients();
    let clients = clients.read().await;
    let client = clients.get(&client_id).unwrap();
    assert!(client.focused);
    assert_eq!(client.url, url("https://shop.example/catalog.html"));
    assert!(container.notifications().read().await.visible().is_empty());
}

#[tokio::test]
async fn click_focuses_an_existing_window_on_the_target() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();
    let open = container.connect_client(url(ORIGIN)).await;

    let notification = container
        .deliver_push(Some(br#"{"title":"Hola"}"#))
        .await
        .unwrap();
    assert_eq!(notification.target, url(ORIGIN));

    let outcome = container.notification_click(notification.id).await.unwrap();
    assert_eq!(outcome, ClickOutcome::Focused(open));

    // the notification is gone
    assert!(container.notification_click(notification.id).await.is_err());
}

#[tokio::test]
async fn malformed_push_is_dropped() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();

    assert!(container.deliver_push(None).await.is_none());
    assert!(container.deliver_push(Some(b"{not json")).await.is_none());
    assert!(container.notifications().read().await.visible().is_empty());
}

#[tokio::test]
async fn denied_permission_suppresses_notifications() {
    let network = storefront();
    let container = container(&network);
    container.register(&config("v1", &["/"])).await.unwrap();
    container
        .set_notification_permission(carniceria_sw::NotificationPermission::Denied)
        .await;

    assert!(container
        .deliver_push(Some(br#"{"title":"Oferta"}"#))
        .await
        .is_none());
}

#[tokio::test]
async fn storage_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let network = storefront();
    let mut config = config("v1", &["/", "/css/styles.css"]);
    config.snapshot_path = Some(dir.path().join("caches.json"));

    let first = container(&network);
    first.register(&config).await.unwrap();
    first
        .persist(config.snapshot_path.as_deref().unwrap())
        .await
        .unwrap();

    let (restored, _events) = ServiceWorkerContainer::restore(network.clone(), &config)
        .await
        .unwrap();
    assert_eq!(restored.cache_names().await, vec!["v1".to_string()]);
    assert_eq!(stored_count(&restored, "v1").await, 2);
}

#[tokio::test]
async fn restart_while_offline_keeps_serving_the_stored_version() {
    let dir = tempfile::tempdir().unwrap();
    let network = storefront();
    let mut config = config("v1", &["/", "/css/styles.css"]);
    config.snapshot_path = Some(dir.path().join("caches.json"));
    config.install_attempts = 1;

    let first = container(&network);
    first.register(&config).await.unwrap();
    first
        .persist(config.snapshot_path.as_deref().unwrap())
        .await
        .unwrap();
    network.go_offline();

    let (restored, _events) = ServiceWorkerContainer::restore(network.clone(), &config)
        .await
        .unwrap();
    let controller = restored.controller().await.unwrap();
    assert_eq!(controller.cache_name(), "v1");
    assert_eq!(controller.state(), ServiceWorkerState::Activated);

    assert!(restored.register(&config).await.is_err());

    let response = restored
        .handle_fetch(&Request::get(url("https://shop.example/css/styles.css")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.text().unwrap(), "body{}");
    assert_eq!(stored_count(&restored, "v1").await, 2);
}

#[tokio::test]
async fn unregistered_storage_restores_without_a_controller() {
    let dir = tempfile::tempdir().unwrap();
    let network = storefront();
    let mut config = config("v1", &["/"]);
    config.snapshot_path = Some(dir.path().join("caches.json"));

    let first = container(&network);
    first.register(&config).await.unwrap();
    first.unregister().await;
    first
        .persist(config.snapshot_path.as_deref().unwrap())
        .await
        .unwrap();

    let (restored, _events) = ServiceWorkerContainer::restore(network.clone(), &config)
        .await
        .unwrap();
    assert!(restored.controller().await.is_none());
    assert_eq!(restored.cache_names().await, vec!["v1".to_string()]);
}

#[tokio::test]
async fn quota_rejects_an_oversized_install() {
    let network = storefront();
    let container = container(&network);
    let mut config = config("v1", &["/", "/index.html", "/offline.html"]);
    config.cache_quota_bytes = Some(16);

    let result = container.register(&config).await;
    assert!(matches!(result, Err(ServiceWorkerError::QuotaExceeded { quota: 16, .. })));
    assert!(container.controller().await.is_none());
}
