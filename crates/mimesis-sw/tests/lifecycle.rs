//! Deploy scenarios driven through the event loop.

use std::sync::Arc;

use mimesis_net::{Destination, MemoryOrigin, Request};
use mimesis_sw::{
    ClickOutcome, FetchEvent, NotificationClickEvent, PushEvent, RegistrationOutcome,
    ResponseSource, ServiceWorkerError, ServiceWorkerHost, WorkerConfig, WorkerRuntime,
};
use tracing_subscriber::EnvFilter;
use url::Url;

const ORIGIN: &str = "https://mimesis.test/";

/// Route worker logs to the test harness; `RUST_LOG=mimesis_sw=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn site() -> Arc<MemoryOrigin> {
    Arc::new(
        MemoryOrigin::parse(ORIGIN)
            .unwrap()
            .serve("/", "<html>home</html>")
            .serve("/a.css", "body{}")
            .serve("/b.js", "run()")
            .serve("/results", "<html>results</html>")
            .serve("/api/recommend", "{\"style\":\"minimal\"}"),
    )
}

fn deploy(generation: &str, manifest: &[&str]) -> WorkerConfig {
    WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
        .with_generation(generation)
        .unwrap()
        .with_precache(manifest)
        .with_offline_fallback("/")
}

#[tokio::test]
async fn test_generation_upgrade_end_to_end() {
    init_tracing();
    let origin = site();
    let (sw, task) = WorkerRuntime::spawn(ServiceWorkerHost::new(origin.clone()));

    let v1 = match sw.register(deploy("app-v1", &["/", "/a.css"])).await.unwrap() {
        RegistrationOutcome::Activated { worker, install, .. } => {
            assert_eq!(install.cache, "app-v1");
            assert_eq!(install.cached, 2);
            worker
        }
        other => panic!("v1 should activate, got {other:?}"),
    };
    let page = sw.open_page(url("/")).await.unwrap();

    let outcome = sw
        .register(deploy("app-v2", &["/", "/a.css", "/b.js"]))
        .await
        .unwrap();
    let RegistrationOutcome::Activated {
        worker: v2,
        install,
        activate,
    } = outcome
    else {
        panic!("v2 should activate");
    };
    assert_ne!(v1, v2);
    assert_eq!(install.cached, 3);
    assert_eq!(activate.deleted, vec!["app-v1".to_string()]);
    assert_eq!(activate.claimed, 1);

    // Same page, no reload: its next request is served by v2's store.
    origin.clear_log();
    let fetched = sw
        .fetch(FetchEvent::from_client(Request::get(url("/b.js")), page.clone()))
        .await
        .unwrap();
    assert_eq!(fetched.source, ResponseSource::Cache);
    assert_eq!(fetched.response.text().await.unwrap(), "run()");
    assert_eq!(origin.calls(), 0);

    drop(sw);
    let host = task.await.unwrap();
    assert_eq!(host.active().unwrap().id, v2);

    let caches = host.scope().caches.read().await;
    assert_eq!(caches.keys(), vec!["app-v2".to_string()]);
    assert_eq!(caches.get("app-v2").unwrap().len(), 3);

    let clients = host.scope().clients.read().await;
    assert_eq!(clients.get(&page).unwrap().controller, Some(v2));
}

#[tokio::test]
async fn test_offline_browsing_after_install() {
    init_tracing();
    let origin = site();
    let (sw, _task) = WorkerRuntime::spawn(ServiceWorkerHost::new(origin.clone()));
    sw.register(deploy("app-v1", &["/", "/a.css"])).await.unwrap();
    let page = sw.open_page(url("/")).await.unwrap();

    // Warm one page while online.
    let warmed = sw
        .fetch(FetchEvent::from_client(Request::navigate(url("/results")), page.clone()))
        .await
        .unwrap();
    assert_eq!(warmed.source, ResponseSource::Network);

    origin.set_offline(true);

    let results = sw
        .fetch(FetchEvent::from_client(Request::navigate(url("/results")), page.clone()))
        .await
        .unwrap();
    assert_eq!(results.source, ResponseSource::Cache);

    let profile = sw
        .fetch(FetchEvent::from_client(Request::navigate(url("/profile")), page.clone()))
        .await
        .unwrap();
    assert_eq!(profile.source, ResponseSource::OfflineFallback);
    assert_eq!(profile.response.text().await.unwrap(), "<html>home</html>");

    let script = Request::get(url("/b.js")).destination(Destination::Script);
    let missing = sw.fetch(FetchEvent::from_client(script, page.clone())).await;
    assert!(matches!(missing, Err(ServiceWorkerError::Network(_))));

    let api = sw
        .fetch(FetchEvent::from_client(Request::get(url("/api/recommend")), page))
        .await;
    assert!(matches!(api, Err(ServiceWorkerError::Network(_))));
}

#[tokio::test]
async fn test_api_responses_never_cached() {
    init_tracing();
    let origin = site();
    let (sw, task) = WorkerRuntime::spawn(ServiceWorkerHost::new(origin.clone()));
    sw.register(deploy("app-v1", &["/"])).await.unwrap();
    let page = sw.open_page(url("/")).await.unwrap();

    for _ in 0..2 {
        let outcome = sw
            .fetch(FetchEvent::from_client(Request::get(url("/api/recommend")), page.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.source, ResponseSource::Passthrough);
    }
    assert_eq!(origin.requests().iter().filter(|u| u.path() == "/api/recommend").count(), 2);

    drop(sw);
    let host = task.await.unwrap();
    let caches = host.scope().caches.read().await;
    let store = caches.get("app-v1").unwrap();
    assert!(store.keys().iter().all(|k| !k.url.contains("/api/")));
}

#[tokio::test]
async fn test_waiting_version_takes_over_after_last_page_closes() {
    init_tracing();
    let origin = site();
    let (sw, _task) = WorkerRuntime::spawn(ServiceWorkerHost::new(origin));
    sw.register(deploy("app-v1", &["/", "/a.css"])).await.unwrap();
    let first = sw.open_page(url("/")).await.unwrap();
    let second = sw.open_page(url("/results")).await.unwrap();

    let next = deploy("app-v2", &["/", "/a.css", "/b.js"]).with_skip_waiting(false);
    assert!(matches!(
        sw.register(next).await.unwrap(),
        RegistrationOutcome::Waiting { .. }
    ));

    assert!(sw.close_page(first).await.unwrap().is_none());
    let activate = sw.close_page(second).await.unwrap().unwrap();
    assert_eq!(activate.deleted, vec!["app-v1".to_string()]);
}

#[tokio::test]
async fn test_push_then_explore_opens_root() {
    init_tracing();
    let (sw, _task) = WorkerRuntime::spawn(ServiceWorkerHost::new(site()));
    sw.register(deploy("app-v1", &["/"])).await.unwrap();

    let shown = sw
        .push(PushEvent::text("Three new looks for you"))
        .await
        .unwrap();
    let outcome = sw
        .notification_click(NotificationClickEvent {
            notification: shown,
            action: Some("explore".to_string()),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ClickOutcome::OpenedWindow(_)));
    assert_eq!(sw.sync("background-sync").await.unwrap(), mimesis_sw::SyncOutcome::Reconciled);
}
