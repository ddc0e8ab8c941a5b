//! The worker host: one registration, its versions, and the dispatch table.

use std::sync::Arc;

use mimesis_net::{Fetcher, Request};
use tracing::{debug, error, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::ClientId;
use crate::config::WorkerConfig;
use crate::events::{
    ClickOutcome, EventOutcome, FetchEvent, FetchOutcome, NotificationClickEvent, PushEvent,
    RegistrationOutcome, ResponseSource, SyncEvent, SyncOutcome, WorkerEvent,
};
use crate::lifecycle::{Registration, ServiceWorker, ServiceWorkerId};
use crate::notification::NotificationId;
use crate::worker::{ActivateOutcome, FetchDecision, OfflineCacheWorker, WorkerScope};
use crate::{Result, ServiceWorkerError};

/// Owns the registration and routes events to the right worker version.
///
/// Every method runs to completion before the next event is looked at; the
/// [`WorkerRuntime`](crate::WorkerRuntime) feeds it one event at a time.
pub struct ServiceWorkerHost {
    scope: WorkerScope,
    registration: Option<Registration>,
}

impl ServiceWorkerHost {
    /// Create a host with empty storage.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::from_scope(WorkerScope::new(fetcher))
    }

    /// Create a host over existing cache storage.
    pub fn with_storage(fetcher: Arc<dyn Fetcher>, storage: CacheStorage) -> Self {
        Self::from_scope(WorkerScope::with_storage(fetcher, storage))
    }

    fn from_scope(scope: WorkerScope) -> Self {
        Self {
            scope,
            registration: None,
        }
    }

    /// Shared stores.
    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// The active worker version, if any.
    pub fn active(&self) -> Option<&ServiceWorker> {
        self.registration.as_ref()?.get_active()
    }

    /// Handle one event.
    pub async fn dispatch(&mut self, event: WorkerEvent) -> EventOutcome {
        debug!(event = event.kind(), "Dispatching event");
        match event {
            WorkerEvent::Register(config) => EventOutcome::Registered(self.register(*config).await),
            WorkerEvent::OpenPage(url) => EventOutcome::PageOpened(self.open_page(url).await),
            WorkerEvent::ClosePage(id) => EventOutcome::PageClosed(self.close_page(&id).await),
            WorkerEvent::Fetch(event) => EventOutcome::Fetched(self.fetch(event).await),
            WorkerEvent::Sync(event) => EventOutcome::Synced(self.sync(&event).await),
            WorkerEvent::Push(event) => EventOutcome::Pushed(self.push(&event).await),
            WorkerEvent::NotificationClick(event) => {
                EventOutcome::Clicked(self.notification_click(&event).await)
            }
            WorkerEvent::Unregister => EventOutcome::Unregistered(self.unregister().await),
        }
    }

    // ==================== Lifecycle ====================

    /// Register a worker version built from `config`.
    ///
    /// Registering the configuration that is already installed does nothing.
    /// A failed install discards the new version and leaves the current one
    /// in control.
    pub async fn register(&mut self, config: WorkerConfig) -> Result<RegistrationOutcome> {
        config.validate()?;
        let script = config.script()?;
        let scope = Registration::default_scope(&script);

        if let Some(existing) = &self.registration {
            if existing.scope != scope {
                return Err(ServiceWorkerError::RegistrationFailed(format!(
                    "scope {scope} conflicts with registered scope {}",
                    existing.scope
                )));
            }
            if existing.has_version(&config) {
                debug!(generation = %config.generation, "Worker already registered");
                return Ok(RegistrationOutcome::Unchanged);
            }
        }

        let version = ServiceWorker::new(script, OfflineCacheWorker::new(config)?);
        let id = version.id;
        let handlers = Arc::clone(&version.worker);
        info!(worker = %id, generation = %handlers.cache_name(), scope = %scope, "Registering worker");

        self.registration
            .get_or_insert_with(|| Registration::new(scope))
            .begin_install(version);

        let install = match handlers.install(&self.scope).await {
            Ok(install) => install,
            Err(e) => {
                error!(worker = %id, error = %e, "Install failed; keeping current worker");
                let reason = e.to_string();
                if let Some(registration) = self.registration.as_mut() {
                    registration.install_failed(reason.clone());
                }
                return Ok(RegistrationOutcome::Rejected { worker: id, reason });
            }
        };

        let old = match self.registration.as_mut() {
            Some(registration) => {
                registration.install_complete();
                registration.get_active().map(|w| w.id)
            }
            None => return Err(ServiceWorkerError::StateError("registration lost".to_string())),
        };

        let blocked = match old {
            Some(old) if !install.skip_waiting => self.scope.clients.read().await.controlled_by(old) > 0,
            _ => false,
        };
        if blocked {
            info!(worker = %id, "Installed; waiting for open pages to close");
            return Ok(RegistrationOutcome::Waiting { worker: id, install });
        }

        match self.activate_waiting().await {
            Some(activate) => Ok(RegistrationOutcome::Activated {
                worker: id,
                install,
                activate,
            }),
            None => Err(ServiceWorkerError::StateError(format!(
                "{id} was not waiting after install"
            ))),
        }
    }

    /// Activate the waiting version, if there is one.
    pub async fn activate_waiting(&mut self) -> Option<ActivateOutcome> {
        let activating = self.registration.as_mut()?.begin_activation()?;
        let id = activating.id;
        let handlers = Arc::clone(&activating.worker);

        let outcome = handlers.activate(&self.scope, id).await;

        if let Some(registration) = self.registration.as_mut() {
            registration.finish_activation();
        }
        Some(outcome)
    }

    /// Unregister. Pages keep running uncontrolled; caches are kept.
    pub async fn unregister(&mut self) -> bool {
        let Some(mut registration) = self.registration.take() else {
            return false;
        };
        registration.unregister();
        let released = self.scope.clients.write().await.release_all();
        info!(scope = %registration.scope, released, "Unregistered worker");
        true
    }

    // ==================== Pages ====================

    /// A page loaded at `url`. It is controlled by the active version if in scope.
    pub async fn open_page(&mut self, url: Url) -> ClientId {
        let controller = self.controller_for(&url);
        let id = self.scope.clients.write().await.add_window(url, controller);
        debug!(client = %id, controlled = controller.is_some(), "Page opened");
        id
    }

    /// A page closed. The last page of an old version lets the waiting one in.
    pub async fn close_page(&mut self, id: &ClientId) -> Option<ActivateOutcome> {
        let removed = self.scope.clients.write().await.remove(id);
        debug!(client = %id, known = removed.is_some(), "Page closed");

        let registration = self.registration.as_ref()?;
        registration.waiting.as_ref()?;
        if let Some(active) = registration.get_active() {
            if self.scope.clients.read().await.controlled_by(active.id) > 0 {
                return None;
            }
        }
        self.activate_waiting().await
    }

    fn controller_for(&self, url: &Url) -> Option<ServiceWorkerId> {
        let registration = self.registration.as_ref()?;
        if !registration.in_scope(url) {
            return None;
        }
        registration.get_active().map(|w| w.id)
    }

    /// The active version's handlers, when `id` names it.
    fn handlers_for(&self, id: Option<ServiceWorkerId>) -> Option<Arc<OfflineCacheWorker>> {
        let active = self.active()?;
        (Some(active.id) == id).then(|| Arc::clone(&active.worker))
    }

    fn active_handlers(&self) -> Result<Arc<OfflineCacheWorker>> {
        self.active()
            .map(|w| Arc::clone(&w.worker))
            .ok_or_else(|| ServiceWorkerError::StateError("no active worker".to_string()))
    }

    // ==================== Functional events ====================

    /// Route a page request through its controlling worker, or straight to
    /// the network when the page is uncontrolled.
    pub async fn fetch(&mut self, event: FetchEvent) -> Result<FetchOutcome> {
        let FetchEvent { request, client_id } = event;

        let controller = if request.is_navigation() {
            let controller = self.controller_for(&request.url);
            if let Some(client_id) = &client_id {
                let mut clients = self.scope.clients.write().await;
                if let Some(client) = clients.get_mut(client_id) {
                    client.navigate(request.url.clone());
                    client.controller = controller;
                }
            }
            controller
        } else {
            match &client_id {
                Some(client_id) => self
                    .scope
                    .clients
                    .read()
                    .await
                    .get(client_id)
                    .and_then(|c| c.controller),
                None => self.controller_for(&request.url),
            }
        };

        let Some(handlers) = self.handlers_for(controller) else {
            debug!(url = %request.url, "Uncontrolled request");
            return self.network(request).await;
        };

        match handlers.handle_fetch(&self.scope, request).await {
            FetchDecision::Respond(outcome) => Ok(outcome),
            FetchDecision::Passthrough { request, .. } => self.network(request).await,
            FetchDecision::NoResponse(error) => Err(error.into()),
        }
    }

    async fn network(&self, request: Request) -> Result<FetchOutcome> {
        let response = self.scope.fetcher.fetch(request).await?;
        Ok(FetchOutcome {
            response,
            source: ResponseSource::Passthrough,
        })
    }

    pub async fn sync(&mut self, event: &SyncEvent) -> Result<SyncOutcome> {
        let handlers = self.active_handlers()?;
        Ok(handlers.handle_sync(&event.tag).await)
    }

    pub async fn push(&mut self, event: &PushEvent) -> Result<NotificationId> {
        let handlers = self.active_handlers()?;
        Ok(handlers.handle_push(&self.scope, event.data.as_ref()).await)
    }

    pub async fn notification_click(
        &mut self,
        event: &NotificationClickEvent,
    ) -> Result<ClickOutcome> {
        let handlers = self.active_handlers()?;
        handlers.handle_notification_click(&self.scope, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ServiceWorkerState;
    use mimesis_net::MemoryOrigin;

    const ORIGIN: &str = "https://mimesis.test/";

    fn site() -> Arc<MemoryOrigin> {
        Arc::new(
            MemoryOrigin::parse(ORIGIN)
                .unwrap()
                .serve("/", "<html>home</html>")
                .serve("/a.css", "v1 styles")
                .serve("/b.js", "script"),
        )
    }

    fn config(generation: &str) -> WorkerConfig {
        WorkerConfig::for_origin(Url::parse(ORIGIN).unwrap())
            .with_generation(generation)
            .unwrap()
            .with_precache(&["/", "/a.css"])
            .with_offline_fallback("/")
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    async fn activated(outcome: Result<RegistrationOutcome>) -> (ServiceWorkerId, ActivateOutcome) {
        match outcome.unwrap() {
            RegistrationOutcome::Activated {
                worker, activate, ..
            } => (worker, activate),
            other => panic!("expected activation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_registration_activates_and_claims() {
        let mut host = ServiceWorkerHost::new(site());
        let page = host.open_page(url("/")).await;

        let (worker, activate) = activated(host.register(config("app-v1")).await).await;
        assert_eq!(activate.claimed, 1);
        assert!(activate.deleted.is_empty());

        let active = host.active().unwrap();
        assert_eq!(active.id, worker);
        assert_eq!(active.state, ServiceWorkerState::Activated);

        let clients = host.scope().clients.read().await;
        assert_eq!(clients.get(&page).unwrap().controller, Some(worker));
    }

    #[tokio::test]
    async fn test_reregistering_same_config_is_noop() {
        let origin = site();
        let mut host = ServiceWorkerHost::new(origin.clone());
        host.register(config("app-v1")).await.unwrap();
        let calls = origin.calls();

        let outcome = host.register(config("app-v1")).await.unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Unchanged));
        assert_eq!(origin.calls(), calls);
    }

    #[tokio::test]
    async fn test_new_generation_replaces_old_cache() {
        let mut host = ServiceWorkerHost::new(site());
        let (v1, _) = activated(host.register(config("app-v1")).await).await;
        host.open_page(url("/")).await;

        let (v2, activate) = activated(host.register(config("app-v2")).await).await;
        assert_ne!(v1, v2);
        assert_eq!(activate.deleted, vec!["app-v1".to_string()]);
        assert_eq!(host.scope().caches.read().await.keys(), vec!["app-v2".to_string()]);
        assert_eq!(host.scope().clients.read().await.controlled_by(v2), 1);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_current_version() {
        let origin = Arc::new(
            MemoryOrigin::parse(ORIGIN)
                .unwrap()
                .serve("/", "<html>home</html>")
                .serve("/a.css", "v1 styles")
                .unreachable("/new.css"),
        );
        let mut host = ServiceWorkerHost::new(origin);
        let (v1, _) = activated(host.register(config("app-v1")).await).await;

        let broken = config("app-v2").with_precache(&["/", "/new.css"]);
        match host.register(broken).await.unwrap() {
            RegistrationOutcome::Rejected { reason, .. } => assert!(reason.contains("/new.css")),
            other => panic!("expected rejection, got {other:?}"),
        }

        assert_eq!(host.active().unwrap().id, v1);
        assert!(host.registration().unwrap().installing.is_none());
        assert_eq!(host.scope().caches.read().await.keys(), vec!["app-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_waiting_version_activates_when_pages_close() {
        let mut host = ServiceWorkerHost::new(site());
        let (v1, _) = activated(host.register(config("app-v1")).await).await;
        let page = host.open_page(url("/")).await;

        let outcome = host
            .register(config("app-v2").with_skip_waiting(false))
            .await
            .unwrap();
        let RegistrationOutcome::Waiting { worker: v2, .. } = outcome else {
            panic!("expected the new version to wait");
        };
        assert_eq!(host.active().unwrap().id, v1);
        assert!(host.scope().caches.read().await.has("app-v1"));

        let activate = host.close_page(&page).await.unwrap();
        assert_eq!(activate.deleted, vec!["app-v1".to_string()]);
        assert_eq!(host.active().unwrap().id, v2);
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_goes_to_network() {
        let origin = site();
        let mut host = ServiceWorkerHost::new(origin.clone());

        let outcome = host
            .fetch(FetchEvent::new(Request::get(url("/a.css"))))
            .await
            .unwrap();
        assert_eq!(outcome.source, ResponseSource::Passthrough);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_controlled_fetch_uses_cache() {
        let origin = site();
        let mut host = ServiceWorkerHost::new(origin.clone());
        host.register(config("app-v1")).await.unwrap();
        let page = host.open_page(url("/")).await;
        origin.clear_log();

        let event = FetchEvent::from_client(Request::get(url("/a.css")), page);
        let outcome = host.fetch(event).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Cache);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_subresource_is_network_error() {
        let origin = site();
        let mut host = ServiceWorkerHost::new(origin.clone());
        host.register(config("app-v1")).await.unwrap();
        origin.set_offline(true);

        let err = host
            .fetch(FetchEvent::new(Request::get(url("/b.js"))))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Network(_)));
    }

    #[tokio::test]
    async fn test_navigation_takes_control_of_page() {
        let mut host = ServiceWorkerHost::new(site());
        let page = host.open_page(url("/")).await;
        {
            let clients = host.scope().clients.read().await;
            assert!(clients.get(&page).unwrap().controller.is_none());
        }
        let (worker, _) = activated(host.register(config("app-v1")).await).await;

        let nav = FetchEvent::from_client(Request::navigate(url("/b.js")), page.clone());
        host.fetch(nav).await.unwrap();

        let clients = host.scope().clients.read().await;
        let client = clients.get(&page).unwrap();
        assert_eq!(client.controller, Some(worker));
        assert_eq!(client.url.path(), "/b.js");
    }

    #[tokio::test]
    async fn test_functional_events_need_active_worker() {
        let mut host = ServiceWorkerHost::new(site());
        let sync = SyncEvent {
            tag: "background-sync".to_string(),
        };
        assert!(matches!(
            host.sync(&sync).await,
            Err(ServiceWorkerError::StateError(_))
        ));
        assert!(host.push(&PushEvent::default()).await.is_err());

        host.register(config("app-v1")).await.unwrap();
        assert_eq!(host.sync(&sync).await.unwrap(), SyncOutcome::Reconciled);
        let id = host.push(&PushEvent::text("hello")).await.unwrap();
        let notifications = host.scope().notifications.read().await;
        assert_eq!(notifications.get(id).unwrap().body, "hello");
    }

    #[tokio::test]
    async fn test_unregister_releases_pages() {
        let mut host = ServiceWorkerHost::new(site());
        host.register(config("app-v1")).await.unwrap();
        let page = host.open_page(url("/")).await;

        assert!(host.unregister().await);
        assert!(!host.unregister().await);
        assert!(host.active().is_none());

        let clients = host.scope().clients.read().await;
        assert!(clients.get(&page).unwrap().controller.is_none());
        assert!(host.scope().caches.read().await.has("app-v1"));
    }

    #[tokio::test]
    async fn test_dispatch_routes_events() {
        let mut host = ServiceWorkerHost::new(site());
        let outcome = host
            .dispatch(WorkerEvent::Register(Box::new(config("app-v1"))))
            .await;
        assert!(matches!(
            outcome,
            EventOutcome::Registered(Ok(RegistrationOutcome::Activated { .. }))
        ));

        let outcome = host.dispatch(WorkerEvent::OpenPage(url("/"))).await;
        assert!(matches!(outcome, EventOutcome::PageOpened(_)));

        let outcome = host.dispatch(WorkerEvent::Unregister).await;
        assert!(matches!(outcome, EventOutcome::Unregistered(true)));
    }
}
