//! Event handlers of one worker version.
//!
//! [`OfflineCacheWorker`] holds no mutable state of its own. Each handler
//! takes the event data plus the shared [`WorkerScope`] and returns a future
//! the host awaits to completion, which is what keeps the event open across
//! every cache and network suspension point.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::try_join_all;
use mimesis_net::{BypassList, Fetcher, NetError, Request, RequestMode, Response, ResponseType};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::events::{
    ClickOutcome, FetchOutcome, NotificationClickEvent, ResponseSource, SyncOutcome,
};
use crate::lifecycle::ServiceWorkerId;
use crate::notification::{Notification, NotificationAction, NotificationId, Notifications};
use crate::{Result, ServiceWorkerError};

/// Everything a handler may touch: shared stores and the network.
#[derive(Clone)]
pub struct WorkerScope {
    /// Cache storage.
    pub caches: Arc<RwLock<CacheStorage>>,

    /// Pages known to the host.
    pub clients: Arc<RwLock<Clients>>,

    /// Notifications on screen.
    pub notifications: Arc<RwLock<Notifications>>,

    /// Network access.
    pub fetcher: Arc<dyn Fetcher>,
}

impl WorkerScope {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::with_storage(fetcher, CacheStorage::new())
    }

    pub fn with_storage(fetcher: Arc<dyn Fetcher>, storage: CacheStorage) -> Self {
        Self {
            caches: Arc::new(RwLock::new(storage)),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Notifications::new())),
            fetcher,
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Cache store that was populated.
    pub cache: String,
    /// Number of manifest entries stored.
    pub cached: usize,
    /// Whether the worker asked to activate without waiting.
    pub skip_waiting: bool,
}

/// Result of activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Stale cache stores that were deleted.
    pub deleted: Vec<String>,
    /// Clients that switched to this version.
    pub claimed: usize,
}

/// Why a request skipped the worker's caching logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    /// Method is not cacheable.
    Method,
    /// URL matched a bypass pattern.
    Bypass,
}

/// What the fetch handler decided.
#[derive(Debug)]
pub enum FetchDecision {
    /// Not handled; the host sends the request to the network as-is.
    Passthrough { request: Request, reason: PassReason },
    /// Handled with a response.
    Respond(FetchOutcome),
    /// Handled, but no response could be produced.
    NoResponse(NetError),
}

/// Handlers for one version of the offline cache worker.
#[derive(Debug)]
pub struct OfflineCacheWorker {
    config: WorkerConfig,
    manifest: Vec<Url>,
    bypass: BypassList,
    fallback: RequestKey,
    root: Url,
}

impl OfflineCacheWorker {
    /// Build handlers from a configuration.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let manifest = config.manifest_urls()?;
        let fallback = RequestKey::get(&config.fallback_url()?);
        let root = config.root()?;
        let bypass = config.bypass_list();

        Ok(Self {
            config,
            manifest,
            bypass,
            fallback,
            root,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the cache store this version owns.
    pub fn cache_name(&self) -> &str {
        self.config.generation.as_str()
    }

    // ==================== Install ====================

    /// Fetch every manifest entry, then store them all in one write.
    ///
    /// Nothing is written unless every fetch returned a 2xx response.
    pub async fn install(&self, scope: &WorkerScope) -> Result<InstallOutcome> {
        let cache = self.cache_name();
        info!(cache = %cache, entries = self.manifest.len(), "Installing: caching files");

        let fetches = self
            .manifest
            .iter()
            .map(|url| precache_one(scope.fetcher.as_ref(), url));
        let entries = try_join_all(fetches).await?;
        let cached = entries.len();

        scope.caches.write().await.put_all(cache, entries)?;
        info!(cache = %cache, cached, "Files cached successfully");

        Ok(InstallOutcome {
            cache: cache.to_string(),
            cached,
            skip_waiting: self.config.skip_waiting,
        })
    }

    // ==================== Activate ====================

    /// Delete every other generation's store, then claim all clients.
    pub async fn activate(&self, scope: &WorkerScope, id: ServiceWorkerId) -> ActivateOutcome {
        let current = self.cache_name();
        info!(cache = %current, "Activating");

        let deleted = {
            let mut caches = scope.caches.write().await;
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| name != current)
                .collect();
            for name in &stale {
                info!(cache = %name, "Deleting old cache");
                caches.delete(name);
            }
            stale
        };

        let claimed = scope.clients.write().await.claim(id);
        info!(worker = %id, claimed, "Activated successfully");

        ActivateOutcome { deleted, claimed }
    }

    // ==================== Fetch ====================

    /// Apply the interception policy to one request.
    pub async fn handle_fetch(&self, scope: &WorkerScope, request: Request) -> FetchDecision {
        let Some(key) = RequestKey::for_request(&request) else {
            trace!(url = %request.url, method = %request.method, "Skipping non-GET request");
            return FetchDecision::Passthrough {
                request,
                reason: PassReason::Method,
            };
        };

        if self.bypass.matches(&request.url) {
            debug!(url = %request.url, "Skipping excluded request");
            return FetchDecision::Passthrough {
                request,
                reason: PassReason::Bypass,
            };
        }

        if let Some(response) = self.lookup(scope, &key).await {
            debug!(url = %request.url, "Serving from cache");
            return FetchDecision::Respond(FetchOutcome {
                response,
                source: ResponseSource::Cache,
            });
        }

        debug!(url = %request.url, "Fetching from network");
        let is_navigation = request.is_navigation();
        let result = match scope.fetcher.fetch(request).await {
            Ok(response) => self.populate(scope, key, response).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => FetchDecision::Respond(FetchOutcome {
                response,
                source: ResponseSource::Network,
            }),
            Err(error) => {
                if is_navigation {
                    if let Some(response) = self.lookup(scope, &self.fallback).await {
                        info!(error = %error, "Network failed; serving offline page");
                        return FetchDecision::Respond(FetchOutcome {
                            response,
                            source: ResponseSource::OfflineFallback,
                        });
                    }
                }
                debug!(error = %error, navigation = is_navigation, "Network failed, no response");
                FetchDecision::NoResponse(error)
            }
        }
    }

    /// Stored response for `key` in this generation. Unreadable entries miss.
    async fn lookup(&self, scope: &WorkerScope, key: &RequestKey) -> Option<Response> {
        let caches = scope.caches.read().await;
        let entry = caches.match_in(self.cache_name(), key)?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %key.url, error = %e, "Unreadable cache entry; treating as miss");
                None
            }
        }
    }

    /// Store a copy of a cacheable response; hand the other copy back.
    ///
    /// Storage failures are logged and never affect the returned response.
    async fn populate(
        &self,
        scope: &WorkerScope,
        key: RequestKey,
        response: Response,
    ) -> std::result::Result<Response, NetError> {
        if !is_cacheable(&response) {
            trace!(
                url = %response.url,
                status = response.status,
                response_type = ?response.response_type,
                "Response not cacheable"
            );
            return Ok(response);
        }

        let (for_page, for_cache) = response.tee().await?;

        match CacheEntry::from_response(for_cache).await {
            Ok(entry) => {
                let stored = scope
                    .caches
                    .write()
                    .await
                    .put(self.cache_name(), key, entry);
                if let Err(e) = stored {
                    warn!(cache = %self.cache_name(), error = %e, "Cache write failed");
                }
            }
            Err(e) => warn!(error = %e, "Could not snapshot response for cache"),
        }

        Ok(for_page)
    }

    // ==================== Sync ====================

    /// React to a background sync trigger.
    pub async fn handle_sync(&self, tag: &str) -> SyncOutcome {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring sync tag");
            return SyncOutcome::Ignored;
        }

        info!(tag, "Background sync triggered");
        self.reconcile().await;
        SyncOutcome::Reconciled
    }

    /// Flush actions queued while offline. Nothing is queued yet.
    async fn reconcile(&self) {
        debug!("Processing background sync");
        tokio::task::yield_now().await;
    }

    // ==================== Push ====================

    /// Show a notification for a push message.
    pub async fn handle_push(&self, scope: &WorkerScope, data: Option<&Bytes>) -> NotificationId {
        info!("Push notification received");
        let body = payload_text(data).unwrap_or_else(|| self.config.notification.default_body.clone());
        let notification = self.notification(body);
        scope.notifications.write().await.show(notification)
    }

    fn notification(&self, body: String) -> Notification {
        let config = &self.config.notification;
        Notification {
            id: Notification::UNSHOWN,
            title: config.title.clone(),
            body,
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            data: json!({
                "dateOfArrival": now_millis(),
                "primaryKey": config.primary_key,
            }),
            actions: config
                .actions
                .iter()
                .map(|a| NotificationAction {
                    action: a.action.clone(),
                    title: a.title.clone(),
                    icon: a.icon.clone(),
                })
                .collect(),
        }
    }

    /// Close the clicked notification; `explore` opens the root page.
    pub async fn handle_notification_click(
        &self,
        scope: &WorkerScope,
        event: &NotificationClickEvent,
    ) -> Result<ClickOutcome> {
        info!(action = ?event.action, "Notification clicked");

        if !scope.notifications.write().await.close(event.notification) {
            return Err(ServiceWorkerError::NotFound(format!(
                "notification {:?}",
                event.notification
            )));
        }

        let open_root = match event.action.as_deref() {
            Some("explore") => true,
            None => self.config.notification.open_root_on_body_click,
            Some(_) => false,
        };
        if !open_root {
            return Ok(ClickOutcome::Closed);
        }

        let client = scope.clients.write().await.open_window(self.root.clone());
        Ok(ClickOutcome::OpenedWindow(client))
    }
}

async fn precache_one(
    fetcher: &dyn Fetcher,
    url: &Url,
) -> Result<(RequestKey, CacheEntry)> {
    let failed = |reason: String| ServiceWorkerError::InstallFailed {
        url: url.to_string(),
        reason,
    };

    let request = Request::get(url.clone()).mode(RequestMode::SameOrigin);
    let response = fetcher.fetch(request).await.map_err(|e| failed(e.to_string()))?;
    if !response.ok() {
        return Err(failed(format!("status {}", response.status)));
    }

    let entry = CacheEntry::from_response(response)
        .await
        .map_err(|e| failed(e.to_string()))?;
    Ok((RequestKey::get(url), entry))
}

/// Only plain same-origin 200s are stored.
fn is_cacheable(response: &Response) -> bool {
    response.status == 200 && response.response_type == ResponseType::Basic && !response.redirected
}

fn payload_text(data: Option<&Bytes>) -> Option<String> {
    let data = data?;
    match std::str::from_utf8(data) {
        Ok(text) if !text.is_empty() => Some(text.to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Push payload is not text; using default body");
            None
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
