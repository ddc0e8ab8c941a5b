//! In-memory origin server.
//!
//! Serves a fixed route table without touching the network. Used to drive
//! the worker offline and in tests, where the request log doubles as a
//! network-call counter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;
use url::Url;

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

#[derive(Debug, Clone)]
struct Route {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
    redirect_to: Option<Url>,
}

/// A route table standing in for the origin server and any third-party hosts.
#[derive(Debug)]
pub struct MemoryOrigin {
    origin: Url,
    routes: HashMap<Url, Route>,
    unreachable: HashSet<Url>,
    offline: AtomicBool,
    log: Mutex<Vec<Url>>,
}

impl MemoryOrigin {
    /// Create an origin with no routes. Unknown paths answer 404.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: HashMap::new(),
            unreachable: HashSet::new(),
            offline: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Parse `origin` and create an empty route table.
    pub fn parse(origin: &str) -> Result<Self, NetError> {
        Url::parse(origin)
            .map(Self::new)
            .map_err(|e| NetError::InvalidUrl(e.to_string()))
    }

    /// The origin pages are served from.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, NetError> {
        self.origin
            .join(path)
            .map_err(|e| NetError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Serve `body` with status 200 at `path`.
    pub fn serve(self, path: &str, body: impl Into<Bytes>) -> Self {
        self.serve_status(path, 200, body)
    }

    /// Serve `body` with the given status at `path`.
    pub fn serve_status(mut self, path: &str, status: u16, body: impl Into<Bytes>) -> Self {
        if let Ok(url) = self.resolve(path) {
            self.routes.insert(
                url,
                Route {
                    status,
                    headers: HeaderMap::new(),
                    body: body.into(),
                    redirect_to: None,
                },
            );
        }
        self
    }

    /// Add a header to an existing route.
    pub fn header(mut self, path: &str, name: &'static str, value: &'static str) -> Self {
        if let Ok(url) = self.resolve(path) {
            if let Some(route) = self.routes.get_mut(&url) {
                route.headers.insert(
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                );
            }
        }
        self
    }

    /// Answer `from` with whatever `to` serves, flagged as redirected.
    pub fn redirect(mut self, from: &str, to: &str) -> Self {
        if let (Ok(from), Ok(to)) = (self.resolve(from), self.resolve(to)) {
            self.routes.insert(
                from,
                Route {
                    status: 301,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                    redirect_to: Some(to),
                },
            );
        }
        self
    }

    /// Make `path` fail at the network layer.
    pub fn unreachable(mut self, path: &str) -> Self {
        if let Ok(url) = self.resolve(path) {
            self.unreachable.insert(url);
        }
        self
    }

    /// Take the whole origin offline, or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches issued so far.
    pub fn calls(&self) -> usize {
        self.lock_log().len()
    }

    /// URLs fetched so far, in order.
    pub fn requests(&self) -> Vec<Url> {
        self.lock_log().clone()
    }

    /// Reset the request log.
    pub fn clear_log(&self) {
        self.lock_log().clear();
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, Vec<Url>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn classify(&self, url: &Url, mode: RequestMode) -> ResponseType {
        if url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else if mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for MemoryOrigin {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let mut url = request.url.clone();
        url.set_fragment(None);
        self.lock_log().push(url.clone());

        if self.offline.load(Ordering::SeqCst) || self.unreachable.contains(&url) {
            debug!(url = %url, "Memory origin unreachable");
            return Err(NetError::Offline(url.to_string()));
        }

        if request.mode == RequestMode::SameOrigin && url.origin() != self.origin.origin() {
            return Err(NetError::RequestFailed(format!(
                "cross-origin request to {url} in same-origin mode"
            )));
        }

        let mut redirected = false;
        let mut final_url = url;
        let mut route = self.routes.get(&final_url).cloned();
        if let Some(target) = route.as_ref().and_then(|r| r.redirect_to.clone()) {
            redirected = true;
            route = self.routes.get(&target).cloned();
            final_url = target;
        }

        let response_type = self.classify(&final_url, request.mode);
        if response_type == ResponseType::Opaque {
            return Ok(Response::opaque(final_url).with_redirected(redirected));
        }

        let response = match route {
            Some(route) => Response::new(final_url, route.status)
                .with_headers(route.headers)
                .with_body(route.body),
            None => Response::new(final_url, 404),
        };

        Ok(response
            .with_type(response_type)
            .with_redirected(redirected))
    }
}
