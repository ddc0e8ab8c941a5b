//! Worker configuration.
//!
//! Everything the worker script used to hard-code (cache name, precache
//! list, bypass hosts, notification contents) is injected through
//! [`WorkerConfig`]. Bumping [`WorkerConfig::generation`] is the only way
//! to invalidate previously cached assets.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use mimesis_net::BypassList;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Cache generation identifier, `name-vMAJOR[.MINOR...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GenerationId {
    raw: String,
    name_len: usize,
    version: Vec<u32>,
}

impl GenerationId {
    /// The human-readable part before `-v`.
    pub fn name(&self) -> &str {
        &self.raw[..self.name_len]
    }

    /// Version components after `-v`.
    pub fn version(&self) -> &[u32] {
        &self.version
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for GenerationId {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ServiceWorkerError::Config(format!(
                "generation id {s:?} must look like name-vMAJOR.MINOR"
            ))
        };

        let (name, version) = s.rsplit_once("-v").ok_or_else(invalid)?;
        if name.trim().is_empty() {
            return Err(invalid());
        }

        let version = version
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                part.parse::<u32>().map_err(|_| invalid())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw: s.to_string(),
            name_len: name.len(),
            version,
        })
    }
}

impl TryFrom<String> for GenerationId {
    type Error = ServiceWorkerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<GenerationId> for String {
    fn from(id: GenerationId) -> Self {
        id.raw
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq<str> for GenerationId {
    fn eq(&self, other: &str) -> bool {
        self.raw == other
    }
}

impl PartialEq<&str> for GenerationId {
    fn eq(&self, other: &&str) -> bool {
        self.raw == *other
    }
}

/// One button on a push notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationActionConfig {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// Push notification contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification title.
    pub title: String,
    /// Body used when the push payload is absent or unreadable.
    pub default_body: String,
    pub icon: String,
    pub badge: String,
    /// Vibration pattern in milliseconds (on, off, on, ...).
    pub vibrate: Vec<u32>,
    /// Correlation key placed in the notification data.
    pub primary_key: u64,
    pub actions: Vec<NotificationActionConfig>,
    /// Open the root page when the body (no action button) is clicked.
    pub open_root_on_body_click: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        let action = |action: &str, title: &str| NotificationActionConfig {
            action: action.to_string(),
            title: title.to_string(),
            icon: "/static/icon-192.png".to_string(),
        };

        Self {
            title: "Mimesis Style Update".to_string(),
            default_body: "New style recommendation available!".to_string(),
            icon: "/static/icon-192.png".to_string(),
            badge: "/static/badge-72.png".to_string(),
            vibrate: vec![100, 50, 100],
            primary_key: 1,
            actions: vec![action("explore", "Explore Styles"), action("close", "Close")],
            open_root_on_body_click: false,
        }
    }
}

/// Default precache manifest.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/static/css/styles.css",
    "/static/js/scripts.js",
    "/static/manifest.json",
    "/templates/base.html",
    "/templates/index.html",
    "/templates/results.html",
    "/templates/profile.html",
    "/templates/analytics.html",
    "/templates/popular.html",
];

/// Default URL substrings that bypass the cache.
pub const DEFAULT_BYPASS: &[&str] = &["/api/", "googleapis.com", "gstatic.com", "cdn.jsdelivr.net"];

/// Service worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker script path, relative to `origin`.
    pub script_url: String,

    /// Origin the pages and assets are served from.
    pub origin: Url,

    /// Cache generation; names the one live cache store.
    pub generation: GenerationId,

    /// Paths fetched and stored at install.
    pub precache: Vec<String>,

    /// URL substrings that skip the cache entirely.
    pub bypass_patterns: Vec<String>,

    /// Document served for failed navigations.
    pub offline_fallback: String,

    /// Background sync tag the worker reacts to.
    pub sync_tag: String,

    /// Page opened by the `explore` notification action.
    pub root_url: String,

    /// Activate right after install instead of waiting for old pages to close.
    pub skip_waiting: bool,

    /// Push notification contents.
    pub notification: NotificationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            script_url: "/service-worker.js".to_string(),
            origin: Url::parse("http://localhost:5000/").expect("static origin is valid"),
            generation: "mimesis-v1.2".parse().expect("static generation is valid"),
            precache: DEFAULT_PRECACHE.iter().map(|s| s.to_string()).collect(),
            bypass_patterns: DEFAULT_BYPASS.iter().map(|s| s.to_string()).collect(),
            offline_fallback: "/templates/index.html".to_string(),
            sync_tag: "background-sync".to_string(),
            root_url: "/".to_string(),
            skip_waiting: true,
            notification: NotificationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Default configuration for pages served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Replace the cache generation.
    pub fn with_generation(mut self, generation: &str) -> Result<Self> {
        self.generation = generation.parse()?;
        Ok(self)
    }

    /// Replace the precache manifest.
    pub fn with_precache<S: AsRef<str>>(mut self, paths: &[S]) -> Self {
        self.precache = paths.iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    /// Choose whether install activates immediately.
    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    /// Replace the offline fallback document.
    pub fn with_offline_fallback(mut self, path: &str) -> Self {
        self.offline_fallback = path.to_string();
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading worker config");
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.precache.is_empty() {
            return Err(ServiceWorkerError::Config(
                "precache manifest is empty".to_string(),
            ));
        }

        self.script()?;
        self.manifest_urls()?;
        self.fallback_url()?;
        self.root()?;

        if !self.precache.iter().any(|p| p == &self.offline_fallback) {
            warn!(
                fallback = %self.offline_fallback,
                "Offline fallback is not precached; failed navigations may get no response"
            );
        }

        Ok(())
    }

    /// Resolve a path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::Config(format!("cannot resolve {path:?}: {e}")))
    }

    /// Absolute worker script URL.
    pub fn script(&self) -> Result<Url> {
        self.resolve(&self.script_url)
    }

    /// Absolute precache URLs, in manifest order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.precache.iter().map(|p| self.resolve(p)).collect()
    }

    /// Absolute offline fallback URL.
    pub fn fallback_url(&self) -> Result<Url> {
        self.resolve(&self.offline_fallback)
    }

    /// Absolute root page URL.
    pub fn root(&self) -> Result<Url> {
        self.resolve(&self.root_url)
    }

    /// The bypass patterns as a matcher.
    pub fn bypass_list(&self) -> BypassList {
        BypassList::from_substrings(&self.bypass_patterns)
    }
}
