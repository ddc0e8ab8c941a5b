//! # Mimesis Service Worker
//!
//! Offline asset cache for the Mimesis web client.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache), activate (drop stale generations, claim pages)
//! - **Cache Storage**: one named store per cache generation
//! - **Fetch Interception**: cache-first with network fallback and opportunistic population
//! - **Offline Navigation**: fallback document for failed page loads
//! - **Background Sync / Push**: sync hook and push-triggered notifications
//!
//! ## Architecture
//!
//! ```text
//! RuntimeHandle ──(WorkerEvent)──► WorkerRuntime (single event loop)
//!                                       │
//!                                       └── ServiceWorkerHost::dispatch
//!                                               ├── Registration
//!                                               │     ├── installing ─┐
//!                                               │     ├── waiting    ├─ OfflineCacheWorker
//!                                               │     └── active    ─┘
//!                                               └── WorkerScope
//!                                                     ├── CacheStorage
//!                                                     │     └── Cache (generation) → CacheEntry
//!                                                     ├── Clients
//!                                                     ├── Notifications
//!                                                     └── Fetcher (network)
//! ```

use mimesis_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod events;
pub mod host;
pub mod lifecycle;
pub mod notification;
pub mod runtime;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, RequestKey};
pub use clients::{Client, ClientId, Clients};
pub use config::{GenerationId, NotificationActionConfig, NotificationConfig, WorkerConfig};
pub use events::{
    ClickOutcome, EventOutcome, FetchEvent, FetchOutcome, NotificationClickEvent, PushEvent,
    RegistrationOutcome, ResponseSource, SyncEvent, SyncOutcome, WorkerEvent,
};
pub use host::ServiceWorkerHost;
pub use lifecycle::{Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
pub use notification::{Notification, NotificationAction, NotificationId, Notifications};
pub use runtime::{RuntimeHandle, WorkerRuntime};
pub use worker::{
    ActivateOutcome, FetchDecision, InstallOutcome, OfflineCacheWorker, PassReason, WorkerScope,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker runtime stopped")]
    RuntimeClosed,
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
