//! Worker versions and the registration that holds them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::WorkerConfig;
use crate::worker::OfflineCacheWorker;

// ==================== Types ====================

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script evaluated, not yet installing.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// One version of the worker script.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Event handlers for this version.
    pub worker: Arc<OfflineCacheWorker>,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new worker version.
    pub fn new(script_url: Url, worker: OfflineCacheWorker) -> Self {
        Self {
            id: ServiceWorkerId::next(),
            script_url,
            state: ServiceWorkerState::Parsed,
            worker: Arc::new(worker),
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(worker = %self.id, from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// The configuration this version was built from.
    pub fn config(&self) -> &WorkerConfig {
        self.worker.config()
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl Registration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Default scope for a script: the directory it lives in.
    pub fn default_scope(script_url: &Url) -> Url {
        let mut scope = script_url.clone();
        let dir = script_url
            .path()
            .rsplit_once('/')
            .map(|(dir, _)| format!("{dir}/"))
            .unwrap_or_else(|| "/".to_string());
        scope.set_path(&dir);
        scope.set_query(None);
        scope.set_fragment(None);
        scope
    }

    /// Whether `url` falls under this registration.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether a non-redundant version already runs this exact config.
    pub fn has_version(&self, config: &WorkerConfig) -> bool {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .any(|w| w.config() == config)
    }

    /// Start installing a new version, displacing any previous installing one.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) {
        if let Some(mut previous) = self.installing.take() {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        worker.set_state(ServiceWorkerState::Installing);
        self.installing = Some(worker);
        self.last_update_check = Some(Instant::now());
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut displaced) = self.waiting.replace(worker) {
            displaced.set_state(ServiceWorkerState::Redundant);
        }
        self.waiting.as_ref().map(|w| w.id)
    }

    /// Discard the installing worker after a failed install.
    pub fn install_failed(&mut self, error: impl Into<String>) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error.into());
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Move the waiting worker to activating; the old active becomes redundant.
    pub fn begin_activation(&mut self) -> Option<&ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        if let Some(mut old) = self.active.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }

        self.active = Some(worker);
        self.active.as_ref()
    }

    /// Mark the activating worker as activated.
    pub fn finish_activation(&mut self) {
        if let Some(worker) = self.active.as_mut() {
            if worker.state == ServiceWorkerState::Activating {
                worker.set_state(ServiceWorkerState::Activated);
            }
        }
    }

    /// Unregister (mark every version redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}
