//! Clients API: the pages a worker can see and control.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::lifecycle::ServiceWorkerId;

/// Identifier of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(String);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A window client.
#[derive(Debug, Clone, Serialize)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Whether focused.
    pub focused: bool,

    /// Worker version currently controlling this client.
    #[serde(skip)]
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    pub fn focus(&mut self) {
        self.focused = true;
    }

    /// Point the window at a new page.
    pub fn navigate(&mut self, url: Url) {
        self.url = url;
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Get a client by ID for mutation.
    pub fn get_mut(&mut self, id: &ClientId) -> Option<&mut Client> {
        self.clients.get_mut(id)
    }

    /// Track a newly loaded window.
    pub fn add_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(
            id.clone(),
            Client {
                id: id.clone(),
                url,
                focused: false,
                controller,
            },
        );
        id
    }

    /// Open a window at `url`, or focus one that is already there.
    pub fn open_window(&mut self, url: Url) -> ClientId {
        if let Some(existing) = self.clients.values_mut().find(|c| c.url == url) {
            existing.focus();
            debug!(client = %existing.id, url = %url, "Focused existing window");
            return existing.id.clone();
        }

        let id = self.add_window(url.clone(), None);
        if let Some(client) = self.clients.get_mut(&id) {
            client.focus();
        }
        debug!(client = %id, url = %url, "Opened window");
        id
    }

    /// Make `worker` the controller of every client. Returns how many changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        claimed
    }

    /// Drop every client's controller. Returns how many were controlled.
    pub fn release_all(&mut self) -> usize {
        self.clients
            .values_mut()
            .filter_map(|c| c.controller.take())
            .count()
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
