//! Events delivered to the worker host and what handling them produced.

use bytes::Bytes;
use mimesis_net::{Request, Response};
use url::Url;

use crate::clients::ClientId;
use crate::config::WorkerConfig;
use crate::lifecycle::ServiceWorkerId;
use crate::notification::NotificationId;
use crate::worker::{ActivateOutcome, InstallOutcome};
use crate::Result;

// ==================== Events ====================

/// A request issued by a page.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Page that issued it, if known.
    pub client_id: Option<ClientId>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn from_client(request: Request, client_id: ClientId) -> Self {
        Self {
            request,
            client_id: Some(client_id),
        }
    }
}

/// A background sync trigger.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub tag: String,
}

/// A push message.
#[derive(Debug, Clone, Default)]
pub struct PushEvent {
    /// Raw payload; `None` when the push carried no data.
    pub data: Option<Bytes>,
}

impl PushEvent {
    pub fn text(text: &str) -> Self {
        Self {
            data: Some(Bytes::copy_from_slice(text.as_bytes())),
        }
    }
}

/// A click on a shown notification.
#[derive(Debug, Clone)]
pub struct NotificationClickEvent {
    pub notification: NotificationId,

    /// Action button clicked; `None` for the notification body.
    pub action: Option<String>,
}

/// Everything the event loop dispatches.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Page registered (or re-registered) the worker script.
    Register(Box<WorkerConfig>),
    /// A page loaded.
    OpenPage(Url),
    /// A page closed.
    ClosePage(ClientId),
    Fetch(FetchEvent),
    Sync(SyncEvent),
    Push(PushEvent),
    NotificationClick(NotificationClickEvent),
    Unregister,
}

impl WorkerEvent {
    /// Event kind, used as the dispatch key in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Register(_) => "register",
            WorkerEvent::OpenPage(_) => "open-page",
            WorkerEvent::ClosePage(_) => "close-page",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Sync(_) => "sync",
            WorkerEvent::Push(_) => "push",
            WorkerEvent::NotificationClick(_) => "notificationclick",
            WorkerEvent::Unregister => "unregister",
        }
    }
}

// ==================== Outcomes ====================

/// Result of registering a worker script.
#[derive(Debug)]
pub enum RegistrationOutcome {
    /// The same configuration is already installed; nothing ran.
    Unchanged,
    /// Installed and activated.
    Activated {
        worker: ServiceWorkerId,
        install: InstallOutcome,
        activate: ActivateOutcome,
    },
    /// Installed; waiting for the pages of the old version to close.
    Waiting {
        worker: ServiceWorkerId,
        install: InstallOutcome,
    },
    /// Install failed; the version was discarded.
    Rejected {
        worker: ServiceWorkerId,
        reason: String,
    },
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Stored entry of the current generation.
    Cache,
    /// Network, after a cache miss.
    Network,
    /// Offline fallback document after a failed navigation.
    OfflineFallback,
    /// Network, without the worker's caching logic.
    Passthrough,
}

/// A response delivered to the page.
#[derive(Debug)]
pub struct FetchOutcome {
    pub response: Response,
    pub source: ResponseSource,
}

/// Result of a background sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Pending actions were reconciled.
    Reconciled,
    /// Tag not handled by this worker.
    Ignored,
}

/// Result of a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Notification closed, nothing else.
    Closed,
    /// Notification closed and a window opened (or focused).
    OpenedWindow(ClientId),
}

/// What dispatching a [`WorkerEvent`] produced.
#[derive(Debug)]
pub enum EventOutcome {
    Registered(Result<RegistrationOutcome>),
    PageOpened(ClientId),
    /// Closing a page may let a waiting version activate.
    PageClosed(Option<ActivateOutcome>),
    Fetched(Result<FetchOutcome>),
    Synced(Result<SyncOutcome>),
    Pushed(Result<NotificationId>),
    Clicked(Result<ClickOutcome>),
    Unregistered(bool),
}
