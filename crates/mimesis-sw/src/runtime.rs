//! Single event loop for the worker host.
//!
//! Events are queued on a channel and handled strictly one at a time. A
//! handler's future is driven to completion before the next event is
//! received, so an install that is still fetching cannot be overtaken by the
//! activate it gates.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::ClientId;
use crate::config::WorkerConfig;
use crate::events::{
    ClickOutcome, EventOutcome, FetchEvent, FetchOutcome, NotificationClickEvent, PushEvent,
    RegistrationOutcome, SyncEvent, SyncOutcome, WorkerEvent,
};
use crate::host::ServiceWorkerHost;
use crate::notification::NotificationId;
use crate::worker::ActivateOutcome;
use crate::{Result, ServiceWorkerError};

type Envelope = (WorkerEvent, oneshot::Sender<EventOutcome>);

/// Owns the host and drains the event queue.
pub struct WorkerRuntime {
    host: ServiceWorkerHost,
    rx: mpsc::Receiver<Envelope>,
}

impl WorkerRuntime {
    /// Create a runtime with room for `capacity` queued events.
    pub fn new(host: ServiceWorkerHost, capacity: usize) -> (Self, RuntimeHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { host, rx }, RuntimeHandle { tx })
    }

    /// Run the host on its own task.
    pub fn spawn(host: ServiceWorkerHost) -> (RuntimeHandle, JoinHandle<ServiceWorkerHost>) {
        let (runtime, handle) = Self::new(host, 64);
        (handle, tokio::spawn(runtime.run()))
    }

    /// Handle events until every [`RuntimeHandle`] is dropped, then hand the
    /// host back.
    pub async fn run(mut self) -> ServiceWorkerHost {
        info!("Worker runtime started");
        while let Some((event, reply)) = self.rx.recv().await {
            let kind = event.kind();
            let outcome = self.host.dispatch(event).await;
            if reply.send(outcome).is_err() {
                debug!(event = kind, "Caller went away before the reply");
            }
        }
        info!("Worker runtime stopped");
        self.host
    }
}

/// Cloneable sender side of a [`WorkerRuntime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::Sender<Envelope>,
}

impl RuntimeHandle {
    /// Queue an event and wait for it to be handled.
    pub async fn send(&self, event: WorkerEvent) -> Result<EventOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((event, reply_tx))
            .await
            .map_err(|_| ServiceWorkerError::RuntimeClosed)?;
        reply_rx.await.map_err(|_| ServiceWorkerError::RuntimeClosed)
    }

    pub async fn register(&self, config: WorkerConfig) -> Result<RegistrationOutcome> {
        match self.send(WorkerEvent::Register(Box::new(config))).await? {
            EventOutcome::Registered(result) => result,
            other => Err(unexpected("register", other)),
        }
    }

    pub async fn open_page(&self, url: Url) -> Result<ClientId> {
        match self.send(WorkerEvent::OpenPage(url)).await? {
            EventOutcome::PageOpened(id) => Ok(id),
            other => Err(unexpected("open-page", other)),
        }
    }

    pub async fn close_page(&self, id: ClientId) -> Result<Option<ActivateOutcome>> {
        match self.send(WorkerEvent::ClosePage(id)).await? {
            EventOutcome::PageClosed(activated) => Ok(activated),
            other => Err(unexpected("close-page", other)),
        }
    }

    pub async fn fetch(&self, event: FetchEvent) -> Result<FetchOutcome> {
        match self.send(WorkerEvent::Fetch(event)).await? {
            EventOutcome::Fetched(result) => result,
            other => Err(unexpected("fetch", other)),
        }
    }

    pub async fn sync(&self, tag: &str) -> Result<SyncOutcome> {
        let event = SyncEvent {
            tag: tag.to_string(),
        };
        match self.send(WorkerEvent::Sync(event)).await? {
            EventOutcome::Synced(result) => result,
            other => Err(unexpected("sync", other)),
        }
    }

    pub async fn push(&self, event: PushEvent) -> Result<NotificationId> {
        match self.send(WorkerEvent::Push(event)).await? {
            EventOutcome::Pushed(result) => result,
            other => Err(unexpected("push", other)),
        }
    }

    pub async fn notification_click(&self, event: NotificationClickEvent) -> Result<ClickOutcome> {
        match self.send(WorkerEvent::NotificationClick(event)).await? {
            EventOutcome::Clicked(result) => result,
            other => Err(unexpected("notificationclick", other)),
        }
    }

    pub async fn unregister(&self) -> Result<bool> {
        match self.send(WorkerEvent::Unregister).await? {
            EventOutcome::Unregistered(done) => Ok(done),
            other => Err(unexpected("unregister", other)),
        }
    }
}

fn unexpected(event: &str, outcome: EventOutcome) -> ServiceWorkerError {
    warn!(event, ?outcome, "Mismatched event outcome");
    ServiceWorkerError::StateError(format!("unexpected outcome for {event}: {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimesis_net::{MemoryOrigin, Request};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runtime_returns_host_when_handles_drop() {
        let origin = Arc::new(MemoryOrigin::parse("https://mimesis.test/").unwrap());
        let (handle, task) = WorkerRuntime::spawn(ServiceWorkerHost::new(origin));

        let page = handle
            .open_page(Url::parse("https://mimesis.test/").unwrap())
            .await
            .unwrap();
        drop(handle);

        let host = task.await.unwrap();
        assert!(host.scope().clients.read().await.get(&page).is_some());
    }

    #[tokio::test]
    async fn test_events_are_handled_in_order() {
        let origin = Arc::new(
            MemoryOrigin::parse("https://mimesis.test/")
                .unwrap()
                .serve("/", "home"),
        );
        let config = WorkerConfig::for_origin(origin.origin().clone())
            .with_generation("app-v1")
            .unwrap()
            .with_precache(&["/"])
            .with_offline_fallback("/");
        let (handle, _task) = WorkerRuntime::spawn(ServiceWorkerHost::new(origin.clone()));

        // Queued back to back; the fetch must see the finished install.
        let register = handle.register(config);
        let fetch = handle.fetch(FetchEvent::new(Request::get(
            Url::parse("https://mimesis.test/").unwrap(),
        )));
        let (registered, fetched) = tokio::join!(register, fetch);

        assert!(matches!(registered.unwrap(), RegistrationOutcome::Activated { .. }));
        let fetched = fetched.unwrap();
        assert_eq!(fetched.source, crate::ResponseSource::Cache);
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test]
    async fn test_closed_runtime_errors() {
        let origin = Arc::new(MemoryOrigin::parse("https://mimesis.test/").unwrap());
        let (runtime, handle) = WorkerRuntime::new(ServiceWorkerHost::new(origin), 4);
        drop(runtime);

        assert!(matches!(
            handle.unregister().await,
            Err(ServiceWorkerError::RuntimeClosed)
        ));
    }
}
