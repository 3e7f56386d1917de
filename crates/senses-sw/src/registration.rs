//! Host-side registration: the installing → waiting → active handoff.

use std::sync::Arc;

use senses_net::Request;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use url::Url;

use crate::lifecycle::{MessageOutcome, WorkerMessage};
use crate::router::FetchOutcome;
use crate::sync::SyncOutcome;
use crate::worker::{EventOutcome, OfflineWorker, ServiceWorkerState, WorkerEvent, WorkerId};
use crate::ServiceWorkerError;

/// Registration events for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A new worker started installing.
    UpdateFound { worker_id: WorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: WorkerId,
        new_state: ServiceWorkerState,
    },
    /// Pages are now controlled by this worker.
    ControllerChange { worker_id: WorkerId },
}

/// A worker registration for one scope.
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,

    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl ServiceWorkerRegistration {
    /// Create an empty registration.
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                installing: None,
                waiting: None,
                active: None,
                event_tx,
            },
            event_rx,
        )
    }

    /// Installing worker.
    pub fn installing(&self) -> Option<&Arc<OfflineWorker>> {
        self.installing.as_ref()
    }

    /// Waiting worker (installed but not active).
    pub fn waiting(&self) -> Option<&Arc<OfflineWorker>> {
        self.waiting.as_ref()
    }

    /// Active worker.
    pub fn active(&self) -> Option<&Arc<OfflineWorker>> {
        self.active.as_ref()
    }

    /// Install a new worker version.
    ///
    /// A failed install leaves the current active worker in charge. A
    /// successful one activates right away if it asked to skip waiting or
    /// nothing is active yet; otherwise it waits.
    pub async fn register(&mut self, worker: OfflineWorker) -> Result<(), ServiceWorkerError> {
        let worker = Arc::new(worker);
        let worker_id = worker.id();
        self.installing = Some(Arc::clone(&worker));
        self.emit(RegistrationEvent::UpdateFound { worker_id });

        let installed = worker.dispatch(WorkerEvent::Install).await;
        self.installing = None;
        if let Err(err) = installed {
            warn!(scope = %self.scope, error = %err, "New worker failed to install");
            self.emit_state(&worker).await;
            return Err(err);
        }
        self.emit_state(&worker).await;

        if let Some(previous) = self.waiting.replace(Arc::clone(&worker)) {
            previous.mark_redundant().await;
            self.emit_state(&previous).await;
        }

        if self.active.is_none() || worker.skip_waiting_requested() {
            self.activate_waiting().await?;
        } else {
            info!(scope = %self.scope, worker = worker_id.raw(), "Worker waiting");
        }
        Ok(())
    }

    /// Promote the waiting worker to active.
    pub async fn activate_waiting(&mut self) -> Result<(), ServiceWorkerError> {
        let worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;

        if let Err(err) = worker.dispatch(WorkerEvent::Activate).await {
            self.waiting = Some(worker);
            return Err(err);
        }

        if let Some(previous) = self.active.replace(Arc::clone(&worker)) {
            previous.mark_redundant().await;
            self.emit_state(&previous).await;
        }
        self.emit_state(&worker).await;
        self.emit(RegistrationEvent::ControllerChange {
            worker_id: worker.id(),
        });
        info!(scope = %self.scope, version = worker.version(), "Worker controlling pages");
        Ok(())
    }

    /// Post a message from a page.
    ///
    /// `SKIP_WAITING` goes to the waiting worker when there is one and
    /// promotes it. Everything else goes to the active worker, the page's
    /// controller. Returns whatever the worker sent back on the reply port.
    pub async fn post_message(
        &mut self,
        payload: JsonValue,
    ) -> Result<Option<JsonValue>, ServiceWorkerError> {
        let skip_waiting = matches!(
            WorkerMessage::deserialize(&payload),
            Ok(WorkerMessage::SkipWaiting)
        );
        let (target, is_waiting) = match (&self.waiting, &self.active) {
            (Some(waiting), _) if skip_waiting => (Arc::clone(waiting), true),
            (_, Some(active)) => (Arc::clone(active), false),
            (Some(waiting), None) => (Arc::clone(waiting), true),
            (None, None) => {
                return Err(ServiceWorkerError::NotFound(format!(
                    "no worker for {}",
                    self.scope
                )))
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = target
            .dispatch(WorkerEvent::Message {
                payload,
                reply: Some(reply_tx),
            })
            .await?;

        if is_waiting && matches!(outcome, EventOutcome::Message(MessageOutcome::SkipWaiting)) {
            self.activate_waiting().await?;
        }

        Ok(reply_rx.await.ok())
    }

    /// Route a page request through the active worker.
    pub async fn fetch(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        let Some(active) = &self.active else {
            return Ok(FetchOutcome::Passthrough);
        };
        match active.dispatch(WorkerEvent::Fetch(request)).await? {
            EventOutcome::Fetch(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    /// Deliver a `sync` event to the active worker.
    pub async fn sync(&self, tag: &str) -> Result<SyncOutcome, ServiceWorkerError> {
        self.deliver_sync(WorkerEvent::Sync(tag.to_string())).await
    }

    /// Deliver a `periodicsync` event to the active worker.
    pub async fn periodic_sync(&self, tag: &str) -> Result<SyncOutcome, ServiceWorkerError> {
        self.deliver_sync(WorkerEvent::PeriodicSync(tag.to_string()))
            .await
    }

    /// Unregister (mark every worker redundant).
    pub async fn unregister(&mut self) {
        let workers = [
            self.installing.take(),
            self.waiting.take(),
            self.active.take(),
        ];
        for worker in workers.into_iter().flatten() {
            worker.mark_redundant().await;
            self.emit_state(&worker).await;
        }
    }

    async fn deliver_sync(&self, event: WorkerEvent) -> Result<SyncOutcome, ServiceWorkerError> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("no active worker for {}", self.scope)))?;
        match active.dispatch(event).await? {
            EventOutcome::Sync(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    fn emit(&self, event: RegistrationEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn emit_state(&self, worker: &OfflineWorker) {
        self.emit(RegistrationEvent::StateChange {
            worker_id: worker.id(),
            new_state: worker.state().await,
        });
    }
}

fn unexpected(outcome: EventOutcome) -> ServiceWorkerError {
    ServiceWorkerError::StateError(format!("unexpected event outcome: {outcome:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStorage, MemoryCacheStorage};
    use crate::router::ResponseSource;
    use async_trait::async_trait;
    use senses_core::WorkerConfig;
    use senses_net::{Fetcher, NetError, Response};

    /// Serves everything except paths starting with `/broken`.
    struct Site;

    #[async_trait]
    impl Fetcher for Site {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            if request.url.path().starts_with("/broken") {
                return Err(NetError::RequestFailed("connection reset".to_string()));
            }
            Ok(Response::new(request.url.clone(), 200, request.url.path().to_string()))
        }
    }

    fn scope() -> Url {
        Url::parse("https://senses.example/").unwrap()
    }

    fn worker(storage: &Arc<MemoryCacheStorage>, generation: &str, manifest: &[&str], skip: bool) -> OfflineWorker {
        let config = WorkerConfig::default()
            .with_origin(scope())
            .with_generation(generation)
            .with_runtime_cache("runtime-v1")
            .with_precache(manifest.iter().copied())
            .with_skip_waiting_on_install(skip);
        OfflineWorker::new(config, storage.clone(), Arc::new(Site)).unwrap()
    }

    #[tokio::test]
    async fn test_first_worker_activates() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, mut events) = ServiceWorkerRegistration::new(scope());

        registration
            .register(worker(&storage, "v1.0.0", &["/"], false))
            .await
            .unwrap();

        let active = registration.active().unwrap();
        assert!(active.is_active().await);
        assert!(registration.waiting().is_none());
        assert!(registration.installing().is_none());

        assert!(matches!(events.recv().await, Some(RegistrationEvent::UpdateFound { .. })));
        let mut saw_controller = false;
        while let Ok(event) = events.try_recv() {
            saw_controller |= matches!(event, RegistrationEvent::ControllerChange { .. });
        }
        assert!(saw_controller);
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, _events) = ServiceWorkerRegistration::new(scope());
        registration
            .register(worker(&storage, "v1.0.0", &["/index.html"], true))
            .await
            .unwrap();

        let result = registration
            .register(worker(&storage, "v1.1.0", &["/index.html", "/broken.png"], true))
            .await;

        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert_eq!(registration.active().unwrap().version(), "v1.0.0");
        assert!(!storage.has("v1.1.0").await.unwrap());

        let outcome = registration
            .fetch(Request::parse("https://senses.example/index.html").unwrap())
            .await
            .unwrap();
        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
    }

    #[tokio::test]
    async fn test_skip_waiting_on_install_replaces_active() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, _events) = ServiceWorkerRegistration::new(scope());
        registration
            .register(worker(&storage, "v1.0.0", &["/"], true))
            .await
            .unwrap();
        let old = Arc::clone(registration.active().unwrap());

        registration
            .register(worker(&storage, "v1.1.0", &["/"], true))
            .await
            .unwrap();

        assert_eq!(registration.active().unwrap().version(), "v1.1.0");
        assert_eq!(old.state().await, ServiceWorkerState::Redundant);
        assert!(!storage.has("v1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_skip_waiting_message_promotes_waiting_worker() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, _events) = ServiceWorkerRegistration::new(scope());
        registration
            .register(worker(&storage, "v1.0.0", &["/"], false))
            .await
            .unwrap();
        registration
            .register(worker(&storage, "v1.1.0", &["/"], false))
            .await
            .unwrap();

        assert_eq!(registration.active().unwrap().version(), "v1.0.0");
        assert_eq!(registration.waiting().unwrap().version(), "v1.1.0");

        let reply = registration
            .post_message(serde_json::json!({ "type": "SKIP_WAITING" }))
            .await
            .unwrap();

        assert!(reply.is_none());
        assert!(registration.waiting().is_none());
        assert_eq!(registration.active().unwrap().version(), "v1.1.0");
    }

    #[tokio::test]
    async fn test_get_version_through_registration() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, _events) = ServiceWorkerRegistration::new(scope());
        registration
            .register(worker(&storage, "v1.0.0", &["/"], true))
            .await
            .unwrap();

        let reply = registration
            .post_message(serde_json::json!({ "type": "GET_VERSION" }))
            .await
            .unwrap();

        assert_eq!(reply, Some(serde_json::json!({ "version": "v1.0.0" })));
    }

    #[tokio::test]
    async fn test_get_version_reports_controller_while_update_waits() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, _events) = ServiceWorkerRegistration::new(scope());
        registration
            .register(worker(&storage, "v1.0.0", &["/"], false))
            .await
            .unwrap();
        registration
            .register(worker(&storage, "v1.1.0", &["/"], false))
            .await
            .unwrap();

        let reply = registration
            .post_message(serde_json::json!({ "type": "GET_VERSION" }))
            .await
            .unwrap();

        assert_eq!(reply, Some(serde_json::json!({ "version": "v1.0.0" })));
        assert_eq!(registration.waiting().unwrap().version(), "v1.1.0");
        assert!(!registration.waiting().unwrap().is_active().await);
    }

    #[tokio::test]
    async fn test_fetch_without_active_passes_through() {
        let (registration, _events) = ServiceWorkerRegistration::new(scope());
        let outcome = registration
            .fetch(Request::parse("https://senses.example/").unwrap())
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough));
        assert!(registration.sync("sync-data").await.is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let (mut registration, _events) = ServiceWorkerRegistration::new(scope());
        registration
            .register(worker(&storage, "v1.0.0", &["/"], true))
            .await
            .unwrap();
        let active = Arc::clone(registration.active().unwrap());

        registration.unregister().await;

        assert!(registration.active().is_none());
        assert_eq!(active.state().await, ServiceWorkerState::Redundant);
    }
}
