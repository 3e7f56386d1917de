//! The worker instance and its event dispatch.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use senses_core::WorkerConfig;
use senses_net::{Fetcher, OriginClassifier, Request};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::debug;
use url::Url;

use crate::cache::CacheStorage;
use crate::lifecycle::{ActivationReport, InstallReport, MessageOutcome};
use crate::router::FetchOutcome;
use crate::sync::SyncOutcome;
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, no lifecycle event yet.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed or replaced.
    Redundant,
}

/// Signals delivered by the host.
#[derive(Debug)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Message {
        payload: JsonValue,
        reply: Option<oneshot::Sender<JsonValue>>,
    },
    Sync(String),
    PeriodicSync(String),
}

/// What handling a [`WorkerEvent`] produced.
#[derive(Debug)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated(ActivationReport),
    Fetch(FetchOutcome),
    Message(MessageOutcome),
    Sync(SyncOutcome),
}

// ==================== Worker ====================

/// One version of the offline worker.
///
/// All configuration arrives through [`WorkerConfig`], so independent
/// instances can share a process (and a cache storage).
pub struct OfflineWorker {
    pub(crate) id: WorkerId,
    pub(crate) config: WorkerConfig,
    pub(crate) classifier: OriginClassifier,
    pub(crate) precache_urls: Vec<Url>,
    pub(crate) fallback_url: Url,
    pub(crate) caches: Arc<dyn CacheStorage>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    state: RwLock<ServiceWorkerState>,
    skip_waiting: AtomicBool,
    clients_claimed: AtomicBool,
    background: Mutex<JoinSet<()>>,
}

impl OfflineWorker {
    /// Create a worker over the given storage and network.
    pub fn new(
        config: WorkerConfig,
        caches: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let precache_urls = config.precache_urls()?;
        let fallback_url = config.fallback_url()?;
        let classifier =
            OriginClassifier::new(&config.origin).allow_hosts(config.font_hosts.iter());

        let id = WorkerId::new();
        debug!(
            worker = id.raw(),
            generation = %config.generation,
            manifest_len = precache_urls.len(),
            "Worker created"
        );

        Ok(Self {
            id,
            config,
            classifier,
            precache_urls,
            fallback_url,
            caches,
            fetcher,
            state: RwLock::new(ServiceWorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            clients_claimed: AtomicBool::new(false),
            background: Mutex::new(JoinSet::new()),
        })
    }

    /// Worker ID.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Active generation identifier.
    pub fn version(&self) -> &str {
        &self.config.generation
    }

    /// Current state.
    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Check if active.
    pub async fn is_active(&self) -> bool {
        self.state().await == ServiceWorkerState::Activated
    }

    /// Whether the worker asked to skip the waiting phase.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Whether the worker claimed the open pages.
    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    /// Handle one host signal.
    pub async fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => self.install().await.map(EventOutcome::Installed),
            WorkerEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            WorkerEvent::Fetch(request) => self.handle_fetch(request).await.map(EventOutcome::Fetch),
            WorkerEvent::Message { payload, reply } => {
                self.ensure_not_redundant().await?;
                Ok(EventOutcome::Message(self.handle_message(payload, reply)))
            }
            WorkerEvent::Sync(tag) => self.handle_sync(&tag).await.map(EventOutcome::Sync),
            WorkerEvent::PeriodicSync(tag) => {
                self.handle_periodic_sync(&tag).await.map(EventOutcome::Sync)
            }
        }
    }

    /// Wait for all detached background work (cache refreshes) to finish.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.background.lock().await);
        while tasks.join_next().await.is_some() {}
    }

    // ---------- crate-internal ----------

    /// Move to `to` if the current state is one of `from`.
    pub(crate) async fn transition(
        &self,
        from: &[ServiceWorkerState],
        to: ServiceWorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.write().await;
        if !from.contains(&*state) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {:?} to {:?}",
                *state, to
            )));
        }
        debug!(worker = self.id.raw(), from = ?*state, to = ?to, "State change");
        *state = to;
        Ok(())
    }

    pub(crate) async fn set_state(&self, to: ServiceWorkerState) {
        let mut state = self.state.write().await;
        debug!(worker = self.id.raw(), from = ?*state, to = ?to, "State change");
        *state = to;
    }

    pub(crate) async fn ensure_not_redundant(&self) -> Result<(), ServiceWorkerError> {
        if self.state().await == ServiceWorkerState::Redundant {
            return Err(ServiceWorkerError::StateError(
                "worker is redundant".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) async fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant).await;
    }

    pub(crate) fn request_skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn claim_clients(&self) {
        self.clients_claimed.store(true, Ordering::SeqCst);
    }

    /// Run work detached from the current event.
    ///
    /// Finished tasks are reaped first so the set only holds work still in
    /// flight.
    pub(crate) async fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.background.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    #[cfg(test)]
    pub(crate) async fn background_len(&self) -> usize {
        self.background.lock().await.len()
    }
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("generation", &self.config.generation)
            .field("origin", &self.config.origin.as_str())
            .finish_non_exhaustive()
    }
}
