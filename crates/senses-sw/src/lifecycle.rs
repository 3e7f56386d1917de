//! Cache generation lifecycle: install, activate, and control messages.

use futures::future::{join_all, try_join_all};
use senses_core::EvictionPolicy;
use senses_net::{Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::worker::{OfflineWorker, ServiceWorkerState};
use crate::ServiceWorkerError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Generation that was populated.
    pub generation: String,
    /// Entries now in the generation cache.
    pub cached: usize,
    /// Whether the worker asked to take control immediately.
    pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    /// Stale caches that were deleted.
    pub evicted: Vec<String>,
    /// Stale caches whose deletion failed (best-effort policy only).
    pub failed: Vec<String>,
    /// Whether open pages were claimed.
    pub claimed: bool,
}

/// Control messages pages can post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Take control now, even with older pages open.
    SkipWaiting,
    /// Reply with the generation identifier.
    GetVersion,
}

/// Reply to [`WorkerMessage::GetVersion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

/// What a message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Skip-waiting was requested.
    SkipWaiting,
    /// The version was sent on the reply channel.
    VersionSent(String),
    /// Unknown payload, or nowhere to reply.
    Ignored,
}

impl OfflineWorker {
    /// Install: populate the generation cache, all or nothing.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.transition(&[ServiceWorkerState::Parsed], ServiceWorkerState::Installing)
            .await?;
        info!(worker = self.id.raw(), generation = %self.config.generation, "Installing");

        let cached = match self.precache().await {
            Ok(cached) => cached,
            Err(err) => {
                error!(
                    worker = self.id.raw(),
                    generation = %self.config.generation,
                    error = %err,
                    "Install failed"
                );
                self.mark_redundant().await;
                return Err(ServiceWorkerError::InstallFailed(err.to_string()));
            }
        };

        self.set_state(ServiceWorkerState::Installed).await;
        if self.config.skip_waiting_on_install {
            self.request_skip_waiting();
        }
        info!(worker = self.id.raw(), cached, "All files cached");

        Ok(InstallReport {
            generation: self.config.generation.clone(),
            cached,
            skip_waiting: self.skip_waiting_requested(),
        })
    }

    /// Activate: drop every cache outside the allow-list, then claim pages.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.transition(&[ServiceWorkerState::Installed], ServiceWorkerState::Activating)
            .await?;
        info!(worker = self.id.raw(), "Activating");

        let (evicted, failed) = match self.evict_stale().await {
            Ok(result) => result,
            Err(err) => {
                error!(worker = self.id.raw(), error = %err, "Activation aborted");
                self.set_state(ServiceWorkerState::Installed).await;
                return Err(ServiceWorkerError::ActivationFailed(err.to_string()));
            }
        };

        self.set_state(ServiceWorkerState::Activated).await;
        self.claim_clients();
        info!(worker = self.id.raw(), evicted = evicted.len(), "Activated");

        Ok(ActivationReport {
            evicted,
            failed,
            claimed: self.clients_claimed(),
        })
    }

    /// Handle a posted message. `reply` is the one-shot response port.
    pub fn handle_message(
        &self,
        payload: JsonValue,
        reply: Option<oneshot::Sender<JsonValue>>,
    ) -> MessageOutcome {
        let message = match serde_json::from_value::<WorkerMessage>(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "Ignoring unrecognized message");
                return MessageOutcome::Ignored;
            }
        };

        match message {
            WorkerMessage::SkipWaiting => {
                info!(worker = self.id.raw(), "Skip waiting requested");
                self.request_skip_waiting();
                MessageOutcome::SkipWaiting
            }
            WorkerMessage::GetVersion => {
                let Some(port) = reply else {
                    warn!("GET_VERSION without a reply port");
                    return MessageOutcome::Ignored;
                };
                let version = self.config.generation.clone();
                let body = serde_json::json!({ "version": &version });
                if port.send(body).is_err() {
                    debug!("Version reply dropped, requester went away");
                }
                MessageOutcome::VersionSent(version)
            }
        }
    }

    // ---------- population ----------

    /// Open the generation cache and populate it; remove it again if this
    /// attempt created it and population failed.
    async fn precache(&self) -> Result<usize, ServiceWorkerError> {
        let generation = &self.config.generation;
        let created = self.caches.open(generation).await?;

        if let Err(err) = self.populate().await {
            if created {
                if let Err(cleanup) = self.caches.delete(generation).await {
                    warn!(cache = %generation, error = %cleanup, "Could not remove failed generation");
                }
            }
            return Err(err);
        }

        self.caches.entry_count(generation).await
    }

    /// Fetch every manifest URL and store the responses in the generation
    /// cache. Nothing is written unless every fetch succeeds.
    pub(crate) async fn populate(&self) -> Result<usize, ServiceWorkerError> {
        debug!(
            generation = %self.config.generation,
            urls = self.precache_urls.len(),
            "Caching application files"
        );

        let fetches = self
            .precache_urls
            .iter()
            .cloned()
            .map(|url| self.fetch_for_precache(url));
        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        self.caches.put_all(&self.config.generation, entries).await?;
        Ok(count)
    }

    async fn fetch_for_precache(&self, url: Url) -> Result<(Request, Response), ServiceWorkerError> {
        let request = Request::get(url);
        let response = self.fetcher.fetch(&request).await.map_err(|e| {
            ServiceWorkerError::NetworkError(format!("{}: {e}", request.url))
        })?;

        if !response.ok() || response.is_error() {
            return Err(ServiceWorkerError::NetworkError(format!(
                "{} returned status {}",
                request.url, response.status
            )));
        }
        Ok((request, response))
    }

    // ---------- eviction ----------

    async fn evict_stale(&self) -> Result<(Vec<String>, Vec<String>), ServiceWorkerError> {
        let allow = self.config.allow_list();
        let stale: Vec<String> = self
            .caches
            .keys()
            .await?
            .into_iter()
            .filter(|name| !allow.contains(&name.as_str()))
            .collect();

        let deletions = stale.into_iter().map(|name| async move {
            let result = self.caches.delete(&name).await;
            (name, result)
        });

        let mut evicted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in join_all(deletions).await {
            match result {
                Ok(_) => {
                    info!(cache = %name, "Deleted old cache");
                    evicted.push(name);
                }
                Err(err) => match self.config.eviction_policy {
                    EvictionPolicy::BestEffort => {
                        warn!(cache = %name, error = %err, "Could not delete old cache");
                        failed.push(name);
                    }
                    EvictionPolicy::Abort => {
                        return Err(ServiceWorkerError::CacheError(format!(
                            "deleting {name}: {err}"
                        )));
                    }
                },
            }
        }
        Ok((evicted, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStorage, MemoryCacheStorage};
    use async_trait::async_trait;
    use senses_core::WorkerConfig;
    use senses_net::{Fetcher, NetError};
    use std::sync::Arc;

    /// Serves every URL with its own path as body, except the listed paths.
    struct Site {
        missing: Vec<&'static str>,
    }

    #[async_trait]
    impl Fetcher for Site {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            let path = request.url.path().to_string();
            if self.missing.contains(&path.as_str()) {
                return Ok(Response::new(request.url.clone(), 404, "not found"));
            }
            Ok(Response::new(request.url.clone(), 200, path))
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_origin(Url::parse("https://senses.example/").unwrap())
            .with_generation("v1.0.0")
            .with_runtime_cache("runtime-v1")
            .with_precache(["/", "/index.html", "/pic/kant.jpg"])
    }

    fn worker_with(
        config: WorkerConfig,
        missing: Vec<&'static str>,
    ) -> (OfflineWorker, Arc<MemoryCacheStorage>) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let worker =
            OfflineWorker::new(config, storage.clone(), Arc::new(Site { missing })).unwrap();
        (worker, storage)
    }

    #[tokio::test]
    async fn test_install_populates_generation() {
        let (worker, storage) = worker_with(config(), vec![]);

        let report = worker.install().await.unwrap();

        assert_eq!(report.generation, "v1.0.0");
        assert_eq!(report.cached, 3);
        assert!(report.skip_waiting);
        assert_eq!(worker.state().await, ServiceWorkerState::Installed);
        assert_eq!(storage.entry_count("v1.0.0").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_install_without_skip_waiting() {
        let (worker, _) = worker_with(config().with_skip_waiting_on_install(false), vec![]);
        let report = worker.install().await.unwrap();
        assert!(!report.skip_waiting);
        assert!(!worker.skip_waiting_requested());
    }

    #[tokio::test]
    async fn test_install_failure_leaves_no_generation() {
        let (worker, storage) = worker_with(config(), vec!["/pic/kant.jpg"]);

        let err = worker.install().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
        assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
        assert!(!storage.has("v1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_failure_keeps_existing_generation() {
        let (worker, storage) = worker_with(config(), vec!["/index.html"]);
        let root = Request::parse("https://senses.example/").unwrap();
        let old = Response::new(root.url.clone(), 200, "old root");
        storage.put("v1.0.0", &root, old).await.unwrap();

        assert!(worker.install().await.is_err());

        assert_eq!(storage.entry_count("v1.0.0").await.unwrap(), 1);
        let kept = storage.match_in("v1.0.0", &root).await.unwrap().unwrap();
        assert_eq!(&kept.body[..], b"old root");
    }

    #[tokio::test]
    async fn test_install_twice_is_state_error() {
        let (worker, _) = worker_with(config(), vec![]);
        worker.install().await.unwrap();
        assert!(matches!(
            worker.install().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_before_install_is_state_error() {
        let (worker, _) = worker_with(config(), vec![]);
        assert!(matches!(
            worker.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_evicts_and_claims() {
        let (worker, storage) = worker_with(config(), vec![]);
        storage.open("old-v0.9").await.unwrap();
        storage.open("runtime-v1").await.unwrap();
        worker.install().await.unwrap();

        let report = worker.activate().await.unwrap();

        assert_eq!(report.evicted, vec!["old-v0.9".to_string()]);
        assert!(report.failed.is_empty());
        assert!(report.claimed);
        assert!(worker.is_active().await);
        let mut names = storage.keys().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["runtime-v1", "v1.0.0"]);
    }

    #[tokio::test]
    async fn test_get_version_replies_on_port() {
        let (worker, _) = worker_with(config(), vec![]);
        let (tx, rx) = oneshot::channel();

        let outcome =
            worker.handle_message(serde_json::json!({ "type": "GET_VERSION" }), Some(tx));

        assert_eq!(outcome, MessageOutcome::VersionSent("v1.0.0".to_string()));
        let reply: VersionReply = serde_json::from_value(rx.await.unwrap()).unwrap();
        assert_eq!(reply.version, "v1.0.0");
    }

    #[tokio::test]
    async fn test_get_version_without_port_is_ignored() {
        let (worker, _) = worker_with(config(), vec![]);
        let outcome = worker.handle_message(serde_json::json!({ "type": "GET_VERSION" }), None);
        assert_eq!(outcome, MessageOutcome::Ignored);
    }

    #[test]
    fn test_skip_waiting_message() {
        let (worker, _) = worker_with(config(), vec![]);
        let outcome = worker.handle_message(serde_json::json!({ "type": "SKIP_WAITING" }), None);
        assert_eq!(outcome, MessageOutcome::SkipWaiting);
        assert!(worker.skip_waiting_requested());
    }

    #[test]
    fn test_unknown_messages_ignored() {
        let (worker, _) = worker_with(config(), vec![]);
        for payload in [
            serde_json::json!({ "type": "CLEAR_ALL" }),
            serde_json::json!("SKIP_WAITING"),
            serde_json::json!(null),
        ] {
            assert_eq!(worker.handle_message(payload, None), MessageOutcome::Ignored);
        }
        assert!(!worker.skip_waiting_requested());
    }

    #[test]
    fn test_message_wire_format() {
        let parsed: WorkerMessage =
            serde_json::from_str(r#"{ "type": "SKIP_WAITING" }"#).unwrap();
        assert_eq!(parsed, WorkerMessage::SkipWaiting);

        let reply = serde_json::to_string(&VersionReply {
            version: "v1.0.0".to_string(),
        })
        .unwrap();
        assert_eq!(reply, r#"{"version":"v1.0.0"}"#);
    }
}
