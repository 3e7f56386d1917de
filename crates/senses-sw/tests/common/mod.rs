//! Shared fixtures: a scripted network and an instrumented cache storage.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use senses_core::WorkerConfig;
use senses_net::{Fetcher, NetError, Request, Response};
use senses_sw::{CacheStorage, MemoryCacheStorage, OfflineWorker, ServiceWorkerError};
use url::Url;

pub const ORIGIN: &str = "https://senses.example/";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("senses_sw=debug")
        .with_test_writer()
        .try_init();
}

pub fn url(path: &str) -> String {
    format!("https://senses.example{path}")
}

pub fn config(manifest: &[&str]) -> WorkerConfig {
    WorkerConfig::default()
        .with_origin(Url::parse(ORIGIN).unwrap())
        .with_generation("v1.0.0")
        .with_runtime_cache("runtime-v1")
        .with_precache(manifest.iter().copied())
}

// ==================== Network ====================

/// Scripted network. Unrouted URLs fail like an unreachable host.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, status: u16, body: &str) {
        let response = Response::new(Url::parse(url).unwrap(), status, body.to_string());
        self.serve_response(url, response);
    }

    pub fn serve_response(&self, url: &str, response: Response) {
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        self.calls.lock().unwrap().push(key.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network unreachable".to_string()));
        }
        self.routes
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| NetError::RequestFailed(format!("could not resolve {key}")))
    }
}

// ==================== Storage ====================

/// [`MemoryCacheStorage`] that counts every call and can refuse deletions
/// or single-entry writes.
#[derive(Default)]
pub struct InstrumentedStorage {
    inner: MemoryCacheStorage,
    ops: AtomicUsize,
    undeletable: Mutex<Vec<String>>,
    read_only: AtomicBool,
}

impl InstrumentedStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn ops(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    pub fn refuse_delete(&self, name: &str) {
        self.undeletable.lock().unwrap().push(name.to_string());
    }

    /// Make every `put` fail; `put_all` is unaffected.
    pub fn refuse_put(&self, refuse: bool) {
        self.read_only.store(refuse, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.ops.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn sorted_keys(&self) -> Vec<String> {
        let mut keys = self.inner.keys().await.unwrap();
        keys.sort();
        keys
    }
}

#[async_trait]
impl CacheStorage for InstrumentedStorage {
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.touch();
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.touch();
        self.inner.has(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        self.touch();
        if self.undeletable.lock().unwrap().iter().any(|n| n == name) {
            return Err(ServiceWorkerError::CacheError(format!("{name} is locked")));
        }
        self.inner.delete(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        self.touch();
        self.inner.keys().await
    }

    async fn match_in(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        self.touch();
        self.inner.match_in(name, request).await
    }

    async fn match_any(&self, request: &Request) -> Result<Option<Response>, ServiceWorkerError> {
        self.touch();
        self.inner.match_any(request).await
    }

    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError> {
        self.touch();
        if self.read_only.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::CacheError("quota exceeded".to_string()));
        }
        self.inner.put(name, request, response).await
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(Request, Response)>,
    ) -> Result<(), ServiceWorkerError> {
        self.touch();
        self.inner.put_all(name, entries).await
    }

    async fn entry_count(&self, name: &str) -> Result<usize, ServiceWorkerError> {
        self.touch();
        self.inner.entry_count(name).await
    }
}

/// Installed and activated worker over the given fixtures.
pub async fn active_worker(
    config: WorkerConfig,
    storage: &Arc<InstrumentedStorage>,
    network: &Arc<MockNetwork>,
) -> OfflineWorker {
    let worker = OfflineWorker::new(config, storage.clone(), network.clone()).unwrap();
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    worker
}
