//! Named cache storages holding request → response snapshots.
//!
//! ```text
//! CacheStorage (caches)
//!     ├── battle-of-senses-v1.0.0   (precache generation)
//!     │       └── GET url → Response
//!     └── battle-of-senses-runtime-v1
//!             └── GET url → Response
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use http::header::VARY;
use http::{HeaderName, HeaderValue, Method};
use senses_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::trace;

use crate::ServiceWorkerError;

// ==================== Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Request URL, fragment stripped.
    pub url: String,

    /// Stored response.
    pub response: Response,

    /// Request header values named by the response's `Vary` header.
    vary: Vary,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

#[derive(Debug, Clone)]
enum Vary {
    /// `Vary: *`, never matches.
    Any,
    Headers(Vec<(HeaderName, Option<HeaderValue>)>),
}

impl CacheEntry {
    /// Snapshot a response for the given request.
    pub fn new(request: &Request, response: Response) -> Self {
        let vary = vary_snapshot(request, &response);
        Self {
            url: cache_key(request),
            response,
            vary,
            cached_at: now_millis(),
        }
    }

    /// Whether this entry answers the request.
    pub fn matches(&self, request: &Request) -> bool {
        if request.method != Method::GET || self.url != cache_key(request) {
            return false;
        }
        match &self.vary {
            Vary::Any => false,
            Vary::Headers(stored) => stored
                .iter()
                .all(|(name, value)| request.headers.get(name) == value.as_ref()),
        }
    }
}

fn cache_key(request: &Request) -> String {
    request.url_without_fragment().to_string()
}

fn vary_snapshot(request: &Request, response: &Response) -> Vary {
    let mut headers = Vec::new();
    for value in response.headers.get_all(VARY) {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if name == "*" {
                return Vary::Any;
            }
            if let Ok(name) = HeaderName::try_from(name) {
                let stored = request.headers.get(&name).cloned();
                headers.push((name, stored));
            }
        }
    }
    Vary::Headers(headers)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// A single named cache.
///
/// Holds at most one entry per URL; a later `put` replaces the earlier one.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries
            .get(&cache_key(request))
            .filter(|entry| entry.matches(request))
    }

    /// Store a response for a request.
    pub fn put(&mut self, request: &Request, response: Response) -> Result<(), ServiceWorkerError> {
        check_storable(request, &response)?;
        let entry = CacheEntry::new(request, response);
        self.entries.insert(entry.url.clone(), entry);
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_storable(request: &Request, response: &Response) -> Result<(), ServiceWorkerError> {
    if request.method != Method::GET {
        return Err(ServiceWorkerError::CacheError(format!(
            "Request method '{}' is unsupported",
            request.method
        )));
    }
    if response.status == 206 {
        return Err(ServiceWorkerError::CacheError(
            "Partial response (status code 206) is unsupported".to_string(),
        ));
    }
    Ok(())
}

// ==================== Cache Storage ====================

/// The `caches` substrate the worker reads and writes.
///
/// Implementations serialize access internally; callers never lock.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if absent. Returns `true` if it was created.
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Delete a cache. Returns `false` if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// All cache names, in creation order.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;

    /// Match a request in one cache.
    async fn match_in(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<Response>, ServiceWorkerError>;

    /// Match a request across all caches, first match in creation order.
    async fn match_any(&self, request: &Request) -> Result<Option<Response>, ServiceWorkerError>;

    /// Store one response, creating the cache if absent.
    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError>;

    /// Store a batch of responses. Either all are written or none are.
    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(Request, Response)>,
    ) -> Result<(), ServiceWorkerError>;

    /// Number of entries in a cache.
    async fn entry_count(&self, name: &str) -> Result<usize, ServiceWorkerError>;
}

/// In-process [`CacheStorage`].
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<Vec<Cache>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn position(caches: &[Cache], name: &str) -> Option<usize> {
    caches.iter().position(|c| c.name == name)
}

fn open_mut<'a>(caches: &'a mut Vec<Cache>, name: &str) -> &'a mut Cache {
    let index = match position(caches, name) {
        Some(index) => index,
        None => {
            caches.push(Cache::new(name));
            caches.len() - 1
        }
    };
    &mut caches[index]
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        if position(&caches, name).is_some() {
            return Ok(false);
        }
        caches.push(Cache::new(name));
        trace!(cache = name, "Created cache");
        Ok(true)
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(position(&self.caches.read().await, name).is_some())
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut caches = self.caches.write().await;
        match position(&caches, name) {
            Some(index) => {
                caches.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self
            .caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    async fn match_in(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        Ok(caches
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.match_request(request))
            .map(|entry| entry.response.clone()))
    }

    async fn match_any(&self, request: &Request) -> Result<Option<Response>, ServiceWorkerError> {
        let caches = self.caches.read().await;
        Ok(caches
            .iter()
            .find_map(|c| c.match_request(request))
            .map(|entry| entry.response.clone()))
    }

    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: Response,
    ) -> Result<(), ServiceWorkerError> {
        check_storable(request, &response)?;
        let mut caches = self.caches.write().await;
        open_mut(&mut caches, name).put(request, response)
    }

    async fn put_all(
        &self,
        name: &str,
        entries: Vec<(Request, Response)>,
    ) -> Result<(), ServiceWorkerError> {
        for (request, response) in &entries {
            check_storable(request, response)?;
        }
        let mut caches = self.caches.write().await;
        let cache = open_mut(&mut caches, name);
        for (request, response) in entries {
            cache.put(&request, response)?;
        }
        Ok(())
    }

    async fn entry_count(&self, name: &str) -> Result<usize, ServiceWorkerError> {
        let caches = self.caches.read().await;
        caches
            .iter()
            .find(|c| c.name == name)
            .map(Cache::len)
            .ok_or_else(|| ServiceWorkerError::NotFound(name.to_string()))
    }
}
