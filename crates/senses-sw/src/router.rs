//! Fetch interception and routing.
//!
//! | Request | Strategy |
//! |---|---|
//! | same origin | cache first, store 200 responses, HTML fallback when offline |
//! | allow-listed host (fonts) | cached copy now, refresh in background |
//! | any other origin | network only, caches untouched |

use std::sync::Arc;

use senses_net::{Request, RequestScope, Response, ResponseType};
use tracing::{debug, error, trace, warn};

use crate::worker::OfflineWorker;
use crate::ServiceWorkerError;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// The cached root document, served for a failed navigation.
    Fallback,
}

/// Result of a fetch event.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The worker supplies this response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// The worker does not control the page; the host fetches normally.
    Passthrough,
}

impl FetchOutcome {
    fn respond(response: Response, source: ResponseSource) -> Self {
        Self::Respond { response, source }
    }

    /// The response, if the worker supplied one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Respond { response, .. } => Some(response),
            Self::Passthrough => None,
        }
    }

    /// Where the response came from, if the worker supplied one.
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Respond { source, .. } => Some(*source),
            Self::Passthrough => None,
        }
    }
}

/// Whether a fetched response may go into the runtime cache.
fn cacheable(response: &Response, scope: RequestScope) -> bool {
    if response.is_error() {
        return false;
    }
    match scope {
        RequestScope::AllowListed => {
            response.status == 200 || response.response_type == ResponseType::Opaque
        }
        _ => response.status == 200,
    }
}

impl OfflineWorker {
    /// Route one intercepted request.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        if !self.is_active().await {
            trace!(url = %request.url, "Not controlling, passing through");
            return Ok(FetchOutcome::Passthrough);
        }

        match self.classifier.classify(&request.url) {
            RequestScope::SameOrigin => self.cache_first(request).await,
            RequestScope::AllowListed => self.cache_then_refresh(request).await,
            RequestScope::Foreign => self.network_only(request).await,
        }
    }

    /// Live third-party APIs: never read or write a cache.
    async fn network_only(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        debug!(url = %request.url, "Network only");
        let response = self.fetcher.fetch(&request).await?;
        Ok(FetchOutcome::respond(response, ResponseSource::Network))
    }

    /// Allow-listed hosts: serve the cached copy and refresh it detached,
    /// or fetch and store when nothing is cached yet.
    async fn cache_then_refresh(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        if let Some(cached) = self.caches.match_any(&request).await? {
            trace!(url = %request.url, "From cache, refreshing");
            self.refresh_in_background(request).await;
            return Ok(FetchOutcome::respond(cached, ResponseSource::Cache));
        }

        debug!(url = %request.url, "Loading from network");
        let response = self.fetcher.fetch(&request).await?;
        if cacheable(&response, RequestScope::AllowListed) {
            self.store_runtime(&request, response.clone()).await;
        }
        Ok(FetchOutcome::respond(response, ResponseSource::Network))
    }

    /// Same-origin requests: cache first, then network, then the cached root
    /// document for HTML requests.
    async fn cache_first(&self, request: Request) -> Result<FetchOutcome, ServiceWorkerError> {
        match self.cache_or_network(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(url = %request.url, error = %err, "Fetch failed");
                if request.accepts_html() {
                    if let Some(document) = self.navigation_fallback().await {
                        return Ok(FetchOutcome::respond(document, ResponseSource::Fallback));
                    }
                }
                Err(err)
            }
        }
    }

    async fn cache_or_network(&self, request: &Request) -> Result<FetchOutcome, ServiceWorkerError> {
        if let Some(cached) = self.caches.match_any(request).await? {
            trace!(url = %request.url, "From cache");
            return Ok(FetchOutcome::respond(cached, ResponseSource::Cache));
        }

        debug!(url = %request.url, "Loading from network");
        let response = self.fetcher.fetch(request).await?;

        if !cacheable(&response, RequestScope::SameOrigin) {
            debug!(url = %request.url, status = response.status, "Not caching response");
            return Ok(FetchOutcome::respond(response, ResponseSource::Network));
        }

        self.store_runtime(request, response.clone()).await;
        Ok(FetchOutcome::respond(response, ResponseSource::Network))
    }

    async fn navigation_fallback(&self) -> Option<Response> {
        let request = Request::get(self.fallback_url.clone());
        match self.caches.match_any(&request).await {
            Ok(Some(document)) => {
                debug!(fallback = %self.fallback_url, "Serving navigation fallback");
                Some(document)
            }
            Ok(None) => {
                warn!(fallback = %self.fallback_url, "Navigation fallback not cached");
                None
            }
            Err(err) => {
                warn!(fallback = %self.fallback_url, error = %err, "Navigation fallback lookup failed");
                None
            }
        }
    }

    /// Best-effort write into the runtime cache; failures are only logged.
    async fn store_runtime(&self, request: &Request, response: Response) {
        if let Err(err) = self
            .caches
            .put(&self.config.runtime_cache, request, response)
            .await
        {
            warn!(url = %request.url, error = %err, "Runtime cache write failed");
        }
    }

    async fn refresh_in_background(&self, request: Request) {
        let caches = Arc::clone(&self.caches);
        let fetcher = Arc::clone(&self.fetcher);
        let runtime_cache = self.config.runtime_cache.clone();

        self.spawn_background(async move {
            let response = match fetcher.fetch(&request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(url = %request.url, error = %err, "Background refresh failed");
                    return;
                }
            };
            if !cacheable(&response, RequestScope::AllowListed) {
                debug!(url = %request.url, status = response.status, "Refresh not cached");
                return;
            }
            if let Err(err) = caches.put(&runtime_cache, &request, response).await {
                warn!(url = %request.url, error = %err, "Runtime cache write failed");
            }
        })
        .await;
    }
}
