//! # Senses Offline Worker
//!
//! The offline asset-caching worker for the Battle of Senses exhibition
//! content.
//!
//! ## Features
//!
//! - **Lifecycle**: install (all-or-nothing precache), activate (generation
//!   eviction), skip-waiting and client claim
//! - **Cache API**: named [`CacheStorage`] with request → response entries
//! - **Fetch Interception**: network-only, cache-then-refresh and cache-first
//!   routing with an offline navigation fallback
//! - **Sync hooks**: `sync-data` and `update-cache`
//! - **Registration**: host-side install/waiting/active handoff
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRegistration (host)
//!     ├── installing / waiting / active (OfflineWorker)
//!     │
//!     └── dispatch(WorkerEvent)
//!             ├── Install / Activate        → lifecycle
//!             ├── Fetch(request)            → router
//!             ├── Message(payload, reply)   → lifecycle
//!             └── Sync / PeriodicSync       → sync hooks
//!
//! CacheStorage (caches)
//!     └── Cache
//!             └── Request → Response
//! ```

use senses_core::SensesError;
use senses_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod lifecycle;
pub mod registration;
pub mod router;
pub mod sync;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCacheStorage};
pub use lifecycle::{ActivationReport, InstallReport, MessageOutcome, VersionReply, WorkerMessage};
pub use registration::{RegistrationEvent, ServiceWorkerRegistration};
pub use router::{FetchOutcome, ResponseSource};
pub use sync::{SyncOutcome, SYNC_DATA_TAG, UPDATE_CACHE_TAG};
pub use worker::{EventOutcome, OfflineWorker, ServiceWorkerState, WorkerEvent, WorkerId};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

impl From<SensesError> for ServiceWorkerError {
    fn from(err: SensesError) -> Self {
        Self::Config(err.to_string())
    }
}
