//! Background sync hooks.

use tracing::{debug, info};

use crate::worker::OfflineWorker;
use crate::ServiceWorkerError;

/// Deferred sync tag, reserved for pushing saved settings.
pub const SYNC_DATA_TAG: &str = "sync-data";

/// Periodic sync tag that re-downloads the precache manifest.
pub const UPDATE_CACHE_TAG: &str = "update-cache";

/// What a sync event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The deferred sync hook ran.
    Synced,
    /// The generation cache was re-populated.
    Refreshed { entries: usize },
    /// Unknown tag.
    Ignored,
}

impl OfflineWorker {
    /// Handle a one-off `sync` event.
    pub async fn handle_sync(&self, tag: &str) -> Result<SyncOutcome, ServiceWorkerError> {
        self.ensure_not_redundant().await?;
        if tag != SYNC_DATA_TAG {
            debug!(tag, "Ignoring sync tag");
            return Ok(SyncOutcome::Ignored);
        }

        // Nothing is queued for upload yet; the hook only reports that it ran.
        info!(worker = self.id.raw(), "Synchronizing data");
        Ok(SyncOutcome::Synced)
    }

    /// Handle a `periodicsync` event.
    ///
    /// `update-cache` overwrites every manifest entry in the current
    /// generation without bumping it and without evicting anything. A failed
    /// fetch leaves the previous entries in place.
    pub async fn handle_periodic_sync(&self, tag: &str) -> Result<SyncOutcome, ServiceWorkerError> {
        self.ensure_not_redundant().await?;
        if tag != UPDATE_CACHE_TAG {
            debug!(tag, "Ignoring periodic sync tag");
            return Ok(SyncOutcome::Ignored);
        }

        self.caches.open(&self.config.generation).await?;
        let entries = self.populate().await?;
        info!(worker = self.id.raw(), entries, "Cache updated");
        Ok(SyncOutcome::Refreshed { entries })
    }
}
