//! Worker configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{SensesError, SensesResult};

/// Generation identifier of the deployed content snapshot.
pub const DEFAULT_GENERATION: &str = "battle-of-senses-v1.0.0";

/// Runtime cache identifier, kept across deploys.
pub const DEFAULT_RUNTIME_CACHE: &str = "battle-of-senses-runtime-v1";

const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/headphones.html",
    "/sluh.html",
    "/quiet.html",
    "/zrenie_mob.html",
    "/sound-exhibition.html",
    "/manifest.json",
    // Images
    "/pic/image1.png",
    "/pic/image2.png",
    "/pic/Piph.png",
    "/pic/Plato.png",
    "/pic/Arist.png",
    "/pic/ranciere.jpg",
    "/pic/leibniz.jpg",
    "/pic/mcluhan.jpg",
    "/pic/kant.jpg",
    "/pic/hegel.jpg",
    "/pic/descartes.jpg",
    "/pic/aquinas.jpg",
];

const DEFAULT_FONT_HOSTS: &[&str] = &["fonts.googleapis.com", "fonts.gstatic.com"];

/// What activation does when a stale cache cannot be deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Log the failure and keep deleting the rest.
    #[default]
    BestEffort,
    /// Fail the activation on the first failed deletion.
    Abort,
}

/// Offline worker configuration
///
/// Everything the worker would otherwise bake in as constants. A changed
/// `precache` list must come with a new `generation`, or the old entries are
/// never evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker is served from
    pub origin: Url,

    /// Cache generation identifier
    pub generation: String,

    /// Runtime cache identifier
    pub runtime_cache: String,

    /// Absolute paths fetched and stored at install
    pub precache: Vec<String>,

    /// Cross-origin hosts whose responses may be cached
    pub font_hosts: Vec<String>,

    /// Document served to HTML requests when the network is gone
    pub navigation_fallback: String,

    /// Handling of failed deletions during activation
    pub eviction_policy: EvictionPolicy,

    /// Take control right after install instead of waiting
    pub skip_waiting_on_install: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost/").expect("static origin is valid"),
            generation: DEFAULT_GENERATION.to_string(),
            runtime_cache: DEFAULT_RUNTIME_CACHE.to_string(),
            precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
            font_hosts: DEFAULT_FONT_HOSTS.iter().map(|h| h.to_string()).collect(),
            navigation_fallback: "/index.html".to_string(),
            eviction_policy: EvictionPolicy::default(),
            skip_waiting_on_install: true,
        }
    }
}

impl WorkerConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> SensesResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading worker config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(raw: &str) -> SensesResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> SensesResult<()> {
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(SensesError::config(format!(
                "origin must be http(s), got {}",
                self.origin
            )));
        }
        if self.generation.trim().is_empty() {
            return Err(SensesError::config("generation identifier is empty"));
        }
        if self.runtime_cache.trim().is_empty() {
            return Err(SensesError::config("runtime cache identifier is empty"));
        }
        if self.generation == self.runtime_cache {
            return Err(SensesError::config(
                "generation and runtime cache identifiers must differ",
            ));
        }
        if let Some(bad) = self.precache.iter().find(|p| !is_local_path(p)) {
            return Err(SensesError::config(format!(
                "precache entry is not an absolute path: {bad}"
            )));
        }
        if !is_local_path(&self.navigation_fallback) {
            return Err(SensesError::config(format!(
                "navigation fallback is not an absolute path: {}",
                self.navigation_fallback
            )));
        }
        let origin = self.origin.origin();
        if let Some(foreign) = self
            .precache_urls()?
            .into_iter()
            .find(|url| url.origin() != origin)
        {
            return Err(SensesError::config(format!(
                "precache entry leaves the origin: {foreign}"
            )));
        }
        Ok(())
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = origin;
        self
    }

    /// Set the generation identifier.
    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = generation.into();
        self
    }

    /// Set the runtime cache identifier.
    pub fn with_runtime_cache(mut self, runtime_cache: impl Into<String>) -> Self {
        self.runtime_cache = runtime_cache.into();
        self
    }

    /// Replace the precache manifest.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Set the eviction policy.
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Set whether install requests immediate control.
    pub fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    /// Cache names that survive activation.
    pub fn allow_list(&self) -> [&str; 2] {
        [self.generation.as_str(), self.runtime_cache.as_str()]
    }

    /// Manifest entries resolved against the origin, in manifest order.
    pub fn precache_urls(&self) -> SensesResult<Vec<Url>> {
        self.precache
            .iter()
            .map(|path| self.origin.join(path).map_err(SensesError::from))
            .collect()
    }

    /// Absolute URL of the navigation fallback document.
    pub fn fallback_url(&self) -> SensesResult<Url> {
        Ok(self.origin.join(&self.navigation_fallback)?)
    }
}

/// Absolute path on the origin; `//host/...` is a network-path reference.
fn is_local_path(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//")
}
