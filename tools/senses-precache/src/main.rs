//! Offline cache tool for the Battle of Senses site.
//!
//! Runs the same install and activation the browser would, against a live
//! origin, and prints what ended up in the caches.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the default manifest from a local dev server
//! senses-precache --origin http://localhost:8080/ install
//!
//! # Show the resolved manifest for a custom configuration
//! senses-precache --config worker.json manifest
//!
//! # Ask the worker for its generation identifier
//! senses-precache version
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use senses_common::{init_logging, LogConfig, LogFormat};
use senses_core::WorkerConfig;
use senses_net::{HttpFetcher, LoaderConfig};
use senses_sw::{CacheStorage, MemoryCacheStorage, OfflineWorker, WorkerEvent};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

#[derive(Parser)]
#[command(name = "senses-precache")]
#[command(about = "Install and inspect the offline cache against a live origin")]
struct Cli {
    /// Worker configuration (JSON); built-in defaults otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Origin to precache from, overriding the configuration
    #[arg(long, global = true)]
    origin: Option<Url>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the generation, then report the caches
    Install,

    /// Print the generation identifier the worker reports
    Version,

    /// Print the resolved precache URLs
    Manifest,
}

/// One cache after activation.
#[derive(Debug, Serialize)]
struct CacheSummary {
    name: String,
    entries: usize,
}

/// JSON printed by `install`.
#[derive(Debug, Serialize)]
struct InstallSummary {
    version: String,
    cached: usize,
    caches: Vec<CacheSummary>,
    evicted: Vec<String>,
    failed: Vec<String>,
}

fn load_config(path: Option<&Path>, origin: Option<Url>) -> Result<WorkerConfig> {
    let config = match path {
        Some(path) => WorkerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    let config = match origin {
        Some(origin) => config.with_origin(origin),
        None => config,
    };
    config.validate()?;
    Ok(config)
}

fn log_config(format: LogFormat, verbose: bool) -> LogConfig {
    let config = if verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    config.with_format(format)
}

async fn install(config: WorkerConfig) -> Result<InstallSummary> {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let worker = OfflineWorker::new(config, storage.clone(), fetcher)?;

    let installed = worker.install().await?;
    let activated = worker.activate().await?;

    let mut caches = Vec::new();
    for name in storage.keys().await? {
        let entries = storage.entry_count(&name).await?;
        caches.push(CacheSummary { name, entries });
    }

    info!(
        version = worker.version(),
        cached = installed.cached,
        evicted = activated.evicted.len(),
        "Precache complete"
    );

    Ok(InstallSummary {
        version: installed.generation,
        cached: installed.cached,
        caches,
        evicted: activated.evicted,
        failed: activated.failed,
    })
}

async fn version(config: WorkerConfig) -> Result<serde_json::Value> {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let worker = OfflineWorker::new(config, storage, fetcher)?;

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    worker
        .dispatch(WorkerEvent::Message {
            payload: serde_json::json!({ "type": "GET_VERSION" }),
            reply: Some(reply_tx),
        })
        .await?;

    match reply_rx.await {
        Ok(reply) => Ok(reply),
        Err(_) => bail!("worker did not reply to GET_VERSION"),
    }
}

fn manifest(config: &WorkerConfig) -> Result<Vec<String>> {
    let urls = config.precache_urls()?;
    Ok(urls.into_iter().map(String::from).collect())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(log_config(cli.log_format, cli.verbose))?;
    let config = load_config(cli.config.as_deref(), cli.origin)?;
    debug!(origin = %config.origin, generation = %config.generation, "Configuration loaded");

    let output = match cli.command {
        Commands::Install => serde_json::to_value(install(config).await?)?,
        Commands::Version => version(config).await?,
        Commands::Manifest => serde_json::to_value(manifest(&config)?)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_parses_global_options() {
        let cli = Cli::try_parse_from([
            "senses-precache",
            "install",
            "--origin",
            "http://localhost:8080/",
            "--log-format",
            "json",
            "-v",
        ])
        .unwrap();

        assert!(matches!(cli.command, Commands::Install));
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.verbose);
        assert_eq!(cli.origin.unwrap().as_str(), "http://localhost:8080/");
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        let result = Cli::try_parse_from(["senses-precache", "--log-format", "xml", "version"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_applies_origin_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "generation": "battle-of-senses-v1.0.1" }}"#).unwrap();

        let origin = Url::parse("https://senses.example/").unwrap();
        let config = load_config(Some(file.path()), Some(origin.clone())).unwrap();

        assert_eq!(config.generation, "battle-of-senses-v1.0.1");
        assert_eq!(config.origin, origin);
    }

    #[test]
    fn test_load_config_rejects_non_http_origin() {
        let origin = Url::parse("file:///srv/senses/").unwrap();
        assert!(load_config(None, Some(origin)).is_err());
    }

    #[test]
    fn test_manifest_resolves_against_origin() {
        let config = WorkerConfig::default()
            .with_origin(Url::parse("https://senses.example/").unwrap())
            .with_precache(["/", "/quiet.html"]);

        assert_eq!(
            manifest(&config).unwrap(),
            vec![
                "https://senses.example/".to_string(),
                "https://senses.example/quiet.html".to_string(),
            ]
        );
    }

    #[test]
    fn test_verbose_selects_debug_logging() {
        let config = log_config(LogFormat::Compact, true);
        assert_eq!(config.level, tracing::Level::DEBUG);
        assert_eq!(config.format, LogFormat::Compact);
    }
}
