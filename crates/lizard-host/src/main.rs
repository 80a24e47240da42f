//! Lizard Tap offline cache host.
//!
//! Drives the offline cache lifecycle against a real origin and an on-disk
//! bucket store.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the manifest and activate the current version
//! lizard-host --config lizard.json install
//!
//! # Serve requests through the cache (relative URLs resolve against the origin)
//! lizard-host fetch /index.html /achievements.json
//! lizard-host fetch --document /
//!
//! # Inspect or drop buckets
//! lizard-host caches
//! lizard-host clear
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lizard_common::{init_logging, retry, LogConfig, LogFormat, RetryPolicy};
use lizard_core::OfflineConfig;
use lizard_net::{HttpFetcher, LoaderConfig, Request, RequestDestination};
use lizard_sw::{
    CacheStore, DiskCacheStore, OfflineCacheManager, ServiceWorkerEvent, ServiceWorkerState,
    WorkerConfig,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

type HostManager = OfflineCacheManager<DiskCacheStore, HttpFetcher>;

#[derive(Parser, Debug)]
#[command(name = "lizard-host")]
#[command(about = "Offline cache host for the Lizard Tap game")]
struct Cli {
    /// Configuration file (JSON). Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Precache the manifest, then activate and prune stale buckets
    Install,

    /// Serve URLs through the cache
    Fetch {
        /// URLs to request; relative ones resolve against the origin
        #[arg(required = true)]
        urls: Vec<String>,

        /// Treat the requests as top-level navigations
        #[arg(long)]
        document: bool,
    },

    /// List buckets and their entry counts
    Caches,

    /// Delete every bucket
    Clear,

    /// Deliver a push message and show a notification
    Push {
        /// Notification body; the configured body is used when omitted
        message: Option<String>,

        /// Also simulate the user clicking the notification
        #[arg(long)]
        click: bool,
    },

    /// Fire a background sync tag
    Sync {
        /// Tag to dispatch; defaults to the configured sync tag
        tag: Option<String>,
    },

    /// Write the default configuration to a file
    InitConfig {
        /// Output path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format);
    if let Err(e) = init_logging(log_config) {
        eprintln!("logging already initialised: {e}");
    }

    let config = load_config(cli.config.as_ref())?;
    debug!(bucket = %config.bucket_name(), cache_dir = %config.cache_dir.display(), "Configuration ready");

    match cli.command {
        Commands::InitConfig { path } => {
            OfflineConfig::default()
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
        Commands::Caches => list_caches(&DiskCacheStore::new(&config.cache_dir)).await,
        Commands::Clear => clear_caches(&DiskCacheStore::new(&config.cache_dir)).await,
        command => {
            let (manager, events) = build_manager(&config)?;
            let result = run_worker_command(&manager, &config, command).await;
            log_events(events);
            result
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<OfflineConfig> {
    let config = match path {
        Some(path) => OfflineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => OfflineConfig::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_manager(
    config: &OfflineConfig,
) -> Result<(HostManager, UnboundedReceiver<ServiceWorkerEvent>)> {
    let worker_config = WorkerConfig::from_config(config)?;
    let fetcher = HttpFetcher::new(LoaderConfig::default())?;
    let store = DiskCacheStore::new(&config.cache_dir);
    Ok(OfflineCacheManager::new(worker_config, store, fetcher))
}

async fn run_worker_command(
    manager: &HostManager,
    config: &OfflineConfig,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Install => install(manager, config).await,
        Commands::Fetch { urls, document } => fetch(manager, config, &urls, document).await,
        Commands::Push { message, click } => {
            let id = manager.handle_push(message.as_deref()).await;
            println!("notification {} shown", id.raw());
            if click {
                let client = manager.handle_notification_click(id).await?;
                println!("opened window {} at {}", client.id, client.url);
            }
            Ok(())
        }
        Commands::Sync { tag } => {
            let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
            if manager.handle_sync(&tag).await {
                println!("sync {tag} handled");
            } else {
                println!("sync {tag} ignored");
            }
            Ok(())
        }
        Commands::InitConfig { .. } | Commands::Caches | Commands::Clear => {
            unreachable!("handled before the manager is built")
        }
    }
}

async fn install(manager: &HostManager, config: &OfflineConfig) -> Result<()> {
    let policy = RetryPolicy::attempts(config.install_attempts);
    let installed = retry(&policy, |attempt| async move {
        debug!(attempt, "Installing");
        manager.install().await.map_err(anyhow::Error::from)
    })
    .await;

    manager.activate().await.context("activate failed")?;

    let entries = manager.store().entries(manager.bucket_name()).await?;
    println!("{} active with {} entries", manager.bucket_name(), entries.len());
    installed.context("install failed")
}

async fn fetch(
    manager: &HostManager,
    config: &OfflineConfig,
    urls: &[String],
    document: bool,
) -> Result<()> {
    if let Err(e) = manager.start().await {
        if manager.state() != ServiceWorkerState::Activated {
            return Err(e).context("failed to start worker");
        }
        warn!(error = %e, "Precache incomplete, serving from network");
    }

    let mut failures = 0;
    for raw in urls {
        let url = config.resolve(raw)?;
        let request = if document {
            Request::navigate(url)
        } else {
            let destination = RequestDestination::from_path(url.path());
            Request::get(url).with_destination(destination)
        };

        match manager.serve(&request).await {
            Ok(response) => println!(
                "{} {:?} {:?} {} bytes {}",
                response.status,
                response.kind,
                response.source,
                response.body.len(),
                request.url
            ),
            Err(e) => {
                error!(url = %request.url, error = %e, "Request failed");
                println!("ERR {} {e}", request.url);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} requests failed", urls.len());
    }
    Ok(())
}

async fn list_caches(store: &DiskCacheStore) -> Result<()> {
    let names = store.keys().await?;
    if names.is_empty() {
        println!("no caches in {}", store.root().display());
    }
    for name in names {
        let count = store.entries(&name).await?.len();
        println!("{name}\t{count} entries");
    }
    Ok(())
}

async fn clear_caches(store: &DiskCacheStore) -> Result<()> {
    for name in store.keys().await? {
        store.delete(&name).await?;
        info!(bucket = %name, "Deleted cache");
    }
    Ok(())
}

fn log_events(mut events: UnboundedReceiver<ServiceWorkerEvent>) {
    while let Ok(event) = events.try_recv() {
        debug!(?event, "Worker event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "lizard-host",
            "--log-format",
            "json",
            "-vv",
            "fetch",
            "--document",
            "/",
            "/style.css",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Fetch { urls, document } => {
                assert_eq!(urls, vec!["/", "/style.css"]);
                assert!(document);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_fetch_requires_urls() {
        assert!(Cli::try_parse_from(["lizard-host", "fetch"]).is_err());
    }

    #[test]
    fn test_parse_push_and_global_config() {
        let cli = Cli::try_parse_from(["lizard-host", "push", "hi", "--click", "-c", "x.json"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.json")));
        assert!(matches!(
            cli.command,
            Commands::Push { message: Some(ref m), click: true } if m == "hi"
        ));
    }

    #[test]
    fn test_load_config_defaults_and_file() {
        assert_eq!(load_config(None).unwrap(), OfflineConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lizard.json");
        std::fs::write(&path, r#"{ "origin": "ftp://nope/" }"#).unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[tokio::test]
    async fn test_clear_and_list_caches() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::new(dir.path());
        store.open("lizard-tap-v1.0.0").await.unwrap();
        store.open("lizard-tap-v0.1.0").await.unwrap();

        list_caches(&store).await.unwrap();
        clear_caches(&store).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
