//! The offline cache manager.
//!
//! Lifecycle: `install` precaches the manifest, `activate` prunes stale buckets
//! and claims clients, then `serve` handles intercepted requests. `serve` waits
//! on a readiness gate until activation has finished.
//!
//! A failed install is reported to the caller but does not stop activation:
//! the worker then serves from the network with degraded offline support.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::try_join_all;
use lizard_common::with_timeout;
use lizard_core::{NotificationConfig, OfflineConfig};
use lizard_net::{cache_key_for, Fetcher, NetError, Request, RequestDestination, Response};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::clients::{Client, Clients};
use crate::notifications::{Notification, NotificationId, Notifications};
use crate::store::CacheStore;
use crate::{
    now_millis, CacheEntry, CacheName, FetchResponse, ResponseKind, ResponseSource,
    ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState,
};

/// Resolved settings for one deployed version.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub cache_name: CacheName,
    pub origin: Url,
    /// Precached on install, in order.
    pub manifest: Vec<Url>,
    /// Served for failed navigations.
    pub shell_url: Url,
    /// Bound on each network fetch. `None` waits indefinitely.
    pub network_timeout: Option<Duration>,
    pub sync_tag: String,
    pub notification: NotificationConfig,
    /// Opened when a notification is clicked.
    pub open_url: Url,
}

impl WorkerConfig {
    pub fn from_config(config: &OfflineConfig) -> Result<Self, ServiceWorkerError> {
        let invalid = |e: lizard_core::LizardError| ServiceWorkerError::Config(e.to_string());
        config.validate().map_err(invalid)?;

        Ok(Self {
            cache_name: CacheName::new(&config.cache_name, &config.version),
            origin: config.origin_url().map_err(invalid)?,
            manifest: config.manifest_urls().map_err(invalid)?,
            shell_url: config.resolve(&config.shell_url).map_err(invalid)?,
            network_timeout: config.network_timeout(),
            sync_tag: config.sync_tag.clone(),
            notification: config.notification.clone(),
            open_url: config.resolve(&config.notification.open_url).map_err(invalid)?,
        })
    }
}

/// Owns the current bucket and answers lifecycle triggers and fetches.
pub struct OfflineCacheManager<S, F> {
    config: WorkerConfig,
    bucket: String,
    store: S,
    fetcher: F,
    state: watch::Sender<ServiceWorkerState>,
    /// Whether the last install stored every manifest URL.
    precache_complete: AtomicBool,
    /// Serializes install and activate.
    lifecycle: Mutex<()>,
    clients: RwLock<Clients>,
    notifications: RwLock<Notifications>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl<S: CacheStore, F: Fetcher> OfflineCacheManager<S, F> {
    /// Create a manager and the receiving end of its event channel.
    pub fn new(
        config: WorkerConfig,
        store: S,
        fetcher: F,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);

        (
            Self {
                bucket: config.cache_name.to_string(),
                config,
                store,
                fetcher,
                state,
                precache_complete: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                clients: RwLock::new(Clients::new()),
                notifications: RwLock::new(Notifications::new()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Name of the current bucket.
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// False until an install has stored the whole manifest, and again after
    /// a failed install.
    pub fn precache_complete(&self) -> bool {
        self.precache_complete.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register a page with the worker.
    pub async fn add_client(&self, client: Client) {
        self.clients.write().await.add(client);
    }

    /// Forget a page that has closed.
    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Snapshot of all known clients.
    pub async fn clients(&self) -> Vec<Client> {
        self.clients
            .read()
            .await
            .match_all(true)
            .into_iter()
            .cloned()
            .collect()
    }

    fn set_state(&self, new_state: ServiceWorkerState) {
        let old = self.state.send_replace(new_state);
        if old != new_state {
            debug!(bucket = %self.bucket, ?old, new = ?new_state, "State change");
            self.emit(ServiceWorkerEvent::StateChange {
                bucket: self.bucket.clone(),
                new_state,
            });
        }
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn classify(&self, response: &Response) -> ResponseKind {
        ResponseKind::classify(response.status, response.is_same_origin(&self.config.origin))
    }

    // ==================== Install ====================

    /// Precache the manifest into the current bucket.
    ///
    /// Fails as a whole if any manifest fetch fails or returns a non-2xx
    /// status; nothing is written unless every fetch succeeded. Skip-waiting
    /// is signalled either way, and the worker may still activate.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let _guard = self.lifecycle.lock().await;
        self.install_locked().await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn install_locked(&self) -> Result<(), ServiceWorkerError> {
        // Re-installing an active version refreshes its bucket without closing the gate.
        let already_active = self.state() == ServiceWorkerState::Activated;
        if !already_active {
            self.set_state(ServiceWorkerState::Installing);
        }

        let result = self.precache().await;
        match &result {
            Ok(count) => info!(count, "Opened cache and stored manifest"),
            Err(e) => warn!(error = %e, "Cache install error, offline support degraded"),
        }
        self.precache_complete.store(result.is_ok(), Ordering::Release);
        if !already_active {
            self.set_state(ServiceWorkerState::Installed);
        }

        self.emit(ServiceWorkerEvent::SkipWaiting {
            bucket: self.bucket.clone(),
            install_succeeded: result.is_ok(),
        });

        result.map(|_| ())
    }

    async fn precache(&self) -> Result<usize, ServiceWorkerError> {
        let fetches = self.config.manifest.iter().map(|url| async move {
            let failed = |reason: String| ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason,
            };

            let request = Request::get(url.clone())
                .with_destination(RequestDestination::from_path(url.path()));
            let response = self
                .fetch_network(&request)
                .await
                .map_err(|e| failed(e.to_string()))?;

            if !response.ok() {
                return Err(failed(format!("unexpected status {}", response.status)));
            }

            let kind = self.classify(&response);
            Ok(CacheEntry::from_response(&request, &response, kind))
        });
        let entries = try_join_all(fetches).await?;

        // Only create the bucket once the whole manifest is in hand.
        self.store.open(&self.bucket).await?;
        let count = entries.len();
        for entry in entries {
            let url = entry.url.clone();
            self.store
                .put(&self.bucket, entry)
                .await
                .map_err(|e| ServiceWorkerError::InstallFailed {
                    url,
                    reason: e.to_string(),
                })?;
        }
        Ok(count)
    }

    // ==================== Activate ====================

    /// Delete every bucket except the current one, claim clients, and open the
    /// readiness gate.
    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        let _guard = self.lifecycle.lock().await;
        self.activate_locked().await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn activate_locked(&self) -> Result<(), ServiceWorkerError> {
        let state = self.state();
        if !matches!(
            state,
            ServiceWorkerState::Installed
                | ServiceWorkerState::Activating
                | ServiceWorkerState::Activated
        ) {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate from {state:?}"
            )));
        }

        let already_active = state == ServiceWorkerState::Activated;
        if !already_active {
            self.set_state(ServiceWorkerState::Activating);
        }

        let mut deleted = 0;
        for name in self.store.keys().await? {
            if self.config.cache_name.is_current(&name) {
                continue;
            }
            if self.store.delete(&name).await? {
                info!(stale = %name, "Deleting old cache");
                self.emit(ServiceWorkerEvent::StaleCacheDeleted { name });
                deleted += 1;
            }
        }

        let claimed = self.clients.write().await.claim(&self.bucket);
        self.emit(ServiceWorkerEvent::ClientsClaimed {
            bucket: self.bucket.clone(),
            count: claimed,
        });

        if !already_active {
            self.set_state(ServiceWorkerState::Activated);
        }
        info!(deleted, claimed, "Activated");
        Ok(())
    }

    /// Bring the worker up after a host restart.
    ///
    /// If the current bucket already holds every manifest URL it was installed
    /// by an earlier run, so only activation runs. Otherwise install then
    /// activate. The worker is activated even when that install fails; the
    /// install error is returned after activation.
    pub async fn start(&self) -> Result<(), ServiceWorkerError> {
        let _guard = self.lifecycle.lock().await;

        if self.state() == ServiceWorkerState::Activated {
            return Ok(());
        }

        let installed = if self.bucket_complete().await? {
            debug!(bucket = %self.bucket, "Resuming previously installed version");
            self.precache_complete.store(true, Ordering::Release);
            self.set_state(ServiceWorkerState::Installed);
            Ok(())
        } else {
            self.install_locked().await
        };
        self.activate_locked().await?;
        installed
    }

    /// Whether the current bucket holds an entry for every manifest URL.
    async fn bucket_complete(&self) -> Result<bool, ServiceWorkerError> {
        if !self.store.has(&self.bucket).await? {
            return Ok(false);
        }
        let stored = self.store.entries(&self.bucket).await?;
        Ok(self
            .config
            .manifest
            .iter()
            .all(|url| stored.iter().any(|key| key == cache_key_for(url))))
    }

    /// Wait until the worker is activated.
    pub async fn wait_until_active(&self) -> Result<(), ServiceWorkerError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| *s == ServiceWorkerState::Activated)
            .await
            .map(|_| ());
        settled.map_err(|_| ServiceWorkerError::StateError("worker shut down".to_string()))
    }

    // ==================== Serve ====================

    /// Answer an intercepted request.
    ///
    /// Cache-first: a hit in the current bucket is returned without touching
    /// the network. On a miss the request goes to the network and a same-origin
    /// 200 response is written through to the bucket before it is returned.
    /// If the network fails, navigations get the cached shell document and
    /// everything else gets the error.
    #[instrument(skip_all, fields(url = %request.url, method = %request.method))]
    pub async fn serve(&self, request: &Request) -> Result<FetchResponse, ServiceWorkerError> {
        self.wait_until_active().await?;

        let Some(key) = request.cache_key() else {
            trace!("Bypassing cache for non-GET request");
            let response = self.fetch_network(request).await?;
            let kind = self.classify(&response);
            return Ok(FetchResponse::from_network(response, kind));
        };

        match self.store.get(&self.bucket, key).await {
            Ok(Some(entry)) => {
                debug!("Serving from cache");
                return Ok(FetchResponse::from_cache(entry, ResponseSource::Cache));
            }
            Ok(None) => trace!("Cache miss"),
            Err(e) => warn!(error = %e, "Cache lookup failed, using network"),
        }

        let response = match self.fetch_network(request).await {
            Ok(response) => response,
            Err(e) => return self.offline_fallback(request, e).await,
        };

        let kind = self.classify(&response);
        if kind.is_cacheable() {
            let entry = CacheEntry::from_response(request, &response, kind);
            match self.store.put(&self.bucket, entry).await {
                Ok(()) => debug!("Cached network response"),
                Err(e) => warn!(error = %e, "Failed to cache response, serving it uncached"),
            }
        } else {
            trace!(?kind, status = %response.status, "Response not cacheable");
        }

        Ok(FetchResponse::from_network(response, kind))
    }

    async fn fetch_network(&self, request: &Request) -> Result<Response, ServiceWorkerError> {
        let fetch = self.fetcher.fetch(request);
        let result = match self.config.network_timeout {
            Some(timeout) => with_timeout(timeout, fetch)
                .await
                .unwrap_or_else(|_| Err(NetError::Timeout(timeout))),
            None => fetch.await,
        };
        result.map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))
    }

    async fn offline_fallback(
        &self,
        request: &Request,
        error: ServiceWorkerError,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        if !request.is_navigation() {
            debug!(error = %error, "Network failed");
            return Err(error);
        }

        match self.store.get(&self.bucket, self.config.shell_url.as_str()).await {
            Ok(Some(shell)) => {
                info!(error = %error, shell = %self.config.shell_url, "Offline, serving cached shell");
                Ok(FetchResponse::from_cache(shell, ResponseSource::OfflineShell))
            }
            Ok(None) => {
                warn!(error = %error, "Offline and no cached shell");
                Err(error)
            }
            Err(e) => {
                warn!(error = %error, store_error = %e, "Offline and shell lookup failed");
                Err(error)
            }
        }
    }

    // ==================== Auxiliary triggers ====================

    /// Background sync. Returns whether the tag was recognised.
    pub async fn handle_sync(&self, tag: &str) -> bool {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring unknown sync tag");
            return false;
        }

        info!(tag, "Background sync triggered");
        self.emit(ServiceWorkerEvent::SyncCompleted {
            tag: tag.to_string(),
        });
        true
    }

    /// Push message: show a notification.
    pub async fn handle_push(&self, payload: Option<&str>) -> NotificationId {
        let notification = Notification::from_push(&self.config.notification, payload, now_millis());
        let title = notification.title.clone();
        let id = self.notifications.write().await.show(notification);

        info!(id = id.raw(), %title, "Showing notification");
        self.emit(ServiceWorkerEvent::NotificationShown { id, title });
        id
    }

    /// Notification click: close it and open a window on the game.
    pub async fn handle_notification_click(
        &self,
        id: NotificationId,
    ) -> Result<Client, ServiceWorkerError> {
        self.notifications
            .write()
            .await
            .close(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {}", id.raw())))?;
        info!(id = id.raw(), "Notification clicked");
        self.emit(ServiceWorkerEvent::NotificationClicked { id });

        let client = self
            .clients
            .write()
            .await
            .open_window(self.config.open_url.clone(), &self.bucket);
        self.emit(ServiceWorkerEvent::WindowOpened {
            client_id: client.id.clone(),
            url: client.url.to_string(),
        });
        Ok(client)
    }

    /// Notifications currently showing.
    pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
        self.notifications.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStore;
    use async_trait::async_trait;
    use http::StatusCode;
    use lizard_net::NetError;

    /// Serves every URL with 200 and its path as the body.
    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Ok(Response::new(
                request.url.clone(),
                StatusCode::OK,
                request.url.path().to_string(),
            ))
        }
    }

    fn manager() -> (
        OfflineCacheManager<MemoryCacheStore, EchoFetcher>,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    ) {
        let config = WorkerConfig::from_config(&OfflineConfig {
            origin: "https://lizard.example/".to_string(),
            ..Default::default()
        })
        .unwrap();
        OfflineCacheManager::new(config, MemoryCacheStore::new(), EchoFetcher)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_worker_config_from_defaults() {
        let config = WorkerConfig::from_config(&OfflineConfig::default()).unwrap();
        assert_eq!(config.cache_name.to_string(), "lizard-tap-v1.0.0");
        assert_eq!(config.manifest.len(), 7);
        assert_eq!(config.shell_url.as_str(), "http://localhost:8080/index.html");
        assert_eq!(config.open_url.as_str(), "http://localhost:8080/");
    }

    #[test]
    fn test_worker_config_rejects_invalid() {
        let bad = OfflineConfig {
            version: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            WorkerConfig::from_config(&bad),
            Err(ServiceWorkerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_states_and_events() {
        let (manager, mut rx) = manager();
        assert_eq!(manager.state(), ServiceWorkerState::Parsed);

        manager.install().await.unwrap();
        assert_eq!(manager.state(), ServiceWorkerState::Installed);
        manager.activate().await.unwrap();
        assert_eq!(manager.state(), ServiceWorkerState::Activated);

        let events = drain(&mut rx);
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ServiceWorkerEvent::StateChange { new_state, .. } => Some(*new_state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
        assert!(events.contains(&ServiceWorkerEvent::SkipWaiting {
            bucket: "lizard-tap-v1.0.0".to_string(),
            install_succeeded: true,
        }));
    }

    #[tokio::test]
    async fn test_activate_before_install_fails() {
        let (manager, _rx) = manager();
        assert!(matches!(
            manager.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_claims_existing_clients() {
        let (manager, mut rx) = manager();
        manager
            .add_client(Client::window(Url::parse("https://lizard.example/").unwrap()))
            .await;

        manager.install().await.unwrap();
        manager.activate().await.unwrap();

        assert!(manager.clients().await.iter().all(Client::is_controlled));
        assert!(drain(&mut rx).contains(&ServiceWorkerEvent::ClientsClaimed {
            bucket: "lizard-tap-v1.0.0".to_string(),
            count: 1,
        }));
    }

    async fn seed(store: &MemoryCacheStore, manifest: &[Url]) {
        for url in manifest {
            let response = Response::new(url.clone(), StatusCode::OK, "seeded");
            let entry = CacheEntry::from_response(
                &Request::get(url.clone()),
                &response,
                ResponseKind::Success,
            );
            store.put("lizard-tap-v1.0.0", entry).await.unwrap();
        }
    }

    async fn body_of(
        manager: &OfflineCacheManager<MemoryCacheStore, EchoFetcher>,
        path: &str,
    ) -> Vec<u8> {
        let url = manager.config().origin.join(path).unwrap();
        manager.serve(&Request::get(url)).await.unwrap().body.to_vec()
    }

    #[tokio::test]
    async fn test_start_resumes_complete_bucket_without_fetching() {
        let (manager, _rx) = manager();
        seed(manager.store(), &manager.config().manifest).await;

        manager.start().await.unwrap();

        assert_eq!(manager.state(), ServiceWorkerState::Activated);
        assert!(manager.precache_complete());
        assert_eq!(body_of(&manager, "/style.css").await, b"seeded");
    }

    #[tokio::test]
    async fn test_start_reinstalls_incomplete_bucket() {
        let (manager, _rx) = manager();
        let manifest = manager.config().manifest.clone();
        seed(manager.store(), &manifest[..manifest.len() - 1]).await;

        manager.start().await.unwrap();

        assert!(manager.precache_complete());
        assert_eq!(body_of(&manager, "/style.css").await, b"/style.css");
        assert_eq!(
            manager.store().entries("lizard-tap-v1.0.0").await.unwrap().len(),
            manifest.len()
        );
    }

    #[tokio::test]
    async fn test_serve_waits_for_activation() {
        let (manager, _rx) = manager();
        let manager = std::sync::Arc::new(manager);
        let request = Request::get(Url::parse("https://lizard.example/style.css").unwrap());

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve(&request).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        manager.start().await.unwrap();
        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.source, ResponseSource::Cache);
    }

    #[tokio::test]
    async fn test_sync_push_and_click() {
        let (manager, mut rx) = manager();

        assert!(manager.handle_sync("background-sync-score").await);
        assert!(!manager.handle_sync("other-tag").await);

        let id = manager.handle_push(Some("Your streak is waiting")).await;
        let shown = manager.notification(id).await.unwrap();
        assert_eq!(shown.title, "Lizard Tap Game");
        assert_eq!(shown.body, "Your streak is waiting");

        let client = manager.handle_notification_click(id).await.unwrap();
        assert_eq!(client.url.as_str(), "https://lizard.example/");
        assert!(client.focused);
        assert!(manager.notification(id).await.is_none());
        assert!(matches!(
            manager.handle_notification_click(id).await,
            Err(ServiceWorkerError::NotFound(_))
        ));

        let events = drain(&mut rx);
        assert!(events.contains(&ServiceWorkerEvent::SyncCompleted {
            tag: "background-sync-score".to_string()
        }));
        assert!(events.contains(&ServiceWorkerEvent::NotificationClicked { id }));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServiceWorkerEvent::WindowOpened { .. })));
    }

    #[tokio::test]
    async fn test_repeated_clicks_reuse_one_window() {
        let (manager, _rx) = manager();

        let mut opened = Vec::new();
        for _ in 0..3 {
            let id = manager.handle_push(None).await;
            opened.push(manager.handle_notification_click(id).await.unwrap().id);
        }
        opened.dedup();
        assert_eq!(opened.len(), 1);
        assert_eq!(manager.clients().await.len(), 1);

        assert!(manager.remove_client(&opened[0]).await.is_some());
        assert!(manager.clients().await.is_empty());
    }
}
