//! # Lizard Service Worker
//!
//! Offline cache manager for the Lizard Tap game.
//!
//! ## Features
//!
//! - **Install**: precache the asset manifest into the versioned bucket
//! - **Activate**: prune every bucket that is not the current version, claim clients
//! - **Serve**: cache-first lookup, write-through population, offline shell fallback
//! - **Auxiliary triggers**: background sync, push notifications, notification clicks
//!
//! ## Architecture
//!
//! ```text
//! OfflineCacheManager
//!     │
//!     ├── CacheStore (injected)
//!     │       └── bucket "{name}-v{version}"
//!     │               └── URL → CacheEntry
//!     │
//!     ├── Fetcher (injected network)
//!     ├── Clients (controlled pages)
//!     └── Notifications
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use lizard_net::{cache_key_for, Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod clients;
pub mod manager;
pub mod notifications;
pub mod store;

pub use clients::{Client, ClientType, Clients};
pub use manager::{OfflineCacheManager, WorkerConfig};
pub use notifications::{Notification, NotificationData, NotificationId, Notifications};
pub use store::{CacheStore, DiskCacheStore, MemoryCacheStore, StoreError};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for ServiceWorkerError {
    fn from(e: StoreError) -> Self {
        ServiceWorkerError::CacheError(e.to_string())
    }
}

// ==================== Types ====================

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not yet run.
    #[default]
    Parsed,
    /// Precaching the manifest.
    Installing,
    /// Install finished, waiting for activation. The manifest may be incomplete
    /// if precaching failed.
    Installed,
    /// Pruning stale buckets.
    Activating,
    /// Serving requests.
    Activated,
}

/// Versioned bucket name, `{logical}-v{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheName {
    logical: String,
    version: String,
}

impl CacheName {
    pub fn new(logical: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            logical: logical.into(),
            version: version.into(),
        }
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether a stored bucket name is this exact version.
    pub fn is_current(&self, name: &str) -> bool {
        name.strip_prefix(self.logical.as_str())
            .and_then(|rest| rest.strip_prefix("-v"))
            .is_some_and(|version| version == self.version)
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.logical, self.version)
    }
}

impl FromStr for CacheName {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once("-v") {
            Some((logical, version)) if !logical.is_empty() && !version.is_empty() => {
                Ok(Self::new(logical, version))
            }
            _ => Err(ServiceWorkerError::Config(format!(
                "bucket name {s:?} is not of the form name-vVERSION"
            ))),
        }
    }
}

/// How a network response is treated by the cache, decided once when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Same-origin, status 200. The only cacheable kind.
    Success,
    /// Same-origin with a non-error status other than 200 (204, 206, 304, ...).
    OtherStatus,
    /// Same-origin 4xx or 5xx.
    ClientOrServerError,
    /// Cross-origin; treated as opaque regardless of status.
    OpaqueCrossOrigin,
}

impl ResponseKind {
    pub fn classify(status: StatusCode, same_origin: bool) -> Self {
        if !same_origin {
            Self::OpaqueCrossOrigin
        } else if status == StatusCode::OK {
            Self::Success
        } else if status.is_client_error() || status.is_server_error() {
            Self::ClientOrServerError
        } else {
            Self::OtherStatus
        }
    }

    pub fn is_cacheable(&self) -> bool {
        *self == Self::Success
    }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Hit in the current bucket; no network access happened.
    Cache,
    /// Live network response.
    Network,
    /// Network failed on a navigation; the cached shell document was served.
    OfflineShell,
}

// ==================== Cache Entry ====================

/// A stored response, keyed by request URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the cache key).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in arrival order. Repeated names keep every value.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "store::base64_body")]
    pub body: Vec<u8>,

    /// Classification at receipt time.
    pub kind: ResponseKind,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a network response for the given request.
    pub fn from_response(request: &Request, response: &Response, kind: ResponseKind) -> Self {
        Self {
            url: cache_key_for(&request.url).to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers: header_map_to_strings(&response.headers),
            body: response.body.to_vec(),
            kind,
            cached_at: now_millis(),
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

// ==================== Fetch Response ====================

/// The response handed back to the page for an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub kind: ResponseKind,
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a response from a cache entry.
    pub fn from_cache(entry: CacheEntry, source: ResponseSource) -> Self {
        Self {
            url: entry.url,
            status: entry.status,
            headers: entry.headers,
            body: Bytes::from(entry.body),
            kind: entry.kind,
            source,
        }
    }

    /// Pass a live network response through.
    pub fn from_network(response: Response, kind: ResponseKind) -> Self {
        Self {
            url: response.url.to_string(),
            status: response.status.as_u16(),
            headers: header_map_to_strings(&response.headers),
            body: response.body,
            kind,
            source: ResponseSource::Network,
        }
    }

    pub fn from_cache_hit(&self) -> bool {
        self.source != ResponseSource::Network
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

// ==================== Events ====================

/// Signals the manager emits to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// Lifecycle state changed.
    StateChange {
        bucket: String,
        new_state: ServiceWorkerState,
    },
    /// Install finished and the worker does not wait for older versions.
    SkipWaiting { bucket: String, install_succeeded: bool },
    /// A stale bucket was removed during activation.
    StaleCacheDeleted { name: String },
    /// Open pages are now controlled by this version.
    ClientsClaimed { bucket: String, count: usize },
    /// A push produced a visible notification.
    NotificationShown { id: NotificationId, title: String },
    /// The user clicked a notification.
    NotificationClicked { id: NotificationId },
    /// A window was opened on behalf of the worker.
    WindowOpened { client_id: String, url: String },
    /// A background sync tag was handled.
    SyncCompleted { tag: String },
}

// ==================== Helpers ====================

fn header_map_to_strings(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            (name.as_str().to_string(), value)
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
