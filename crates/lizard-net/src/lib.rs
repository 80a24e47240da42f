//! # Lizard Net
//!
//! Request/response model and the network seam used by the offline cache.
//!
//! ## Design Goals
//!
//! 1. **Injectable network**: the cache manager only sees the [`Fetcher`] trait,
//!    so tests can substitute a scripted fake
//! 2. **Browser-shaped requests**: every request carries its destination, which
//!    decides whether an offline navigation can fall back to the cached shell
//! 3. **Async HTTP**: [`HttpFetcher`] wraps a `reqwest` client for real origins

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, trace};
use url::{Position, Url};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Origin unreachable: {0}")]
    Offline(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// Top-level navigation.
    Document,
    Script,
    Style,
    Image,
    Audio,
    Font,
    Manifest,
    /// fetch()/XHR and anything unclassified.
    #[default]
    Empty,
}

impl RequestDestination {
    /// Guess a destination from a URL path extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("html") | Some("htm") => Self::Document,
            Some("js") | Some("mjs") => Self::Script,
            Some("css") => Self::Style,
            Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("svg") | Some("webp") => {
                Self::Image
            }
            Some("mp3") | Some("wav") | Some("ogg") => Self::Audio,
            Some("woff") | Some("woff2") | Some("ttf") => Self::Font,
            Some("json") | Some("webmanifest") => Self::Manifest,
            _ => Self::Empty,
        }
    }
}

/// An outgoing request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub destination: RequestDestination,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            destination: RequestDestination::Empty,
        }
    }

    /// Create a top-level document navigation.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_destination(RequestDestination::Document)
    }

    /// Set the HTTP method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the destination.
    pub fn with_destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this is a top-level document navigation.
    pub fn is_navigation(&self) -> bool {
        self.destination == RequestDestination::Document
    }

    /// Cache identity. Only GET requests have one.
    pub fn cache_key(&self) -> Option<&str> {
        (self.method == Method::GET).then(|| cache_key_for(&self.url))
    }
}

/// The URL as a cache key: everything up to and including the query.
///
/// Fragments never reach the server, so `/style.css#top` and `/style.css`
/// share an entry.
pub fn cache_key_for(url: &Url) -> &str {
    &url[..Position::AfterQuery]
}

/// A fully received response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects.
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether any redirect was followed.
    pub redirected: bool,
}

impl Response {
    /// Build a response with no headers.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            redirected: false,
        }
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the response came from the same origin as `origin`.
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }
}

/// The network as seen by the cache layer.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. `Err` means no response arrived at all.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        (**self).fetch(request).await
    }
}

/// Loader configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout. `None` leaves fetches unbounded.
    pub timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("LizardTap/{}", env!("CARGO_PKG_VERSION")),
            timeout: None,
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by a `reqwest` client.
pub struct HttpFetcher {
    client: Client,
    timeout: Option<Duration>,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        debug!(user_agent = %config.user_agent, timeout = ?config.timeout, "HttpFetcher initialized");

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                NetError::Offline(e.to_string())
            } else if e.is_timeout() {
                NetError::Timeout(self.timeout.unwrap_or_default())
            } else {
                NetError::Http(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = url != request.url;
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            body,
            redirected,
        })
    }
}
