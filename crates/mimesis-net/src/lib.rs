//! # Mimesis Net
//!
//! Requests, responses and network fetchers used by the Mimesis offline worker.
//!
//! ## Design Goals
//!
//! 1. **One fetch seam**: the worker only sees the [`Fetcher`] trait
//! 2. **Single-use bodies**: a [`Response`] body is consumed by value; [`Response::tee`]
//!    is the only way to read it twice
//! 3. **Response classification**: every response carries a [`ResponseType`] so
//!    callers can tell same-origin, CORS and opaque results apart

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod http_fetcher;
pub mod memory;
pub mod pattern;

pub use http_fetcher::HttpFetcher;
pub use memory::MemoryOrigin;
pub use pattern::{BypassList, PatternType, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("Body stream error: {0}")]
    Body(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
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

/// Request mode, as set by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Only same-origin targets are allowed.
    SameOrigin,
    /// Cross-origin allowed, response readable if the server opts in.
    #[default]
    Cors,
    /// Cross-origin allowed, response is opaque.
    NoCors,
}

/// What the requested resource will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// A full page document.
    Document,
    Style,
    Script,
    Image,
    Font,
    Manifest,
    /// `fetch()` / XHR and anything without a specific destination.
    #[default]
    Empty,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub destination: Destination,
    pub timeout: Option<Duration>,
}

impl Request {
    fn with_method(url: Url, method: Method) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            destination: Destination::default(),
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::with_method(url, Method::GET)
    }

    /// Create a page navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url)
            .mode(RequestMode::Navigate)
            .destination(Destination::Document)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::with_method(url, Method::POST);
        request.body = Some(body);
        request
    }

    /// Override the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request loads a full page document.
    pub fn is_navigation(&self) -> bool {
        self.destination == Destination::Document
    }
}

/// How a response was obtained, from the requester's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseType {
    /// Same-origin response with full access.
    #[default]
    Basic,
    /// Cross-origin response the server allowed.
    Cors,
    /// Cross-origin `no-cors` response; status and body are hidden.
    Opaque,
    /// Synthesised network error.
    Error,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

/// HTTP response.
///
/// The body can be read once; reading consumes the response.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub redirected: bool,
    body: ResponseBody,
}

impl Response {
    /// Create a basic response with an empty body.
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url,
            status,
            status_text: reason_phrase(status).to_string(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            redirected: false,
            body: ResponseBody::Empty,
        }
    }

    /// Create an opaque response: status 0, no headers, no body.
    pub fn opaque(url: Url) -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            response_type: ResponseType::Opaque,
            ..Self::new(url, 0)
        }
    }

    /// Create a network error response.
    pub fn error(url: Url) -> Self {
        Self {
            status: 0,
            status_text: String::new(),
            response_type: ResponseType::Error,
            ..Self::new(url, 0)
        }
    }

    /// Set a fully loaded body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Set a streaming body fed by `rx`.
    pub fn with_stream(mut self, rx: mpsc::Receiver<Result<Bytes, NetError>>) -> Self {
        self.body = ResponseBody::Stream(rx);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace all headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Mark the response as the result of following redirects.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the body is still a live stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        read_body(self.body).await
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }

    /// Split into two responses with independent bodies.
    ///
    /// A streaming body is drained first, so neither copy depends on the
    /// other being read.
    pub async fn tee(self) -> Result<(Response, Response), NetError> {
        let Response {
            url,
            status,
            status_text,
            headers,
            response_type,
            redirected,
            body,
        } = self;

        let body = match body {
            ResponseBody::Empty => None,
            other => Some(read_body(other).await?),
        };

        let make = |body: Option<Bytes>| Response {
            url: url.clone(),
            status,
            status_text: status_text.clone(),
            headers: headers.clone(),
            response_type,
            redirected,
            body: body.map_or(ResponseBody::Empty, ResponseBody::Full),
        };

        Ok((make(body.clone()), make(body)))
    }
}

async fn read_body(body: ResponseBody) -> Result<Bytes, NetError> {
    match body {
        ResponseBody::Full(b) => Ok(b),
        ResponseBody::Stream(mut rx) => {
            let mut buf = BytesMut::new();
            while let Some(chunk) = rx.recv().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok(buf.freeze())
        }
        ResponseBody::Empty => Ok(Bytes::new()),
    }
}

fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

/// Issues requests to the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a request.
    ///
    /// `Err` means no response could be obtained at all (offline, DNS, TLS).
    /// HTTP error statuses come back as `Ok` responses.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Capacity of the chunk channel for streamed bodies.
    pub stream_buffer: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Mimesis-Worker/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            stream_buffer: 16,
        }
    }
}
