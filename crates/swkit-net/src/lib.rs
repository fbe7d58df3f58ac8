//! # swkit Net
//!
//! Request and response model plus the network fetcher used by the offline worker.
//!
//! ## Design Goals
//!
//! 1. **Single-read bodies**: a [`Response`] body can be consumed exactly once
//! 2. **Explicit duplication**: [`Response::tee`] splits a response into two readers
//! 3. **Pluggable network**: the worker only talks to the [`Fetcher`] trait

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;
use url::{Origin, Url};

pub mod fetcher;

pub use fetcher::{Fetcher, HttpFetcher, LoaderConfig};

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
    Unreachable(String),

    #[error("Body read failed: {0}")]
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

/// What kind of resource the page asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Destination {
    /// No declared destination (`fetch()`, XHR).
    #[default]
    Empty,
    Document,
    Image,
    Style,
    Script,
    Font,
    Manifest,
    Worker,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Empty => "",
            Destination::Document => "document",
            Destination::Image => "image",
            Destination::Style => "style",
            Destination::Script => "script",
            Destination::Font => "font",
            Destination::Manifest => "manifest",
            Destination::Worker => "worker",
        }
    }
}

impl FromStr for Destination {
    type Err = std::convert::Infallible;

    /// Unknown destinations map to [`Destination::Empty`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "document" => Destination::Document,
            "image" => Destination::Image,
            "style" => Destination::Style,
            "script" => Destination::Script,
            "font" => Destination::Font,
            "manifest" => Destination::Manifest,
            "worker" => Destination::Worker,
            _ => Destination::Empty,
        })
    }
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: Destination,
    pub timeout: Option<Duration>,
    pub referrer: Option<Url>,
    /// Origin of the page that issued the request.
    pub client_origin: Option<Origin>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            destination: Destination::Empty,
            timeout: None,
            referrer: None,
            client_origin: None,
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the declared destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set referrer.
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    /// Mark the request as issued by a page on `origin`.
    pub fn from_origin(mut self, origin: Origin) -> Self {
        self.client_origin = Some(origin);
        self
    }
}

/// Response type, as seen by the page that issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response; fully inspectable.
    #[default]
    Basic,
    /// Cross-origin response allowed by CORS headers.
    Cors,
    /// Cross-origin response whose contents cannot be verified.
    Opaque,
    /// Network error.
    Error,
}

/// Response body variants.
#[derive(Debug)]
pub enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body from the network.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// One branch of a teed stream.
    Teed(mpsc::UnboundedReceiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

impl ResponseBody {
    fn tee(self) -> (ResponseBody, ResponseBody) {
        match self {
            ResponseBody::Full(bytes) => (ResponseBody::Full(bytes.clone()), ResponseBody::Full(bytes)),
            ResponseBody::Empty => (ResponseBody::Empty, ResponseBody::Empty),
            ResponseBody::Stream(rx) => tee_stream(ChunkSource::Bounded(rx)),
            ResponseBody::Teed(rx) => tee_stream(ChunkSource::Unbounded(rx)),
        }
    }

    async fn collect(self) -> Result<Bytes, NetError> {
        let mut source = match self {
            ResponseBody::Full(bytes) => return Ok(bytes),
            ResponseBody::Empty => return Ok(Bytes::new()),
            ResponseBody::Stream(rx) => ChunkSource::Bounded(rx),
            ResponseBody::Teed(rx) => ChunkSource::Unbounded(rx),
        };
        let mut buf = BytesMut::new();
        while let Some(chunk) = source.recv().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

enum ChunkSource {
    Bounded(mpsc::Receiver<Result<Bytes, NetError>>),
    Unbounded(mpsc::UnboundedReceiver<Result<Bytes, NetError>>),
}

impl ChunkSource {
    async fn recv(&mut self) -> Option<Result<Bytes, NetError>> {
        match self {
            ChunkSource::Bounded(rx) => rx.recv().await,
            ChunkSource::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// Fan a chunk stream out to two unbounded readers.
///
/// Branches buffer independently, so a reader that lags behind never
/// stalls the other one.
fn tee_stream(mut source: ChunkSource) -> (ResponseBody, ResponseBody) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(chunk) = source.recv().await {
            let copy = match &chunk {
                Ok(bytes) => Ok(bytes.clone()),
                Err(e) => Err(NetError::Body(e.to_string())),
            };
            let left_open = left_tx.send(chunk).is_ok();
            let right_open = right_tx.send(copy).is_ok();
            if !left_open && !right_open {
                break;
            }
        }
    });

    (ResponseBody::Teed(left_rx), ResponseBody::Teed(right_rx))
}

/// HTTP response with a single-read body.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    body: ResponseBody,
}

impl Response {
    /// Create a basic response from parts.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            url,
            status,
            headers,
            response_type: ResponseType::Basic,
            body,
        }
    }

    /// Create a basic 200 response with a fully loaded body.
    pub fn ok_with_body(url: Url, body: impl Into<Bytes>) -> Self {
        Self::new(url, StatusCode::OK, HeaderMap::new(), ResponseBody::Full(body.into()))
    }

    /// The response handed to a page whose request could not be completed.
    pub fn network_error(url: Url) -> Self {
        Self {
            url,
            // StatusCode cannot represent 0; error responses carry no status
            // worth inspecting and are identified by their type instead.
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: HeaderMap::new(),
            response_type: ResponseType::Error,
            body: ResponseBody::Empty,
        }
    }

    /// Override the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.response_type != ResponseType::Error && self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Split into two responses that can be read independently.
    ///
    /// Consumes `self`, so a body can never be read and then duplicated.
    /// Streaming bodies are pumped by a spawned task and must be teed from
    /// within a Tokio runtime.
    pub fn tee(self) -> (Response, Response) {
        let (left, right) = self.body.tee();
        let copy = Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            response_type: self.response_type,
            body: right,
        };
        let original = Response {
            url: self.url,
            status: self.status,
            headers: self.headers,
            response_type: self.response_type,
            body: left,
        };
        (original, copy)
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        self.body.collect().await
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::Body(e.to_string()))
    }
}
