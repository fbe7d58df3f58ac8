//! Versioned response store.
//!
//! ```text
//! VersionedStore
//!     └── Generation ("ssait-odonto-v1")
//!             └── RequestKey (GET url) → StoredResponse
//! ```
//!
//! Entries are only ever removed together with their whole generation.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use swkit_net::{NetError, Request, Response, ResponseBody};
use tokio::sync::RwLock;
use url::Url;

use crate::config::ConfigError;
use crate::error::StoreError;

const MAX_GENERATION_LEN: usize = 128;

// ==================== Keys ====================

/// Tag naming one version of the precache contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Generation(String);

impl Generation {
    /// Validate and wrap a tag.
    pub fn new(tag: impl Into<String>) -> Result<Self, ConfigError> {
        let tag = tag.into();
        let reason = if tag.is_empty() {
            Some("tag is empty")
        } else if tag.len() > MAX_GENERATION_LEN {
            Some("tag is longer than 128 bytes")
        } else if tag.chars().any(|c| c.is_whitespace() || c.is_control()) {
            Some("tag contains whitespace or control characters")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConfigError::InvalidGeneration { tag, reason }),
            None => Ok(Self(tag)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Generation {
    type Error = ConfigError;

    fn try_from(tag: String) -> Result<Self, Self::Error> {
        Self::new(tag)
    }
}

impl From<Generation> for String {
    fn from(generation: Generation) -> Self {
        generation.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache slot identity: method plus URL (query kept, fragment dropped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    url: String,
}

impl RequestKey {
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// Immutable snapshot of a response, captured at store time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    /// Final response URL.
    pub url: Url,

    /// Response status.
    pub status: StatusCode,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl StoredResponse {
    /// Drain a response into a snapshot.
    pub async fn capture(response: Response) -> Result<Self, NetError> {
        let url = response.url.clone();
        let status = response.status;
        let headers = response.headers.clone();
        let body = response.bytes().await?;
        Ok(Self {
            url,
            status,
            headers,
            body,
            cached_at: now_millis(),
        })
    }

    /// A fresh readable response carrying this snapshot.
    pub fn to_response(&self) -> Response {
        Response::new(
            self.url.clone(),
            self.status,
            self.headers.clone(),
            ResponseBody::Full(self.body.clone()),
        )
    }

    /// Bytes charged against a backend quota.
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Backend ====================

/// Storage the host provides for cached responses.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the generation if it does not exist.
    async fn open(&self, generation: &Generation) -> Result<(), StoreError>;

    /// Insert or overwrite one entry.
    async fn put(
        &self,
        generation: &Generation,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), StoreError>;

    /// Insert or overwrite a batch; either every entry lands or none does.
    async fn put_all(
        &self,
        generation: &Generation,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), StoreError>;

    /// Exact-key lookup.
    async fn get(
        &self,
        generation: &Generation,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StoreError>;

    /// All keys stored in a generation.
    async fn keys(&self, generation: &Generation) -> Result<Vec<RequestKey>, StoreError>;

    /// All generations currently present.
    async fn generations(&self) -> Result<Vec<Generation>, StoreError>;

    /// Remove a generation and every entry in it. Returns whether it existed.
    async fn delete(&self, generation: &Generation) -> Result<bool, StoreError>;
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    entries: HashMap<RequestKey, StoredResponse>,
    bytes: usize,
}

impl Bucket {
    fn bytes_after(&self, key: &RequestKey, response: &StoredResponse) -> usize {
        let replaced = self.entries.get(key).map_or(0, StoredResponse::size);
        self.bytes - replaced + response.size()
    }

    fn insert(&mut self, key: RequestKey, response: StoredResponse) {
        self.bytes = self.bytes_after(&key, &response);
        self.entries.insert(key, response);
    }
}

/// In-process [`CacheBackend`] with an optional per-generation byte quota.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    generations: RwLock<HashMap<Generation, Bucket>>,
    quota: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the body bytes each generation may hold.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            generations: RwLock::default(),
            quota: Some(quota),
        }
    }

    fn check_quota(&self, generation: &Generation, bytes: usize) -> Result<(), StoreError> {
        match self.quota {
            Some(quota) if bytes > quota => Err(StoreError::QuotaExceeded {
                generation: generation.to_string(),
                requested: bytes,
                available: quota,
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, generation: &Generation) -> Result<(), StoreError> {
        self.generations
            .write()
            .await
            .entry(generation.clone())
            .or_default();
        Ok(())
    }

    async fn put(
        &self,
        generation: &Generation,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), StoreError> {
        let mut generations = self.generations.write().await;
        let bucket = generations
            .get_mut(generation)
            .ok_or_else(|| StoreError::GenerationNotFound(generation.to_string()))?;

        self.check_quota(generation, bucket.bytes_after(&key, &response))?;
        bucket.insert(key, response);
        Ok(())
    }

    async fn put_all(
        &self,
        generation: &Generation,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), StoreError> {
        let mut generations = self.generations.write().await;
        let bucket = generations
            .get_mut(generation)
            .ok_or_else(|| StoreError::GenerationNotFound(generation.to_string()))?;

        let mut staged = bucket.clone();
        for (key, response) in entries {
            staged.insert(key, response);
        }
        self.check_quota(generation, staged.bytes)?;
        *bucket = staged;
        Ok(())
    }

    async fn get(
        &self,
        generation: &Generation,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StoreError> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .and_then(|bucket| bucket.entries.get(key))
            .cloned())
    }

    async fn keys(&self, generation: &Generation) -> Result<Vec<RequestKey>, StoreError> {
        Ok(self
            .generations
            .read()
            .await
            .get(generation)
            .map(|bucket| bucket.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn generations(&self) -> Result<Vec<Generation>, StoreError> {
        Ok(self.generations.read().await.keys().cloned().collect())
    }

    async fn delete(&self, generation: &Generation) -> Result<bool, StoreError> {
        Ok(self.generations.write().await.remove(generation).is_some())
    }
}

// ==================== Store ====================

/// A handle on one generation of the store.
#[derive(Clone)]
pub struct Cache {
    generation: Generation,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    /// Insert or overwrite an entry.
    pub async fn put(&self, key: RequestKey, response: StoredResponse) -> Result<(), StoreError> {
        self.backend.put(&self.generation, key, response).await
    }

    /// Insert a batch atomically.
    pub async fn put_all(&self, entries: Vec<(RequestKey, StoredResponse)>) -> Result<(), StoreError> {
        self.backend.put_all(&self.generation, entries).await
    }

    /// Exact-key lookup.
    pub async fn match_request(&self, key: &RequestKey) -> Result<Option<StoredResponse>, StoreError> {
        self.backend.get(&self.generation, key).await
    }

    pub async fn keys(&self) -> Result<Vec<RequestKey>, StoreError> {
        self.backend.keys(&self.generation).await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys().await?.len())
    }
}

/// Store holding every generation known to this client.
#[derive(Clone)]
pub struct VersionedStore {
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedStore").finish_non_exhaustive()
    }
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl VersionedStore {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Store backed by a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open a generation, creating it if it doesn't exist.
    pub async fn open(&self, generation: &Generation) -> Result<Cache, StoreError> {
        self.backend.open(generation).await?;
        Ok(self.cache(generation))
    }

    /// Handle on a generation without creating it.
    ///
    /// Writes through this handle fail until the generation is opened.
    pub fn cache(&self, generation: &Generation) -> Cache {
        Cache {
            generation: generation.clone(),
            backend: Arc::clone(&self.backend),
        }
    }

    pub async fn has(&self, generation: &Generation) -> Result<bool, StoreError> {
        Ok(self.generations().await?.contains(generation))
    }

    /// Get all generation tags, sorted.
    pub async fn generations(&self) -> Result<Vec<Generation>, StoreError> {
        let mut generations = self.backend.generations().await?;
        generations.sort();
        Ok(generations)
    }

    /// Delete a generation and all of its entries.
    pub async fn delete_generation(&self, generation: &Generation) -> Result<bool, StoreError> {
        self.backend.delete(generation).await
    }
}
