//! Scripted collaborators for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, StatusCode};
use swkit_net::{Fetcher, NetError, Request, Response, ResponseBody, ResponseType};

use crate::error::StoreError;
use crate::store::{CacheBackend, Generation, MemoryBackend, RequestKey, StoredResponse};

struct Route {
    status: StatusCode,
    body: Bytes,
    response_type: ResponseType,
}

/// A 500 served on one particular call to a URL, after a delay.
struct ScriptedFailure {
    call: usize,
    delay: Duration,
}

/// Fetcher answering from a fixed route table; unknown URLs get a 404.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Route>>,
    failures: Mutex<HashMap<String, ScriptedFailure>>,
    calls_per_url: Mutex<HashMap<String, usize>>,
    streamed: Mutex<HashMap<String, Vec<&'static str>>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        self.route_with_type(url, status, body, ResponseType::Basic);
    }

    pub fn route_with_type(
        &self,
        url: &str,
        status: u16,
        body: impl Into<Bytes>,
        response_type: ResponseType,
    ) {
        let route = Route {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.into(),
            response_type,
        };
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    /// Answer the `call`-th request for `url` (1-based) with a 500 after `delay`.
    pub fn fail_call(&self, url: &str, call: usize, delay: Duration) {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), ScriptedFailure { call, delay });
    }

    /// Answer `url` with a 200 whose body arrives as `chunks`.
    pub fn route_streamed(&self, url: &str, chunks: Vec<&'static str>) {
        self.streamed.lock().unwrap().insert(url.to_string(), chunks);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Unreachable(request.url.to_string()));
        }

        let nth = {
            let mut per_url = self.calls_per_url.lock().unwrap();
            let count = per_url.entry(request.url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self
            .failures
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .filter(|failure| failure.call == nth)
            .map(|failure| failure.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            return Ok(Response::new(
                request.url,
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderMap::new(),
                ResponseBody::Empty,
            ));
        }

        let chunks = self.streamed.lock().unwrap().get(request.url.as_str()).cloned();
        if let Some(chunks) = chunks {
            let (tx, rx) = tokio::sync::mpsc::channel(chunks.len().max(1));
            for chunk in chunks {
                tx.try_send(Ok(Bytes::from_static(chunk.as_bytes()))).unwrap();
            }
            return Ok(Response::new(
                request.url,
                StatusCode::OK,
                HeaderMap::new(),
                ResponseBody::Stream(rx),
            ));
        }

        let routes = self.routes.lock().unwrap();
        let response = match routes.get(request.url.as_str()) {
            Some(route) => Response::new(
                request.url.clone(),
                route.status,
                HeaderMap::new(),
                ResponseBody::Full(route.body.clone()),
            )
            .with_type(route.response_type),
            None => Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                ResponseBody::Empty,
            ),
        };
        Ok(response)
    }
}

/// [`MemoryBackend`] wrapper that fails on demand.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    undeletable: Mutex<HashSet<Generation>>,
    fail_reads: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_delete_of(&self, generation: Generation) {
        self.undeletable.lock().unwrap().insert(generation);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    async fn open(&self, generation: &Generation) -> Result<(), StoreError> {
        self.inner.open(generation).await
    }

    async fn put(
        &self,
        generation: &Generation,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), StoreError> {
        self.inner.put(generation, key, response).await
    }

    async fn put_all(
        &self,
        generation: &Generation,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), StoreError> {
        self.inner.put_all(generation, entries).await
    }

    async fn get(
        &self,
        generation: &Generation,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("read failed".to_string()));
        }
        self.inner.get(generation, key).await
    }

    async fn keys(&self, generation: &Generation) -> Result<Vec<RequestKey>, StoreError> {
        self.inner.keys(generation).await
    }

    async fn generations(&self) -> Result<Vec<Generation>, StoreError> {
        self.inner.generations().await
    }

    async fn delete(&self, generation: &Generation) -> Result<bool, StoreError> {
        if self.undeletable.lock().unwrap().contains(generation) {
            return Err(StoreError::Backend(format!("{generation} is locked")));
        }
        self.inner.delete(generation).await
    }
}
