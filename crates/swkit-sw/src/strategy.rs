//! Fetch strategies.
//!
//! Store writes for freshly fetched responses run on spawned tasks. The
//! caller gets its copy of the response immediately; the write may land
//! before or after the caller reads it.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::StatusCode;
use swkit_net::{Fetcher, Request, Response, ResponseType};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::classifier::RoutingClass;
use crate::error::ServiceWorkerError;
use crate::store::{Cache, RequestKey, StoredResponse};

/// How a request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Store first, network on miss.
    CacheFirst,
    /// Network first, store on failure.
    NetworkFirst,
}

impl Strategy {
    /// Strategy for a routing class; `None` means the request is not intercepted.
    pub fn for_class(class: RoutingClass) -> Option<Self> {
        match class {
            RoutingClass::Precached | RoutingClass::StaticAsset => Some(Strategy::CacheFirst),
            RoutingClass::ApiCall => Some(Strategy::NetworkFirst),
            RoutingClass::Unmatched => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::CacheFirst => write!(f, "cache-first"),
            Strategy::NetworkFirst => write!(f, "network-first"),
        }
    }
}

/// Whether a network response may be written to the store.
///
/// Only complete same-origin 200s qualify; opaque and CORS responses are
/// handed back to the caller but never stored.
pub fn is_storable(response: &Response) -> bool {
    response.status == StatusCode::OK && response.response_type == ResponseType::Basic
}

/// Counts background writes so callers can wait for the store to settle.
#[derive(Debug, Default)]
struct PendingWrites {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl PendingWrites {
    fn begin(self: &Arc<Self>) -> WriteGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        WriteGuard(Arc::clone(self))
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    async fn settled(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct WriteGuard(Arc<PendingWrites>);

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Runs cache-first and network-first against one generation.
pub struct StrategyEngine {
    cache: Cache,
    fetcher: Arc<dyn Fetcher>,
    writes: Arc<PendingWrites>,
}

impl StrategyEngine {
    pub fn new(cache: Cache, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache,
            fetcher,
            writes: Arc::default(),
        }
    }

    /// Generation this engine reads from and writes to.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Run `strategy` for `request`.
    pub async fn execute(
        &self,
        strategy: Strategy,
        request: Request,
    ) -> Result<Response, ServiceWorkerError> {
        match strategy {
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NetworkFirst => self.network_first(request).await,
        }
    }

    /// Serve from the store; fetch and store on a miss.
    pub async fn cache_first(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let key = RequestKey::for_request(&request);

        if let Some(stored) = self.lookup(&key).await {
            debug!(key = %key, "Cache hit");
            return Ok(stored.to_response());
        }

        debug!(key = %key, "Cache miss");
        let response = self.fetcher.fetch(request).await?;
        Ok(self.store_if_storable(key, response))
    }

    /// Fetch and store; serve from the store when the network fails.
    ///
    /// A non-OK response counts as a failure: the stored copy wins if there
    /// is one, otherwise the response is passed through uncached.
    pub async fn network_first(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let key = RequestKey::for_request(&request);

        match self.fetcher.fetch(request).await {
            Ok(response) if response.ok() => Ok(self.store_if_storable(key, response)),
            Ok(response) => match self.lookup(&key).await {
                Some(stored) => {
                    debug!(key = %key, status = %response.status, "Network not OK, serving cached copy");
                    Ok(stored.to_response())
                }
                None => Ok(response),
            },
            Err(error) => match self.lookup(&key).await {
                Some(stored) => {
                    debug!(key = %key, error = %error, "Network failed, serving cached copy");
                    Ok(stored.to_response())
                }
                None => Err(error.into()),
            },
        }
    }

    /// Wait until every background store write has finished.
    pub async fn settled(&self) {
        self.writes.settled().await;
    }

    /// Number of background store writes still running.
    pub fn pending_writes(&self) -> usize {
        self.writes.in_flight()
    }

    async fn lookup(&self, key: &RequestKey) -> Option<StoredResponse> {
        match self.cache.match_request(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed; treating as miss");
                None
            }
        }
    }

    fn store_if_storable(&self, key: RequestKey, response: Response) -> Response {
        if !is_storable(&response) {
            trace!(
                key = %key,
                status = %response.status,
                response_type = ?response.response_type,
                "Response not storable"
            );
            return response;
        }

        let (response, copy) = response.tee();
        self.store_in_background(key, copy);
        response
    }

    fn store_in_background(&self, key: RequestKey, copy: Response) {
        let cache = self.cache.clone();
        let guard = self.writes.begin();

        tokio::spawn(async move {
            let _guard = guard;

            let stored = match StoredResponse::capture(copy).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not read response copy; not stored");
                    return;
                }
            };

            match cache.put(key.clone(), stored).await {
                Ok(()) => debug!(key = %key, generation = %cache.generation(), "Stored"),
                Err(e) => warn!(key = %key, error = %e, "Cache write failed"),
            }
        });
    }
}
