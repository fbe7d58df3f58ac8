//! # swkit Service Worker
//!
//! Offline caching worker that sits between a web application and the network.
//!
//! ## Features
//!
//! - **Versioned store**: responses grouped into generations, deleted a whole generation at a time
//! - **Lifecycle**: all-or-nothing precache on install, stale generation cleanup on activate
//! - **Routing**: one routing class per request, by fixed precedence
//! - **Strategies**: cache-first for static content, network-first for API calls
//!
//! ## Architecture
//!
//! ```text
//! EventRouter
//!     ├── LifecycleController ── VersionedStore ── CacheBackend
//!     ├── RequestClassifier
//!     └── StrategyEngine ──────┬─ Cache (current generation)
//!                              └─ Fetcher (network)
//! ```

pub mod classifier;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod router;
pub mod store;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use classifier::{RequestClassifier, RoutingClass, DEFAULT_API_PREFIX};
pub use config::{ConfigError, PrecacheManifest, WorkerConfig};
pub use error::{ServiceWorkerError, StoreError};
pub use lifecycle::{ActivationReport, LifecycleController, ServiceWorkerEvent, WorkerState};
pub use router::{EventRouter, FetchDecision, FetchEvent, ResponseFuture};
pub use store::{
    Cache, CacheBackend, Generation, MemoryBackend, RequestKey, StoredResponse, VersionedStore,
};
pub use strategy::{is_storable, Strategy, StrategyEngine};
