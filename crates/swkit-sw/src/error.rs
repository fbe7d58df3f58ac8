//! Error types for the offline worker.

use swkit_net::NetError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by a [`CacheBackend`](crate::store::CacheBackend).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Quota exceeded for generation {generation}: {requested} bytes requested, {available} available")]
    QuotaExceeded {
        generation: String,
        requested: usize,
        available: usize,
    },

    #[error("Generation not found: {0}")]
    GenerationNotFound(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Errors that can surface from the worker.
///
/// Store write failures and stale-generation cleanup failures are absorbed
/// internally and never show up here.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Precache failed for {url}: {reason}")]
    PrecacheFailed { url: String, reason: String },

    #[error("Precache commit failed for generation {generation}: {source}")]
    PrecacheCommit {
        generation: String,
        #[source]
        source: StoreError,
    },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ServiceWorkerError {
    /// Whether this error rejected an install attempt.
    pub fn is_precache_failure(&self) -> bool {
        matches!(
            self,
            ServiceWorkerError::PrecacheFailed { .. } | ServiceWorkerError::PrecacheCommit { .. }
        )
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::PrecacheFailed { .. } | ServiceWorkerError::PrecacheCommit { .. } => {
                "precache"
            }
            ServiceWorkerError::Network(_) => "network",
            ServiceWorkerError::StateError(_) => "state",
            ServiceWorkerError::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let precache = ServiceWorkerError::PrecacheFailed {
            url: "/favicon.ico".into(),
            reason: "status 404".into(),
        };
        assert_eq!(precache.category(), "precache");
        assert!(precache.is_precache_failure());

        let network = ServiceWorkerError::from(NetError::Unreachable("offline".into()));
        assert_eq!(network.category(), "network");
        assert!(!network.is_precache_failure());
    }

    #[test]
    fn test_commit_failure_keeps_source() {
        let error = ServiceWorkerError::PrecacheCommit {
            generation: "v2".into(),
            source: StoreError::QuotaExceeded {
                generation: "v2".into(),
                requested: 10,
                available: 4,
            },
        };
        assert!(error.is_precache_failure());
        assert!(std::error::Error::source(&error).is_some());
    }
}
