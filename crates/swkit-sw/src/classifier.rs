//! Request classification.
//!
//! Every intercepted request gets exactly one [`RoutingClass`]. Rules are
//! evaluated in [`RoutingClass::PRECEDENCE`] order and the first match wins,
//! so the outcome never depends on the order requests arrive in.

use std::fmt;

use hashbrown::HashSet;
use http::Method;
use swkit_net::{Destination, Request};
use tracing::trace;
use url::Url;

use crate::store::RequestKey;

/// Path segment reserved for backend API calls.
pub const DEFAULT_API_PREFIX: &str = "/api/";

/// Routing class of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingClass {
    /// Listed in the precache manifest.
    Precached,
    /// Backend API call.
    ApiCall,
    /// Image, stylesheet or script.
    StaticAsset,
    /// Anything else; left to the network.
    Unmatched,
}

impl RoutingClass {
    /// Evaluation order, highest precedence first.
    pub const PRECEDENCE: [RoutingClass; 4] = [
        RoutingClass::Precached,
        RoutingClass::ApiCall,
        RoutingClass::StaticAsset,
        RoutingClass::Unmatched,
    ];
}

impl fmt::Display for RoutingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingClass::Precached => write!(f, "precached"),
            RoutingClass::ApiCall => write!(f, "api-call"),
            RoutingClass::StaticAsset => write!(f, "static-asset"),
            RoutingClass::Unmatched => write!(f, "unmatched"),
        }
    }
}

/// Assigns routing classes to requests.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    precached: HashSet<RequestKey>,
    api_prefix: String,
}

impl RequestClassifier {
    /// Create a classifier for the resolved precache manifest.
    pub fn new<'a>(precache: impl IntoIterator<Item = &'a Url>) -> Self {
        Self {
            precached: precache.into_iter().map(RequestKey::get).collect(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
        }
    }

    /// Use a different reserved API path segment.
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    /// Classify a request.
    ///
    /// Only GET requests are candidates for caching; every other method is
    /// [`RoutingClass::Unmatched`].
    pub fn classify(&self, request: &Request) -> RoutingClass {
        if request.method != Method::GET {
            return RoutingClass::Unmatched;
        }

        let class = RoutingClass::PRECEDENCE
            .into_iter()
            .find(|class| self.matches(*class, request))
            .unwrap_or(RoutingClass::Unmatched);

        trace!(url = %request.url, class = %class, "Request classified");
        class
    }

    fn matches(&self, class: RoutingClass, request: &Request) -> bool {
        match class {
            RoutingClass::Precached => self.precached.contains(&RequestKey::for_request(request)),
            RoutingClass::ApiCall => request.url.path().contains(self.api_prefix.as_str()),
            RoutingClass::StaticAsset => matches!(
                request.destination,
                Destination::Image | Destination::Style | Destination::Script
            ),
            RoutingClass::Unmatched => true,
        }
    }
}
