//! Worker event surface.
//!
//! ```text
//! install  ──► LifecycleController::install
//! activate ──► LifecycleController::activate
//! fetch    ──► RequestClassifier ──► StrategyEngine ──► Response
//! ```

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use swkit_net::{Fetcher, Request, Response};
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument, Span};
use url::Url;

use crate::classifier::{RequestClassifier, RoutingClass};
use crate::config::WorkerConfig;
use crate::error::ServiceWorkerError;
use crate::lifecycle::{ActivationReport, LifecycleController, ServiceWorkerEvent, WorkerState};
use crate::store::{Generation, VersionedStore};
use crate::strategy::{Strategy, StrategyEngine};

/// Eventual response for an intercepted request.
pub type ResponseFuture = BoxFuture<'static, Result<Response, ServiceWorkerError>>;

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Client ID of the issuing page.
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// The single decision made for a fetch event.
pub enum FetchDecision {
    /// The worker answers with `response`.
    RespondWith {
        class: RoutingClass,
        strategy: Strategy,
        response: ResponseFuture,
    },
    /// Not intercepted; the host performs its default network fetch.
    Passthrough(Request),
}

impl FetchDecision {
    /// Routing class, if the request was intercepted.
    pub fn class(&self) -> Option<RoutingClass> {
        match self {
            FetchDecision::RespondWith { class, .. } => Some(*class),
            FetchDecision::Passthrough(_) => None,
        }
    }

    pub fn is_intercepted(&self) -> bool {
        matches!(self, FetchDecision::RespondWith { .. })
    }
}

impl fmt::Debug for FetchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchDecision::RespondWith { class, strategy, .. } => f
                .debug_struct("RespondWith")
                .field("class", class)
                .field("strategy", strategy)
                .finish_non_exhaustive(),
            FetchDecision::Passthrough(request) => {
                f.debug_tuple("Passthrough").field(&request.url).finish()
            }
        }
    }
}

/// Binds lifecycle, classification and strategies to the worker's events.
pub struct EventRouter {
    lifecycle: Arc<LifecycleController>,
    classifier: RequestClassifier,
    engine: Arc<StrategyEngine>,
    fetcher: Arc<dyn Fetcher>,
    /// Parent span for everything this worker does, tagged with its generation.
    span: Span,
}

impl EventRouter {
    /// Build a worker for `config`, controlling pages under `scope`.
    pub fn new(
        config: &WorkerConfig,
        scope: &Url,
        store: VersionedStore,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        let span = info_span!("worker", generation = %config.generation);
        let manifest = config.precache.resolve(scope)?;
        let classifier = RequestClassifier::new(manifest.iter());
        let engine = StrategyEngine::new(store.cache(&config.generation), Arc::clone(&fetcher));
        let (lifecycle, event_rx) = LifecycleController::new(
            config.generation.clone(),
            manifest,
            store,
            Arc::clone(&fetcher),
        );

        Ok((
            Self {
                lifecycle: Arc::new(lifecycle),
                classifier,
                engine: Arc::new(engine),
                fetcher,
                span,
            },
            event_rx,
        ))
    }

    /// Use a different reserved API path segment.
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.classifier = self.classifier.with_api_prefix(prefix);
        self
    }

    pub fn generation(&self) -> &Generation {
        self.lifecycle.generation()
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn classifier(&self) -> &RequestClassifier {
        &self.classifier
    }

    /// Handle the install event.
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        self.lifecycle.install().instrument(self.span.clone()).await
    }

    /// Handle the activate event.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.lifecycle.activate().instrument(self.span.clone()).await
    }

    /// Install and activate without waiting.
    pub async fn start(&self) -> Result<ActivationReport, ServiceWorkerError> {
        self.install().await?;
        self.activate().await
    }

    /// Decide how a fetch event is answered.
    ///
    /// Runs to completion without suspending: the decision exists before
    /// any store or network work starts.
    pub fn dispatch_fetch(&self, event: FetchEvent) -> FetchDecision {
        let _entered = self.span.enter();
        let request = event.request;

        if !self.state().can_intercept_fetch() {
            return FetchDecision::Passthrough(request);
        }

        let class = self.classifier.classify(&request);
        let Some(strategy) = Strategy::for_class(class) else {
            return FetchDecision::Passthrough(request);
        };

        debug!(
            id = request.id.raw(),
            url = %request.url,
            client = ?event.client_id,
            class = %class,
            strategy = %strategy,
            "Routing fetch"
        );

        let engine = Arc::clone(&self.engine);
        let response = async move { engine.execute(strategy, request).await }
            .instrument(self.span.clone())
            .boxed();

        FetchDecision::RespondWith {
            class,
            strategy,
            response,
        }
    }

    /// Dispatch and resolve a request, performing passthrough fetches directly.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        match self.dispatch_fetch(FetchEvent::new(request)) {
            FetchDecision::RespondWith { response, .. } => response.await,
            FetchDecision::Passthrough(request) => Ok(self.fetcher.fetch(request).await?),
        }
    }

    /// Like [`fetch`](Self::fetch), but failures become a network-error response.
    pub async fn respond(&self, request: Request) -> Response {
        let url = request.url.clone();
        match self.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, category = e.category(), error = %e, "Request could not be completed");
                Response::network_error(url)
            }
        }
    }

    /// Wait for background store writes to finish.
    pub async fn settled(&self) {
        self.engine.settled().await;
    }
}
