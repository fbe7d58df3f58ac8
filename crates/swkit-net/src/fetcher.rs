//! Network fetchers.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::{NetError, Request, Response, ResponseBody, ResponseType};

/// Chunks buffered between the socket and the body reader.
const STREAM_BUFFER: usize = 16;

/// Performs network fetches on behalf of the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a request. HTTP error statuses are responses, not errors;
    /// `Err` means no response was produced at all.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("swkit/", env!("CARGO_PKG_VERSION")).to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// reqwest-backed [`Fetcher`] that streams response bodies.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    fn classify(request: &Request, response: &reqwest::Response) -> ResponseType {
        let same_origin = match &request.client_origin {
            Some(origin) => *origin == response.url().origin(),
            None => true,
        };
        if same_origin {
            ResponseType::Basic
        } else if response
            .headers()
            .contains_key(http::header::ACCESS_CONTROL_ALLOW_ORIGIN)
        {
            ResponseType::Cors
        } else {
            ResponseType::Opaque
        }
    }

    fn map_error(error: reqwest::Error, timeout: Duration) -> NetError {
        if error.is_timeout() {
            NetError::Timeout(timeout)
        } else if error.is_connect() {
            NetError::Unreachable(error.to_string())
        } else {
            NetError::HttpError(error)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(id = request.id.raw(), url = %request.url, method = %request.method, "Fetching resource");

        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(timeout);

        if let Some(ref referrer) = request.referrer {
            req_builder = req_builder.header(http::header::REFERER, referrer.as_str());
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| Self::map_error(e, timeout))?;

        let response_type = Self::classify(&request, &response);
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        trace!(
            id = request.id.raw(),
            url = %url,
            status = %status,
            response_type = ?response_type,
            content_length = ?response.content_length(),
            "Response received"
        );

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| NetError::Body(e.to_string()));
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response::new(url, status, headers, ResponseBody::Stream(rx)).with_type(response_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(LoaderConfig::default()).unwrap()
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("swkit/"));
        assert_eq!(config.max_redirects, 10);
        assert!(config.cookies_enabled);
    }

    #[tokio::test]
    async fn test_fetch_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/js/main.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string("let app = 1;"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/static/js/main.js", server.uri())).unwrap();
        let request = Request::get(url.clone()).from_origin(url.origin());
        let response = fetcher().fetch(request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.response_type, ResponseType::Basic);
        assert_eq!(response.text().await.unwrap(), "let app = 1;");
    }

    #[tokio::test]
    async fn test_error_status_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = fetcher().fetch(Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_cross_origin_response_types() {
        let server = MockServer::start().await;
        Mock::given(path("/cors.js"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("access-control-allow-origin", "*"),
            )
            .mount(&server)
            .await;
        Mock::given(path("/plain.js"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let page = Url::parse("https://app.example.com/").unwrap().origin();

        let cors = Url::parse(&format!("{}/cors.js", server.uri())).unwrap();
        let response = fetcher()
            .fetch(Request::get(cors).from_origin(page.clone()))
            .await
            .unwrap();
        assert_eq!(response.response_type, ResponseType::Cors);

        let plain = Url::parse(&format!("{}/plain.js", server.uri())).unwrap();
        let response = fetcher()
            .fetch(Request::get(plain).from_origin(page))
            .await
            .unwrap();
        assert_eq!(response.response_type, ResponseType::Opaque);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Nothing listens on port 1 locally.
        let url = Url::parse("http://127.0.0.1:1/api/dashboard/overview").unwrap();
        let result = fetcher().fetch(Request::get(url)).await;
        assert!(matches!(result, Err(NetError::Unreachable(_))));
    }
}
