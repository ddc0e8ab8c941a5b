//! [`Fetcher`] backed by a real HTTP client.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use url::Url;

use crate::{Fetcher, LoaderConfig, NetError, Request, RequestMode, Response, ResponseType};

/// Fetches over HTTP(S) on behalf of pages served from `origin`.
///
/// Responses are classified against `origin`: same-origin results are
/// [`ResponseType::Basic`], cross-origin `no-cors` results are opaque and
/// everything else cross-origin is [`ResponseType::Cors`].
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    origin: Url,
}

impl HttpFetcher {
    /// Create a fetcher for pages of `origin`.
    pub fn new(origin: Url, config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %origin, "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin,
        })
    }

    /// The origin pages are served from.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn classify(&self, final_url: &Url, mode: RequestMode) -> ResponseType {
        if final_url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else if mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        if request.mode == RequestMode::SameOrigin && request.url.origin() != self.origin.origin()
        {
            return Err(NetError::RequestFailed(format!(
                "cross-origin request to {} in same-origin mode",
                request.url
            )));
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let redirected = strip_fragment(&final_url) != strip_fragment(&request.url);
        let response_type = self.classify(&final_url, request.mode);

        trace!(
            url = %final_url,
            status,
            redirected,
            response_type = ?response_type,
            "Response headers received"
        );

        if response_type == ResponseType::Opaque {
            return Ok(Response::opaque(final_url).with_redirected(redirected));
        }

        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(NetError::from);
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response::new(final_url, status)
            .with_headers(headers)
            .with_type(response_type)
            .with_redirected(redirected)
            .with_stream(rx))
    }
}

fn strip_fragment(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fetcher_for(server: &MockServer) -> HttpFetcher {
        let origin = Url::parse(&server.uri()).unwrap();
        HttpFetcher::new(origin, LoaderConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_same_origin_fetch_is_basic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/css/styles.css"))
            .respond_with(ResponseTemplate::new(200).set_body_string("body { margin: 0 }"))
            .mount(&server)
            .await;

        let fetcher = fetcher_for(&server).await;
        let url = fetcher.origin().join("/static/css/styles.css").unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.response_type, ResponseType::Basic);
        assert!(!response.redirected);
        assert!(response.is_streaming());
        assert_eq!(response.text().await.unwrap(), "body { margin: 0 }");
    }

    #[tokio::test]
    async fn test_error_status_is_a_response() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = fetcher_for(&server).await;
        let url = fetcher.origin().join("/missing").unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_redirect_is_flagged() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let fetcher = fetcher_for(&server).await;
        let url = fetcher.origin().join("/old").unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();
        assert!(response.redirected);
        assert_eq!(response.url.path(), "/new");
    }

    #[tokio::test]
    async fn test_cross_origin_no_cors_is_opaque() {
        let page_server = MockServer::start().await;
        let cdn = MockServer::start().await;
        Mock::given(path("/lib.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
            .mount(&cdn)
            .await;

        let fetcher = fetcher_for(&page_server).await;
        let url = Url::parse(&format!("{}/lib.js", cdn.uri())).unwrap();
        let response = fetcher
            .fetch(Request::get(url).mode(RequestMode::NoCors))
            .await
            .unwrap();

        assert_eq!(response.response_type, ResponseType::Opaque);
        assert_eq!(response.status, 0);
        assert!(response.bytes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_err() {
        let origin = Url::parse("http://127.0.0.1:9/").unwrap();
        let fetcher = HttpFetcher::new(origin.clone(), LoaderConfig::default()).unwrap();
        assert!(fetcher.fetch(Request::get(origin)).await.is_err());
    }
}
