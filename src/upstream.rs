//! Outbound HTTP client used by worker routers
//!
//! Every proxied call is a plain `GET` with an empty body. The whole upstream
//! response body is buffered before it is handed back; the upstream status is
//! not inspected.

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Error type for outbound upstream calls
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("body error: {0}")]
    Body(#[from] hyper::Error),
}

/// HTTP client for upstream calls. Connections are not reused.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client }
    }

    /// `GET` `path` from `host` and return the full response body
    pub async fn fetch(&self, host: &str, path: &str) -> Result<String, UpstreamError> {
        let uri = upstream_uri(host, path)?;

        let req = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .body(Empty::<Bytes>::new())?;

        let response = self.client.request(req).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();

        debug!(%uri, %status, bytes = body.len(), "Upstream responded");

        Ok(body_text(&uri, &body))
    }
}

/// Decode an upstream body as text, replacing invalid UTF-8 sequences
fn body_text(uri: &Uri, body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(e) => {
            debug!(%uri, valid_up_to = e.valid_up_to(), bytes = body.len(), "Upstream body is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(body).into_owned()
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the outbound URI from an upstream host and the original request path.
/// Hosts without a scheme are treated as plain HTTP.
pub fn upstream_uri(host: &str, path: &str) -> Result<Uri, UpstreamError> {
    let base = host.trim_end_matches('/');
    let raw = if base.contains("://") {
        format!("{}{}", base, path)
    } else {
        format!("http://{}{}", base, path)
    };

    raw.parse::<Uri>().map_err(|e| UpstreamError::InvalidUri {
        uri: raw.clone(),
        reason: e.to_string(),
    })
}
