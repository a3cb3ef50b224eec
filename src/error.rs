//! Error codes and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Header naming the error code on responses synthesized by the coordinator
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No routing rule prefix matches the request URL
    RulesNotFound,
    /// The matched rule references an upstream id that is not configured
    UpstreamNotFound,
    /// The outbound call to the upstream failed at the transport level
    UpstreamFailed,
    /// The dispatch deadline expired before the upstream answered
    UpstreamTimeout,
    /// A message crossing the coordinator/worker boundary failed validation
    MalformedMessage,
    /// The selected worker is no longer accepting dispatches
    WorkerUnavailable,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RulesNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::UpstreamNotFound => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::MalformedMessage => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::WorkerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-visible message written as the response body
    pub fn message(&self) -> &'static str {
        match self {
            ProxyErrorCode::RulesNotFound => "Rules not found",
            ProxyErrorCode::UpstreamNotFound => "Upstream not found",
            ProxyErrorCode::UpstreamFailed => "Upstream request failed",
            ProxyErrorCode::UpstreamTimeout => "Upstream timed out",
            ProxyErrorCode::MalformedMessage => "Malformed dispatch message",
            ProxyErrorCode::WorkerUnavailable => "Worker unavailable",
            ProxyErrorCode::InternalError => "Internal error",
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RulesNotFound => "RULES_NOT_FOUND",
            ProxyErrorCode::UpstreamNotFound => "UPSTREAM_NOT_FOUND",
            ProxyErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ProxyErrorCode::WorkerUnavailable => "WORKER_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Build a plain-text response with the given status and body
pub fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode and no headers")
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn text_error_response(code: ProxyErrorCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(
            Full::new(Bytes::from_static(code.message().as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
