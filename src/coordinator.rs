use crate::error::{text_error_response, text_response};
use crate::pool::WorkerPool;
use crate::protocol::{DispatchReply, ReplyOutcome};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Accepts inbound HTTP connections and hands every request to the worker pool
pub struct Coordinator {
    bind_addr: SocketAddr,
    pool: Arc<WorkerPool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(bind_addr: SocketAddr, pool: Arc<WorkerPool>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            pool,
            shutdown_rx,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, workers = self.pool.len(), "Reverse proxy listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, pool).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // a dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Coordinator shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, pool: Arc<WorkerPool>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pool = Arc::clone(&pool);
        async move { handle_request(req, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    pool: Arc<WorkerPool>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // The inbound method is ignored; upstreams always see a GET
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let mut headers = dispatch_headers(&req);
    headers.insert(X_REQUEST_ID.to_string(), request_id.clone());

    debug!(method = %req.method(), url, request_id, client = %client_addr, "Incoming request");

    match pool.dispatch(&url, headers).await {
        Ok(reply) => Ok(reply_response(reply)),
        Err(e) => {
            warn!(url, request_id, error = %e, "Dispatch failed");
            Ok(text_error_response(e.error_code()))
        }
    }
}

/// Flatten inbound headers into the string map carried by a dispatch.
/// Repeated headers are joined with ", "; non-UTF-8 values are skipped.
fn dispatch_headers<B>(req: &Request<B>) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in req.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    headers
}

/// Translate a worker reply into the client response
fn reply_response(reply: DispatchReply) -> Response<BoxBody<Bytes, hyper::Error>> {
    match reply.outcome {
        ReplyOutcome::Data(body) => text_response(StatusCode::OK, body),
        ReplyOutcome::Error { status, message } => text_response(status, message),
    }
}
