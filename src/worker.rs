//! Worker routers
//!
//! A worker owns its own copy of the configuration, received once as JSON
//! when it starts. It reads dispatch requests from its inbox, resolves each
//! one against the routing table, performs the upstream call and writes the
//! reply to its outbox. Dispatches are handled concurrently; replies carry the
//! request id so the coordinator can match them regardless of order.

use crate::config::Config;
use crate::error::ProxyErrorCode;
use crate::protocol::{recover_id, DispatchReply, DispatchRequest};
use crate::router::RouteTable;
use crate::upstream::UpstreamClient;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Resolves dispatch requests and performs the proxied calls
pub struct WorkerRouter {
    index: usize,
    routes: RouteTable,
    client: UpstreamClient,
}

impl WorkerRouter {
    pub fn new(index: usize, config: &Config) -> Self {
        Self {
            index,
            routes: RouteTable::from_config(&config.server),
            client: UpstreamClient::new(),
        }
    }

    /// Build a worker from the serialized configuration handed over at startup
    pub fn from_config_json(index: usize, config_json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(config_json)
            .map_err(|e| anyhow::anyhow!("Worker {} received invalid configuration: {}", index, e))?;
        config.validate()?;
        Ok(Self::new(index, &config))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Resolve and proxy a single request. Never fails; every outcome is a reply.
    pub async fn handle(&self, request: &DispatchRequest) -> DispatchReply {
        let route = match self.routes.resolve(&request.url) {
            Ok(route) => route,
            Err(e) => {
                debug!(worker = self.index, id = request.id, error = %e, "Route resolution failed");
                return DispatchReply::failure(request.id, e.error_code());
            }
        };

        let upstream = route.upstream;
        debug!(
            worker = self.index,
            id = request.id,
            url = %request.url,
            rule = %route.rule.path,
            upstream = %upstream.id,
            "Forwarding to upstream"
        );

        let deadline = request.deadline();
        match tokio::time::timeout(deadline, self.client.fetch(&upstream.url, &request.url)).await {
            Ok(Ok(body)) => DispatchReply::data(request.id, body),
            Ok(Err(e)) => {
                warn!(
                    worker = self.index,
                    id = request.id,
                    upstream = %upstream.id,
                    host = %upstream.url,
                    error = %e,
                    "Upstream request failed"
                );
                DispatchReply::failure(request.id, ProxyErrorCode::UpstreamFailed)
            }
            Err(_) => {
                warn!(
                    worker = self.index,
                    id = request.id,
                    upstream = %upstream.id,
                    deadline_ms = request.deadline_ms,
                    "Upstream request timed out"
                );
                DispatchReply::failure(request.id, ProxyErrorCode::UpstreamTimeout)
            }
        }
    }

    /// Decode one raw message, handle it and encode the reply.
    ///
    /// Returns `None` only when the message is malformed and carries no
    /// recoverable id, in which case there is nobody to reply to.
    pub async fn handle_message(&self, raw: &str) -> Option<String> {
        let reply = match DispatchRequest::decode(raw) {
            Ok(request) => self.handle(&request).await,
            Err(e) => {
                let id = recover_id(raw);
                warn!(worker = self.index, id, error = %e, "Rejected malformed dispatch request");
                DispatchReply::failure(id?, ProxyErrorCode::MalformedMessage)
            }
        };

        match reply.encode() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!(worker = self.index, id = reply.id, error = %e, "Failed to encode reply");
                None
            }
        }
    }

    /// Serve dispatches from `inbox` until the coordinator drops it
    pub async fn run(self: Arc<Self>, mut inbox: UnboundedReceiver<String>, outbox: UnboundedSender<String>) {
        info!(worker = self.index, "Worker router started");

        while let Some(raw) = inbox.recv().await {
            let worker = Arc::clone(&self);
            let outbox = outbox.clone();
            tokio::spawn(async move {
                if let Some(reply) = worker.handle_message(&raw).await {
                    if outbox.send(reply).is_err() {
                        debug!(worker = worker.index, "Reply dropped, coordinator is gone");
                    }
                }
            });
        }

        info!(worker = self.index, "Worker router stopped");
    }
}
