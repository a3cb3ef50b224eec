//! Worker pool owned by the coordinator
//!
//! The pool spawns a fixed number of worker routers at startup and never
//! resizes, restarts or replaces them. Each dispatch gets a fresh correlation
//! id and a pending entry; one long-lived demultiplexer task per worker reads
//! that worker's replies and completes the matching entry.

use crate::balancer::{Outstanding, WorkerSelector};
use crate::config::Config;
use crate::error::ProxyErrorCode;
use crate::protocol::{recover_id, DispatchReply, DispatchRequest, ProtocolError};
use crate::worker::WorkerRouter;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Extra time the coordinator waits past the dispatch deadline, so the
/// worker's own timeout reply normally arrives first
const REPLY_GRACE: Duration = Duration::from_millis(500);

type PendingReplies = Arc<DashMap<u64, oneshot::Sender<DispatchReply>>>;

/// Error type for dispatching a request to a worker
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("worker pool is empty")]
    NoWorkers,
    #[error("worker {0} is not accepting dispatches")]
    WorkerGone(usize),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl DispatchError {
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            DispatchError::NoWorkers => ProxyErrorCode::InternalError,
            DispatchError::WorkerGone(_) => ProxyErrorCode::WorkerUnavailable,
            DispatchError::Timeout(_) => ProxyErrorCode::UpstreamTimeout,
            DispatchError::Protocol(_) => ProxyErrorCode::MalformedMessage,
        }
    }
}

/// Coordinator-side handle to a live worker
pub struct WorkerHandle {
    index: usize,
    inbox: UnboundedSender<String>,
    in_flight: AtomicUsize,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Outstanding for WorkerHandle {
    fn outstanding(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// A fixed set of worker routers plus the reply correlation state
pub struct WorkerPool {
    workers: Box<[WorkerHandle]>,
    pending: PendingReplies,
    next_id: AtomicU64,
    selector: WorkerSelector,
    deadline: Duration,
}

impl WorkerPool {
    /// Spawn `server.workers` worker routers. Must run inside a tokio runtime.
    pub fn spawn(config: &Config) -> anyhow::Result<Self> {
        let count = config.server.worker_count();
        if count == 0 {
            anyhow::bail!("Worker pool requires at least one worker");
        }

        // Each worker gets its own copy, decoded from the same serialized form
        let config_json = serde_json::to_string(config)?;
        let pending: PendingReplies = Arc::new(DashMap::new());
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let router = Arc::new(WorkerRouter::from_config_json(index, &config_json)?);
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

            tokio::spawn(router.run(inbox_rx, outbox_tx));
            tokio::spawn(demultiplex(index, outbox_rx, Arc::clone(&pending)));

            workers.push(WorkerHandle {
                index,
                inbox: inbox_tx,
                in_flight: AtomicUsize::new(0),
            });
            debug!(worker = index, "Worker spawned");
        }

        info!(
            workers = count,
            strategy = ?config.server.balance,
            deadline_secs = config.server.request_timeout_secs,
            "Worker pool ready"
        );

        Ok(Self {
            workers: workers.into_boxed_slice(),
            pending,
            next_id: AtomicU64::new(1),
            selector: WorkerSelector::new(config.server.balance),
            deadline: config.server.request_timeout(),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Number of dispatches awaiting a reply across all workers
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Select a worker and dispatch one request to it
    pub async fn dispatch(
        &self,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<DispatchReply, DispatchError> {
        let index = self
            .selector
            .select(&self.workers[..])
            .ok_or(DispatchError::NoWorkers)?;
        self.dispatch_to(index, url, headers).await
    }

    /// Dispatch one request to the worker at `index` and wait for its reply
    pub async fn dispatch_to(
        &self,
        index: usize,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<DispatchReply, DispatchError> {
        let worker = self.workers.get(index).ok_or(DispatchError::NoWorkers)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = DispatchRequest::new(id, url, headers, self.deadline).encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(id, reply_tx);
        // Cleans up the pending entry and in-flight count however this
        // future ends, including when the client goes away mid-request
        let _guard = InFlight::enter(id, &self.pending, &worker.in_flight);

        debug!(worker = index, id, url, "Dispatching request");

        if worker.inbox.send(payload).is_err() {
            warn!(worker = index, id, "Worker inbox closed");
            return Err(DispatchError::WorkerGone(index));
        }

        match tokio::time::timeout(self.deadline + REPLY_GRACE, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DispatchError::WorkerGone(index)),
            Err(_) => {
                warn!(worker = index, id, deadline_ms = self.deadline.as_millis() as u64, "No reply before deadline");
                Err(DispatchError::Timeout(self.deadline))
            }
        }
    }
}

/// Tracks one outstanding dispatch for the lifetime of the guard
struct InFlight<'a> {
    id: u64,
    pending: &'a PendingReplies,
    in_flight: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(id: u64, pending: &'a PendingReplies, in_flight: &'a AtomicUsize) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            pending,
            in_flight,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Route every reply from one worker to the dispatch waiting on its id
async fn demultiplex(index: usize, mut replies: UnboundedReceiver<String>, pending: PendingReplies) {
    while let Some(raw) = replies.recv().await {
        let reply = match DispatchReply::decode(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(worker = index, error = %e, "Rejected malformed reply");
                match recover_id(&raw) {
                    Some(id) => DispatchReply::failure(id, ProxyErrorCode::MalformedMessage),
                    None => continue,
                }
            }
        };

        match pending.remove(&reply.id) {
            Some((_, waiter)) => {
                // receiver may have given up already
                let _ = waiter.send(reply);
            }
            None => {
                debug!(worker = index, id = reply.id, "Reply for unknown or expired dispatch");
            }
        }
    }

    debug!(worker = index, "Reply channel closed");
}
