//! Per-connection request dispatch.
//!
//! A session runs three kinds of tasks over one connection:
//! - the read loop, which decodes frames in arrival order and never waits on
//!   an operation,
//! - a bounded pool of worker tasks, one per GET/PUT/DELETE, gated by a
//!   semaphore,
//! - a single writer, which owns the write half and drains the completion
//!   channel.
//!
//! Responses leave in completion order, not request order; each carries the
//! id of the request it answers.

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ServerConfig;
use crate::protocol::{
    Frame, MalformedRequest, ProtocolError, RequestKind, Response, ServerCodec, Status,
};
use crate::storage::{FileIdentifier, StorageEngine};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Operations allowed to run at once
    pub workers: usize,
    /// Operations accepted but not yet answered, running ones included
    pub max_queued: usize,
    /// Grace period for in-flight operations when the session closes
    pub drain_timeout: Duration,
    pub max_payload: usize,
}

impl From<&ServerConfig> for SessionConfig {
    fn from(config: &ServerConfig) -> Self {
        let workers = config.worker_threads.max(1);
        Self {
            workers,
            max_queued: config.max_queued_requests.max(workers),
            drain_timeout: config.session_drain_timeout(),
            max_payload: config.max_payload_size,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent EXIT
    Exit,
    /// The peer closed the connection
    Disconnected,
    /// Reading or writing failed
    ConnectionLost,
    /// The server is shutting down
    Shutdown,
}

/// A storage operation handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Get(FileIdentifier),
    Put { name: String, payload: Bytes },
    Delete(FileIdentifier),
}

impl Operation {
    /// The operation a request asks for, or `None` for EXIT.
    pub fn from_kind(kind: RequestKind) -> Option<Self> {
        match kind {
            RequestKind::Get(identifier) => Some(Operation::Get(identifier)),
            RequestKind::Put { name, payload } => Some(Operation::Put { name, payload }),
            RequestKind::Delete(identifier) => Some(Operation::Delete(identifier)),
            RequestKind::Exit => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get(identifier) => write!(f, "GET {identifier}"),
            Operation::Put { name, payload } => write!(f, "PUT {name} ({} bytes)", payload.len()),
            Operation::Delete(identifier) => write!(f, "DELETE {identifier}"),
        }
    }
}

pub struct Session<S> {
    stream: S,
    engine: Arc<StorageEngine>,
    config: SessionConfig,
    stop: watch::Receiver<bool>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, engine: Arc<StorageEngine>, config: SessionConfig) -> Self {
        Self {
            stream,
            engine,
            config,
            // Sender dropped at once: never signals
            stop: watch::channel(false).1,
        }
    }

    /// Stop reading once `stop` turns true. In-flight operations still get
    /// the drain grace period.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = stop;
        self
    }

    /// Serve the connection until EXIT, disconnect, shutdown, or a transport
    /// error.
    pub async fn run(self) -> SessionEnd {
        let Session {
            stream,
            engine,
            config,
            mut stop,
        } = self;

        let (reader, writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(reader, ServerCodec::new(config.max_payload));
        let sink = FramedWrite::new(writer, ServerCodec::new(config.max_payload));

        let (done_tx, done_rx) = mpsc::channel::<Response>(config.workers * 4);
        let writer_task = tokio::spawn(write_responses(sink, done_rx).in_current_span());

        let permits = Arc::new(Semaphore::new(config.workers));
        let queued = Arc::new(Semaphore::new(config.max_queued));
        let mut tasks = JoinSet::new();

        let end = loop {
            // Reap finished operations so the set only holds live ones
            while let Some(result) = tasks.try_join_next() {
                log_join_error(result);
            }

            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = done_tx.closed() => break SessionEnd::ConnectionLost,
                _ = stop_requested(&mut stop) => {
                    info!("Server shutting down, closing session");
                    break SessionEnd::Shutdown;
                }
            };

            match frame {
                None => break SessionEnd::Disconnected,
                Some(Err(ProtocolError::Io(e))) => {
                    info!(error = %e, "Lost connection to client");
                    break SessionEnd::ConnectionLost;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Unrecoverable framing error, closing session");
                    break SessionEnd::ConnectionLost;
                }
                Some(Ok(Frame::Malformed(malformed))) => {
                    if let Some(response) = answer_malformed(malformed) {
                        if done_tx.send(response).await.is_err() {
                            break SessionEnd::ConnectionLost;
                        }
                    }
                }
                Some(Ok(Frame::Request(request))) => {
                    let request_id = request.request_id;
                    let Some(operation) = Operation::from_kind(request.kind) else {
                        info!(request_id, "Client requested exit");
                        break SessionEnd::Exit;
                    };

                    let Ok(slot) = Arc::clone(&queued).try_acquire_owned() else {
                        warn!(request_id, %operation, "Too many queued requests, rejecting");
                        let response = Response::new(request_id, Status::InternalError);
                        if done_tx.send(response).await.is_err() {
                            break SessionEnd::ConnectionLost;
                        }
                        continue;
                    };
                    debug!(request_id, %operation, "Dispatching request");

                    let engine = Arc::clone(&engine);
                    let permits = Arc::clone(&permits);
                    let done = done_tx.clone();
                    tasks.spawn(
                        async move {
                            let _slot = slot;
                            let Ok(_permit) = permits.acquire_owned().await else {
                                return;
                            };
                            let response = AssertUnwindSafe(execute(&engine, request_id, operation))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    error!(request_id, "Operation panicked");
                                    Response::new(request_id, Status::InternalError)
                                });
                            // A closed channel means the session is going away
                            let _ = done.send(response).await;
                        }
                        .in_current_span(),
                    );
                }
            }
        };

        drop(frames);
        drain(&mut tasks, config.drain_timeout).await;

        drop(done_tx);
        if let Err(e) = writer_task.await {
            error!(error = %e, "Response writer failed");
        }

        info!(reason = ?end, "Session closed");
        end
    }
}

/// Resolve once `stop` reads true. A dropped sender leaves this pending.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Let in-flight operations finish within the grace period, then abort the
/// rest. Responses of aborted operations are never sent.
async fn drain(tasks: &mut JoinSet<()>, timeout: Duration) {
    if tasks.is_empty() {
        return;
    }
    debug!(in_flight = tasks.len(), "Draining in-flight operations");

    let finished = tokio::time::timeout(timeout, async {
        while let Some(result) = tasks.join_next().await {
            log_join_error(result);
        }
    })
    .await;

    if finished.is_err() {
        warn!(
            remaining = tasks.len(),
            "Operations did not finish in time, aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// Run one storage operation and build its response.
pub async fn execute(engine: &StorageEngine, request_id: u64, operation: Operation) -> Response {
    match operation {
        Operation::Get(identifier) => match engine.get_file(&identifier).await {
            Ok(data) => Response::ok(request_id).with_payload(data),
            Err(e) => {
                debug!(request_id, %identifier, error = %e, "GET failed");
                Response::from_error(request_id, &e)
            }
        },
        Operation::Put { name, payload } => match engine.save_file(&name, payload).await {
            Ok(id) => Response::ok(request_id).with_info(id.to_string()),
            Err(e) => {
                debug!(request_id, name = %name, error = %e, "PUT failed");
                Response::from_error(request_id, &e)
            }
        },
        Operation::Delete(identifier) => match engine.delete_file(&identifier).await {
            Ok(true) => Response::ok(request_id),
            Ok(false) => Response::new(request_id, Status::NotFound),
            Err(e) => {
                debug!(request_id, %identifier, error = %e, "DELETE failed");
                Response::from_error(request_id, &e)
            }
        },
    }
}

/// Log a malformed frame. A bad identifier is still answered with 404, and a
/// PUT whose name cannot be stored with 403, so the client is not left
/// waiting on that id.
fn answer_malformed(malformed: MalformedRequest) -> Option<Response> {
    warn!(
        request_id = ?malformed.request_id,
        error = %malformed.error,
        "Ignoring malformed request"
    );
    match (malformed.request_id, &malformed.error) {
        (Some(request_id), ProtocolError::InvalidIdentifier(_)) => {
            Some(Response::new(request_id, Status::NotFound))
        }
        (Some(request_id), ProtocolError::InvalidName(_)) => {
            Some(Response::new(request_id, Status::Forbidden))
        }
        _ => None,
    }
}

async fn write_responses<W>(mut sink: FramedWrite<W, ServerCodec>, mut done: mpsc::Receiver<Response>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = done.recv().await {
        let request_id = response.request_id;
        let status = response.status.code();
        if let Err(e) = sink.send(response).await {
            warn!(request_id, error = %e, "Could not send response, closing writer");
            return;
        }
        debug!(request_id, status, "Response sent");
    }
    let _ = sink.close().await;
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "Operation task failed");
        }
    }
}
