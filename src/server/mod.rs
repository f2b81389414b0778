//! TCP front-end: accepts connections and runs one [`Session`] per client.

mod session;

pub use session::{execute, Operation, Session, SessionConfig, SessionEnd};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::ServerConfig;
use crate::storage::StorageEngine;

/// Extra time a closing session gets beyond its drain timeout to flush
/// responses and close its writer.
const SESSION_CLOSE_SLACK: Duration = Duration::from_secs(1);

/// Asks a running [`Server`] to stop accepting and shut down.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Server {
    listener: TcpListener,
    engine: Arc<StorageEngine>,
    session_config: SessionConfig,
    exit_stops_server: bool,
    checkpoint_interval: Option<Duration>,
    shutdown: ShutdownHandle,
    stop: watch::Receiver<bool>,
}

impl Server {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        engine: Arc<StorageEngine>,
        config: &ServerConfig,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let (tx, stop) = watch::channel(false);
        Ok(Self {
            listener,
            engine,
            session_config: SessionConfig::from(config),
            exit_stops_server: config.exit_stops_server,
            checkpoint_interval: None,
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
            stop,
        })
    }

    /// Save the index every `interval` while the server runs.
    pub fn with_checkpoints(mut self, interval: Option<Duration>) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept connections until `signal` resolves, a shutdown is requested,
    /// or (when configured) a client sends EXIT. Open sessions are then told
    /// to stop and given their drain timeout; any still running after that
    /// are aborted. The index is saved last.
    pub async fn run<F>(self, signal: F) -> Result<(), crate::storage::StorageError>
    where
        F: Future<Output = ()>,
    {
        let mut stop = self.stop.clone();
        let mut sessions = JoinSet::new();
        tokio::pin!(signal);

        let checkpoints = self.checkpoint_interval.map(|interval| {
            let engine = Arc::clone(&self.engine);
            info!(interval_secs = interval.as_secs(), "Index checkpoints enabled");
            tokio::spawn(checkpoint_loop(engine, interval))
        });

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    self.shutdown.shutdown();
                    break;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }
                Some(result) = sessions.join_next(), if !sessions.is_empty() => {
                    log_session_error(result);
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    info!(%peer, "Connection accepted");
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let session = Session::new(stream, Arc::clone(&self.engine), self.session_config.clone())
                        .with_stop(self.stop.clone());
                    let shutdown = self.shutdown.clone();
                    let exit_stops_server = self.exit_stops_server;
                    sessions.spawn(
                        async move {
                            let end = session.run().await;
                            if end == SessionEnd::Exit && exit_stops_server {
                                shutdown.shutdown();
                            }
                        }
                        .instrument(info_span!("session", %peer)),
                    );
                }
            }
        }

        if let Some(handle) = checkpoints {
            handle.abort();
        }

        if !sessions.is_empty() {
            info!(open = sessions.len(), "Waiting for open sessions to close");
            let grace = self.session_config.drain_timeout + SESSION_CLOSE_SLACK;
            let closed = tokio::time::timeout(grace, async {
                while let Some(result) = sessions.join_next().await {
                    log_session_error(result);
                }
            })
            .await;

            if closed.is_err() {
                warn!(remaining = sessions.len(), "Sessions did not close in time, aborting");
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
            }
        }

        self.engine.save_index().await?;
        info!("Server stopped");
        Ok(())
    }
}

fn log_session_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "Session task failed");
        }
    }
}

async fn checkpoint_loop(engine: Arc<StorageEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = engine.save_index().await {
            warn!(error = %e, "Index checkpoint failed");
        }
    }
}
