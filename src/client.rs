//! Async client for the file server.
//!
//! Requests can be issued concurrently from many tasks over one connection.
//! A background reader matches each response to its request by id, so
//! out-of-order completion on the server is invisible to callers.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{ProtocolError, Request, RequestKind, Response, Status};
use crate::storage::FileIdentifier;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,
}

struct Pending {
    /// A 200 for this request is followed by a blob
    expects_payload: bool,
    tx: oneshot::Sender<Response>,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<u64, Pending>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Client {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(
            BufReader::new(read_half),
            Arc::clone(&pending),
        ));

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_request_id: AtomicU64::new(0),
            reader,
        })
    }

    pub async fn get(&self, identifier: FileIdentifier) -> Result<Response, ClientError> {
        self.call(RequestKind::Get(identifier)).await
    }

    pub async fn put(
        &self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Result<Response, ClientError> {
        self.call(RequestKind::Put {
            name: name.into(),
            payload: data.into(),
        })
        .await
    }

    pub async fn delete(&self, identifier: FileIdentifier) -> Result<Response, ClientError> {
        self.call(RequestKind::Delete(identifier)).await
    }

    /// Tell the server this client is done. No response is sent for EXIT.
    pub async fn exit(self) -> Result<(), ClientError> {
        let request = Request::exit(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let mut writer = self.writer.lock().await;
        write_request(&mut writer, &request).await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn call(&self, kind: RequestKind) -> Result<Response, ClientError> {
        let request = Request {
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        let request_id = request.request_id;

        // Register before writing so the reader can never see the response first
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            request_id,
            Pending {
                expects_payload: matches!(request.kind, RequestKind::Get(_)),
                tx,
            },
        );

        let written = {
            let mut writer = self.writer.lock().await;
            write_request(&mut writer, &request).await
        };
        if let Err(e) = written {
            lock(&self.pending).remove(&request_id);
            return Err(e);
        }

        rx.await.map_err(|_| ClientError::ConnectionClosed)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_request(writer: &mut OwnedWriteHalf, request: &Request) -> Result<(), ClientError> {
    let mut buf = BytesMut::new();
    request.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    debug!(%request, "Request sent");
    Ok(())
}

async fn read_responses(mut reader: BufReader<OwnedReadHalf>, pending: PendingMap) {
    loop {
        match read_response(&mut reader, &pending).await {
            Ok(response) => match lock(&pending).remove(&response.request_id) {
                Some(waiter) => {
                    let _ = waiter.tx.send(response);
                }
                None => warn!(request_id = response.request_id, "Response for unknown request"),
            },
            Err(e) => {
                debug!(error = %e, "Response reader stopped");
                break;
            }
        }
    }
    // Dropping the senders wakes every waiter with ConnectionClosed
    lock(&pending).clear();
}

async fn read_response(
    reader: &mut BufReader<OwnedReadHalf>,
    pending: &PendingMap,
) -> Result<Response, ClientError> {
    let len = reader.read_u16().await? as usize;
    let mut header = vec![0u8; len];
    reader.read_exact(&mut header).await?;
    let header = String::from_utf8(header).map_err(|e| {
        ProtocolError::InvalidResponse(String::from_utf8_lossy(e.as_bytes()).to_string())
    })?;
    let mut response = Response::parse_header(&header)?;

    let expects_payload = response.status == Status::Ok
        && lock(pending)
            .get(&response.request_id)
            .is_some_and(|p| p.expects_payload);
    if expects_payload {
        let len = reader.read_u32().await? as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        response.payload = Some(Bytes::from(payload));
    }

    Ok(response)
}
