//! Shared test helpers for file-server unit tests.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{Response, Status};
use crate::storage::StorageEngine;

/// Open a storage engine inside a temporary directory.
pub async fn test_engine(temp_dir: &tempfile::TempDir) -> Arc<StorageEngine> {
    let engine = StorageEngine::open(temp_dir.path().join("data"))
        .await
        .expect("Failed to open test storage");
    Arc::new(engine)
}

/// Read one response off a raw stream. The caller says whether a 200 for
/// this request carries a payload, as a real client tracks per request.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R, expects_payload: bool) -> Response {
    let len = reader.read_u16().await.expect("response header length") as usize;
    let mut header = vec![0u8; len];
    reader
        .read_exact(&mut header)
        .await
        .expect("response header");
    let header = String::from_utf8(header).expect("UTF-8 response header");
    let mut response = Response::parse_header(&header).expect("valid response header");

    if expects_payload && response.status == Status::Ok {
        let len = reader.read_u32().await.expect("payload length") as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await.expect("payload");
        response.payload = Some(Bytes::from(payload));
    }
    response
}
