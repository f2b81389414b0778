//! Wire protocol.
//!
//! Every header is a text frame: a 2-byte big-endian length followed by that
//! many bytes of UTF-8. PUT requests and successful GET responses append a
//! 4-byte big-endian length and the raw blob bytes.
//!
//! ```text
//! request:  <request_id> GET|DELETE BY_NAME|BY_ID <value>
//!           <request_id> PUT <name>            + u32 len + bytes
//!           <request_id> EXIT
//! response: <request_id> <code> <info>         (+ u32 len + bytes for GET/200)
//! ```

mod codec;
mod request;
mod response;

pub use codec::{put_payload, put_text_frame, Frame, ServerCodec};
pub use request::{MalformedRequest, Request, RequestKind};
pub use response::{Response, Status};

use thiserror::Error;

/// Largest header a 2-byte length prefix can describe.
pub const MAX_HEADER_LEN: usize = u16::MAX as usize;

/// Default cap on a single blob payload (50MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("Invalid file name: {0:?}")]
    InvalidName(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Header of {0} bytes does not fit in a frame")]
    HeaderTooLong(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
