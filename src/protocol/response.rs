use bytes::Bytes;
use std::fmt;

use super::ProtocolError;
use crate::storage::StorageError;

/// Response status, using HTTP-style codes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            403 => Some(Status::Forbidden),
            404 => Some(Status::NotFound),
            500 => Some(Status::InternalError),
            _ => None,
        }
    }
}

impl From<&StorageError> for Status {
    fn from(e: &StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => Status::NotFound,
            StorageError::Forbidden(_) | StorageError::InvalidName(_) => Status::Forbidden,
            _ => Status::InternalError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Id of the request this answers
    pub request_id: u64,
    pub status: Status,
    /// Assigned id on a successful PUT, empty otherwise
    pub info: String,
    /// Blob bytes on a successful GET
    pub payload: Option<Bytes>,
}

impl Response {
    pub fn new(request_id: u64, status: Status) -> Self {
        Self {
            request_id,
            status,
            info: String::new(),
            payload: None,
        }
    }

    pub fn ok(request_id: u64) -> Self {
        Self::new(request_id, Status::Ok)
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn from_error(request_id: u64, e: &StorageError) -> Self {
        Self::new(request_id, Status::from(e))
    }

    /// Text of the header frame, e.g. `3 200 0`.
    pub fn header(&self) -> String {
        format!("{} {} {}", self.request_id, self.status.code(), self.info)
    }

    /// Parse a header frame. The payload, if any, is attached by the reader.
    pub fn parse_header(text: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidResponse(text.to_string());

        let mut parts = text.splitn(3, ' ');
        let request_id = parts
            .next()
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        let status = parts
            .next()
            .and_then(|t| t.parse::<u16>().ok())
            .and_then(Status::from_code)
            .ok_or_else(invalid)?;
        let info = parts.next().unwrap_or_default().trim().to_string();

        Ok(Self::new(request_id, status).with_info(info))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.code(), self.info)?;
        if let Some(payload) = &self.payload {
            write!(f, " [{} bytes]", payload.len())?;
        }
        Ok(())
    }
}
