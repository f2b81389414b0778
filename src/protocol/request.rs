use bytes::{Bytes, BytesMut};
use std::fmt;

use super::codec::{put_payload, put_text_frame};
use super::ProtocolError;
use crate::storage::FileIdentifier;

/// One parsed client request. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Client-chosen id echoed back on the matching response
    pub request_id: u64,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Get(FileIdentifier),
    Put { name: String, payload: Bytes },
    Delete(FileIdentifier),
    Exit,
}

/// Header of a request before any payload is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Get(FileIdentifier),
    Put(String),
    Delete(FileIdentifier),
    Exit,
}

impl Request {
    pub fn get(request_id: u64, identifier: FileIdentifier) -> Self {
        Self {
            request_id,
            kind: RequestKind::Get(identifier),
        }
    }

    pub fn put(request_id: u64, name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            kind: RequestKind::Put {
                name: name.into(),
                payload: payload.into(),
            },
        }
    }

    pub fn delete(request_id: u64, identifier: FileIdentifier) -> Self {
        Self {
            request_id,
            kind: RequestKind::Delete(identifier),
        }
    }

    pub fn exit(request_id: u64) -> Self {
        Self {
            request_id,
            kind: RequestKind::Exit,
        }
    }

    /// Text of the header frame, e.g. `3 GET BY_ID 0`.
    pub fn header(&self) -> String {
        match &self.kind {
            RequestKind::Get(identifier) => format!("{} GET {identifier}", self.request_id),
            RequestKind::Put { name, .. } => format!("{} PUT {name}", self.request_id),
            RequestKind::Delete(identifier) => format!("{} DELETE {identifier}", self.request_id),
            RequestKind::Exit => format!("{} EXIT", self.request_id),
        }
    }

    /// Append the full wire form (header frame plus any payload) to `dst`.
    ///
    /// Names travel as single header tokens, so a name that is empty or
    /// contains whitespace is refused here rather than sent ambiguously.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match &self.kind {
            RequestKind::Put { name, .. }
            | RequestKind::Get(FileIdentifier::ByName(name))
            | RequestKind::Delete(FileIdentifier::ByName(name)) => check_name_token(name)?,
            _ => {}
        }
        put_text_frame(dst, &self.header())?;
        if let RequestKind::Put { payload, .. } = &self.kind {
            put_payload(dst, payload)?;
        }
        Ok(())
    }
}

fn check_name_token(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header())
    }
}

impl Command {
    pub(crate) fn into_request(self, request_id: u64, payload: Bytes) -> Request {
        let kind = match self {
            Command::Get(identifier) => RequestKind::Get(identifier),
            Command::Put(name) => RequestKind::Put { name, payload },
            Command::Delete(identifier) => RequestKind::Delete(identifier),
            Command::Exit => RequestKind::Exit,
        };
        Request { request_id, kind }
    }
}

/// A request frame that could not be parsed.
#[derive(Debug)]
pub struct MalformedRequest {
    /// Set whenever the leading id could be read, so the request can still
    /// be answered
    pub request_id: Option<u64>,
    pub error: ProtocolError,
    /// The frame was a PUT header, so a payload follows it on the wire
    pub has_payload: bool,
}

/// Parse a request header.
pub(crate) fn parse_header(text: &str) -> Result<(u64, Command), MalformedRequest> {
    let invalid = |request_id: Option<u64>| MalformedRequest {
        request_id,
        error: ProtocolError::InvalidRequest(text.to_string()),
        has_payload: false,
    };

    let mut tokens = text.split_whitespace();
    let request_id = tokens
        .next()
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(|| invalid(None))?;
    let kind = tokens.next().ok_or_else(|| invalid(Some(request_id)))?;
    let args: Vec<&str> = tokens.collect();

    let identifier = |args: &[&str]| match args {
        [kind, value] => {
            FileIdentifier::from_parts(kind, value).map_err(|e| MalformedRequest {
                request_id: Some(request_id),
                error: ProtocolError::InvalidIdentifier(e.to_string()),
                has_payload: false,
            })
        }
        _ => Err(invalid(Some(request_id))),
    };

    let command = match kind.to_ascii_uppercase().as_str() {
        "GET" => Command::Get(identifier(&args)?),
        "DELETE" => Command::Delete(identifier(&args)?),
        "PUT" => match args.as_slice() {
            [name] => Command::Put(name.to_string()),
            _ => {
                return Err(MalformedRequest {
                    request_id: Some(request_id),
                    error: ProtocolError::InvalidName(args.join(" ")),
                    has_payload: true,
                })
            }
        },
        "EXIT" if args.is_empty() => Command::Exit,
        _ => return Err(invalid(Some(request_id))),
    };

    Ok((request_id, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_by_id() {
        let (id, command) = parse_header("4 GET BY_ID 12").unwrap();
        assert_eq!(id, 4);
        assert_eq!(command, Command::Get(FileIdentifier::ById(12)));
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let (_, command) = parse_header("1 delete by_name a.txt").unwrap();
        assert_eq!(
            command,
            Command::Delete(FileIdentifier::ByName("a.txt".to_string()))
        );
    }

    #[test]
    fn test_parse_put_and_exit() {
        assert_eq!(
            parse_header("9 PUT photo.jpg").unwrap(),
            (9, Command::Put("photo.jpg".to_string()))
        );
        assert_eq!(parse_header("10 EXIT").unwrap(), (10, Command::Exit));
    }

    #[test]
    fn test_parse_bad_identifier_keeps_request_id() {
        let malformed = parse_header("5 GET BY_ID abc").unwrap_err();
        assert_eq!(malformed.request_id, Some(5));
        assert!(matches!(
            malformed.error,
            ProtocolError::InvalidIdentifier(_)
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_header("").unwrap_err().request_id, None);
        assert_eq!(parse_header("GET BY_ID 1").unwrap_err().request_id, None);
        assert_eq!(parse_header("3 FETCH BY_ID 1").unwrap_err().request_id, Some(3));
        assert_eq!(parse_header("3 GET BY_ID").unwrap_err().request_id, Some(3));
        assert_eq!(parse_header("3 EXIT now").unwrap_err().request_id, Some(3));
    }

    #[test]
    fn test_parse_bad_put_name_expects_payload() {
        for header in ["3 PUT", "3 PUT my file.txt"] {
            let malformed = parse_header(header).unwrap_err();
            assert_eq!(malformed.request_id, Some(3));
            assert!(malformed.has_payload);
            assert!(matches!(malformed.error, ProtocolError::InvalidName(_)));
        }
        assert!(!parse_header("3 GET BY_ID x").unwrap_err().has_payload);
    }

    #[test]
    fn test_encode_refuses_names_that_split() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            Request::put(1, "my file.txt", vec![1u8]).encode(&mut buf),
            Err(ProtocolError::InvalidName(_))
        ));
        assert!(matches!(
            Request::get(2, FileIdentifier::ByName("a\tb".to_string())).encode(&mut buf),
            Err(ProtocolError::InvalidName(_))
        ));
        assert!(matches!(
            Request::delete(3, FileIdentifier::ByName(String::new())).encode(&mut buf),
            Err(ProtocolError::InvalidName(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_text() {
        let request = Request::get(2, FileIdentifier::ByName("a.txt".to_string()));
        assert_eq!(request.header(), "2 GET BY_NAME a.txt");
        assert_eq!(Request::put(3, "b", vec![1u8]).header(), "3 PUT b");
        assert_eq!(Request::exit(4).to_string(), "4 EXIT");
    }
}
