use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::request::{parse_header, Command, MalformedRequest, Request};
use super::response::Response;
use super::{ProtocolError, DEFAULT_MAX_PAYLOAD, MAX_HEADER_LEN};

/// Append a 2-byte length-prefixed UTF-8 frame.
pub fn put_text_frame(dst: &mut BytesMut, text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_HEADER_LEN {
        return Err(ProtocolError::HeaderTooLong(text.len()));
    }
    dst.reserve(2 + text.len());
    dst.put_u16(text.len() as u16);
    dst.put_slice(text.as_bytes());
    Ok(())
}

/// Append a 4-byte length-prefixed binary payload.
pub fn put_payload(dst: &mut BytesMut, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > u32::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            limit: u32::MAX as usize,
        });
    }
    dst.reserve(4 + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// One decoded unit from the client.
#[derive(Debug)]
pub enum Frame {
    Request(Request),
    /// A complete frame whose text did not parse. The stream stays in sync,
    /// so the connection can keep going.
    Malformed(MalformedRequest),
}

/// What a PUT payload will be attached to once it has arrived.
#[derive(Debug)]
enum PendingPut {
    Named(String),
    /// The header did not parse; the payload is read and discarded
    Rejected(MalformedRequest),
}

#[derive(Debug)]
enum DecodeState {
    Header,
    /// PUT header read, waiting on the payload length and bytes
    Payload {
        request_id: u64,
        put: PendingPut,
        len: Option<usize>,
    },
}

/// Server side of the protocol: decodes requests, encodes responses.
///
/// Decoding never assumes a whole frame is buffered. It consumes nothing
/// until a complete unit is available, and remembers a parsed PUT header
/// while the payload is still arriving.
#[derive(Debug)]
pub struct ServerCodec {
    max_payload: usize,
    state: DecodeState,
}

impl ServerCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            state: DecodeState::Header,
        }
    }

    /// Split off one complete text frame, if buffered.
    fn take_text_frame(src: &mut BytesMut) -> Option<BytesMut> {
        if src.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return None;
        }
        src.advance(2);
        Some(src.split_to(len))
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for ServerCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Header) {
                DecodeState::Header => {
                    let Some(raw) = Self::take_text_frame(src) else {
                        return Ok(None);
                    };
                    let text = match std::str::from_utf8(&raw) {
                        Ok(text) => text,
                        Err(_) => {
                            return Ok(Some(Frame::Malformed(MalformedRequest {
                                request_id: None,
                                error: ProtocolError::InvalidRequest(
                                    String::from_utf8_lossy(&raw).to_string(),
                                ),
                                has_payload: false,
                            })));
                        }
                    };

                    let (request_id, put) = match parse_header(text) {
                        Ok((request_id, Command::Put(name))) => (request_id, PendingPut::Named(name)),
                        Ok((request_id, command)) => {
                            return Ok(Some(Frame::Request(
                                command.into_request(request_id, Bytes::new()),
                            )));
                        }
                        // A bad PUT header still has its payload on the wire
                        Err(malformed) => match malformed.request_id {
                            Some(request_id) if malformed.has_payload => {
                                (request_id, PendingPut::Rejected(malformed))
                            }
                            _ => return Ok(Some(Frame::Malformed(malformed))),
                        },
                    };
                    self.state = DecodeState::Payload {
                        request_id,
                        put,
                        len: None,
                    };
                }
                DecodeState::Payload {
                    request_id,
                    put,
                    len,
                } => {
                    let size = match len {
                        Some(size) => size,
                        None => {
                            if src.len() < 4 {
                                self.state = DecodeState::Payload {
                                    request_id,
                                    put,
                                    len: None,
                                };
                                return Ok(None);
                            }
                            let size = src.get_u32() as usize;
                            if size > self.max_payload {
                                return Err(ProtocolError::PayloadTooLarge {
                                    size,
                                    limit: self.max_payload,
                                });
                            }
                            size
                        }
                    };

                    if src.len() < size {
                        src.reserve(size - src.len());
                        self.state = DecodeState::Payload {
                            request_id,
                            put,
                            len: Some(size),
                        };
                        return Ok(None);
                    }

                    let payload = src.split_to(size).freeze();
                    let frame = match put {
                        PendingPut::Named(name) => {
                            Frame::Request(Command::Put(name).into_request(request_id, payload))
                        }
                        PendingPut::Rejected(malformed) => Frame::Malformed(malformed),
                    };
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        put_text_frame(dst, &response.header())?;
        if let Some(payload) = &response.payload {
            put_payload(dst, payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestKind;
    use crate::storage::FileIdentifier;

    fn encoded(request: &Request) -> BytesMut {
        let mut buf = BytesMut::new();
        request.encode(&mut buf).unwrap();
        buf
    }

    fn expect_request(frame: Option<Frame>) -> Request {
        match frame {
            Some(Frame::Request(request)) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let request = Request::put(1, "a.txt", vec![1u8, 2, 3]);
        let wire = encoded(&request);

        let mut codec = ServerCodec::default();
        let mut src = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            src.put_u8(*byte);
            let frame = codec.decode(&mut src).unwrap();
            if i + 1 < wire.len() {
                assert!(frame.is_none(), "frame completed early at byte {i}");
            } else {
                decoded = Some(expect_request(frame));
            }
        }
        assert_eq!(decoded, Some(request));
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut src = encoded(&Request::put(1, "a", vec![9u8; 10]));
        src.extend_from_slice(&encoded(&Request::get(
            2,
            FileIdentifier::ByName("a".to_string()),
        )));
        src.extend_from_slice(&encoded(&Request::exit(3)));

        let mut codec = ServerCodec::default();
        let first = expect_request(codec.decode(&mut src).unwrap());
        assert!(matches!(first.kind, RequestKind::Put { ref payload, .. } if payload.len() == 10));
        assert_eq!(expect_request(codec.decode(&mut src).unwrap()).request_id, 2);
        assert_eq!(
            expect_request(codec.decode(&mut src).unwrap()).kind,
            RequestKind::Exit
        );
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_decode_empty_put_payload() {
        let mut src = encoded(&Request::put(4, "empty", Bytes::new()));
        let request = expect_request(ServerCodec::default().decode(&mut src).unwrap());
        assert_eq!(request, Request::put(4, "empty", Bytes::new()));
    }

    #[test]
    fn test_malformed_frame_keeps_stream_in_sync() {
        let mut src = BytesMut::new();
        put_text_frame(&mut src, "1 FETCH everything").unwrap();
        src.extend_from_slice(&encoded(&Request::exit(2)));

        let mut codec = ServerCodec::default();
        match codec.decode(&mut src).unwrap() {
            Some(Frame::Malformed(malformed)) => assert_eq!(malformed.request_id, Some(1)),
            other => panic!("expected malformed frame, got {other:?}"),
        }
        assert_eq!(
            expect_request(codec.decode(&mut src).unwrap()),
            Request::exit(2)
        );
    }

    #[test]
    fn test_bad_put_header_skips_its_payload() {
        let mut src = BytesMut::new();
        put_text_frame(&mut src, "1 PUT a b").unwrap();
        // The payload looks like a request of its own and must not be read as one
        let mut smuggled = BytesMut::new();
        put_text_frame(&mut smuggled, "9 EXIT").unwrap();
        put_payload(&mut src, &smuggled).unwrap();
        src.extend_from_slice(&encoded(&Request::get(
            2,
            FileIdentifier::ByName("a".to_string()),
        )));

        let mut codec = ServerCodec::default();
        match codec.decode(&mut src).unwrap() {
            Some(Frame::Malformed(malformed)) => {
                assert_eq!(malformed.request_id, Some(1));
                assert!(matches!(malformed.error, ProtocolError::InvalidName(_)));
            }
            other => panic!("expected malformed frame, got {other:?}"),
        }
        assert_eq!(expect_request(codec.decode(&mut src).unwrap()).request_id, 2);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_bad_put_header_waits_for_payload() {
        let mut src = BytesMut::new();
        put_text_frame(&mut src, "4 PUT").unwrap();
        src.put_u32(3);
        src.put_u8(7);

        let mut codec = ServerCodec::default();
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.put_slice(&[8, 9]);
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Malformed(MalformedRequest {
                request_id: Some(4),
                ..
            }))
        ));
        assert!(src.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut src = BytesMut::new();
        src.put_u16(2);
        src.put_slice(&[0xff, 0xfe]);
        assert!(matches!(
            ServerCodec::default().decode(&mut src).unwrap(),
            Some(Frame::Malformed(MalformedRequest {
                request_id: None,
                ..
            }))
        ));
    }

    #[test]
    fn test_payload_over_limit_is_an_error() {
        let mut src = encoded(&Request::put(1, "big", vec![0u8; 16]));
        let mut codec = ServerCodec::new(8);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::PayloadTooLarge { size: 16, limit: 8 })
        ));
    }

    #[test]
    fn test_encode_response_with_payload() {
        let response = Response::ok(5).with_payload(Bytes::from_static(&[1, 2, 3]));
        let mut dst = BytesMut::new();
        ServerCodec::default().encode(response, &mut dst).unwrap();

        let header = b"5 200 ";
        assert_eq!(&dst[..2], &(header.len() as u16).to_be_bytes());
        assert_eq!(&dst[2..2 + header.len()], header);
        assert_eq!(&dst[2 + header.len()..6 + header.len()], &3u32.to_be_bytes());
        assert_eq!(&dst[6 + header.len()..], &[1, 2, 3]);
    }
}
