use bytes::{Bytes, BytesMut};
use file_server::protocol::{
    put_text_frame, Frame, ProtocolError, Request, RequestKind, Response, ServerCodec, Status,
};
use file_server::storage::FileIdentifier;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

fn wire(requests: &[Request]) -> BytesMut {
    let mut buf = BytesMut::new();
    for request in requests {
        request.encode(&mut buf).unwrap();
    }
    buf
}

#[tokio::test]
async fn test_requests_split_across_reads() {
    let requests = vec![
        Request::put(0, "photo.jpg", vec![0xABu8; 3000]),
        Request::get(1, FileIdentifier::ById(0)),
        Request::delete(2, FileIdentifier::ByName("photo.jpg".to_string())),
        Request::exit(3),
    ];
    let buf = wire(&requests);

    let (mut client, server) = tokio::io::duplex(64);
    let writer = tokio::spawn(async move {
        // Odd-sized chunks so frame boundaries land mid-read
        for chunk in buf.chunks(7) {
            client.write_all(chunk).await.unwrap();
        }
        client
    });

    let mut frames = FramedRead::new(server, ServerCodec::default());
    let mut decoded = Vec::new();
    while decoded.len() < requests.len() {
        match frames.next().await {
            Some(Ok(Frame::Request(request))) => decoded.push(request),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(decoded, requests);

    drop(writer.await.unwrap());
    assert!(frames.next().await.is_none());
}

#[tokio::test]
async fn test_malformed_frames_are_reported_and_skipped() {
    let mut buf = BytesMut::new();
    put_text_frame(&mut buf, "not even an id").unwrap();
    put_text_frame(&mut buf, "9 GET BY_SIZE 12").unwrap();
    put_text_frame(&mut buf, "10 RENAME a b").unwrap();
    Request::get(11, FileIdentifier::ByName("ok".to_string()))
        .encode(&mut buf)
        .unwrap();

    let (mut client, server) = tokio::io::duplex(1024);
    client.write_all(&buf).await.unwrap();
    drop(client);

    let frames: Vec<_> = FramedRead::new(server, ServerCodec::default())
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|f| f.unwrap())
        .collect();
    assert_eq!(frames.len(), 4);

    match &frames[0] {
        Frame::Malformed(m) => assert_eq!(m.request_id, None),
        other => panic!("expected malformed frame, got {other:?}"),
    }
    match &frames[1] {
        Frame::Malformed(m) => {
            assert_eq!(m.request_id, Some(9));
            assert!(matches!(m.error, ProtocolError::InvalidIdentifier(_)));
        }
        other => panic!("expected malformed frame, got {other:?}"),
    }
    match &frames[2] {
        Frame::Malformed(m) => {
            assert_eq!(m.request_id, Some(10));
            assert!(matches!(m.error, ProtocolError::InvalidRequest(_)));
        }
        other => panic!("expected malformed frame, got {other:?}"),
    }
    match &frames[3] {
        Frame::Request(request) => assert_eq!(request.request_id, 11),
        other => panic!("expected request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_closed_mid_payload() {
    let buf = wire(&[Request::put(0, "cut.bin", vec![1u8; 100])]);

    let (mut client, server) = tokio::io::duplex(1024);
    client.write_all(&buf[..buf.len() - 10]).await.unwrap();
    drop(client);

    let mut frames = FramedRead::new(server, ServerCodec::default());
    match frames.next().await {
        Some(Err(ProtocolError::Io(_))) => {}
        other => panic!("expected an IO error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_responses_on_the_wire() {
    let (mut client, server) = tokio::io::duplex(1024);
    let mut sink = FramedWrite::new(server, ServerCodec::default());

    sink.send(Response::ok(4).with_info("17")).await.unwrap();
    sink.send(Response::ok(5).with_payload(Bytes::from_static(b"abc")))
        .await
        .unwrap();
    sink.send(Response::new(6, Status::Forbidden)).await.unwrap();
    drop(sink);

    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();

    let mut expected = BytesMut::new();
    put_text_frame(&mut expected, "4 200 17").unwrap();
    put_text_frame(&mut expected, "5 200 ").unwrap();
    expected.extend_from_slice(&3u32.to_be_bytes());
    expected.extend_from_slice(b"abc");
    put_text_frame(&mut expected, "6 403 ").unwrap();
    assert_eq!(raw, expected.to_vec());
}

#[test]
fn test_response_header_parsing() {
    let response = Response::parse_header("12 200 3").unwrap();
    assert_eq!(response.request_id, 12);
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.info, "3");

    let response = Response::parse_header("13 404 ").unwrap();
    assert_eq!(response.status, Status::NotFound);
    assert!(response.info.is_empty());

    assert!(Response::parse_header("14 418 teapot").is_err());
    assert!(Response::parse_header("garbage").is_err());
}

#[test]
fn test_request_display() {
    assert_eq!(
        Request::get(1, FileIdentifier::ById(7)).to_string(),
        "1 GET BY_ID 7"
    );
    assert_eq!(
        Request::put(2, "a.txt", Bytes::new()).to_string(),
        "2 PUT a.txt"
    );
    assert!(matches!(
        Request::exit(3).kind,
        RequestKind::Exit
    ));
}

#[tokio::test]
async fn test_bad_put_header_resyncs_across_reads() {
    let mut buf = BytesMut::new();
    put_text_frame(&mut buf, "1 PUT a b").unwrap();
    buf.extend_from_slice(&5u32.to_be_bytes());
    buf.extend_from_slice(b"12345");
    Request::get(2, FileIdentifier::ById(0))
        .encode(&mut buf)
        .unwrap();

    let (mut client, server) = tokio::io::duplex(64);
    let writer = tokio::spawn(async move {
        for chunk in buf.chunks(3) {
            client.write_all(chunk).await.unwrap();
        }
    });

    let frames: Vec<_> = FramedRead::new(server, ServerCodec::default())
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|f| f.unwrap())
        .collect();
    writer.await.unwrap();
    assert_eq!(frames.len(), 2);

    match &frames[0] {
        Frame::Malformed(m) => {
            assert_eq!(m.request_id, Some(1));
            assert!(m.has_payload);
            assert!(matches!(m.error, ProtocolError::InvalidName(_)));
        }
        other => panic!("expected malformed frame, got {other:?}"),
    }
    match &frames[1] {
        Frame::Request(request) => assert_eq!(*request, Request::get(2, FileIdentifier::ById(0))),
        other => panic!("expected request, got {other:?}"),
    }
}
