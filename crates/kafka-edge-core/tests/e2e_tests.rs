//! End-to-end tests: a client socket through the proxy core to a mock
//! broker, asserting the transparency, rewrite, and forbidden-key
//! behaviors at the byte level.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
use kafka_protocol::messages::{ApiKey, BrokerId, MetadataResponse, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use kafka_edge_core::testing::{MockBroker, ProxyTestHarness};
use kafka_edge_core::Collaborators;

const API_VERSIONS: i16 = 18;
const METADATA: i16 = 3;
const PRODUCE: i16 = 0;

/// A request frame (without length prefix): fixed header, null client id,
/// some opaque body bytes.
fn request_body(api_key: i16, api_version: i16, correlation_id: i32) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(api_key);
    body.put_i16(api_version);
    body.put_i32(correlation_id);
    body.put_i16(-1); // null client id
    body.put_slice(&[0xAA, 0xBB, 0xCC]);
    body
}

async fn send_frame(stream: &mut TcpStream, body: &[u8]) {
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    stream.write_all(&frame).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> BytesMut {
    let mut len_buf = [0u8; 4];
    timeout(Duration::from_secs(2), stream.read_exact(&mut len_buf))
        .await
        .expect("frame read timed out")
        .unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut body = BytesMut::zeroed(len);
    timeout(Duration::from_secs(2), stream.read_exact(&mut body))
        .await
        .expect("frame body read timed out")
        .unwrap();
    body
}

async fn read_eof(stream: &mut TcpStream) {
    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(2), stream.read(&mut probe))
        .await
        .expect("expected the proxy to close the connection");
    assert_eq!(read.unwrap(), 0, "expected EOF");
}

#[tokio::test]
async fn test_direct_passthrough_is_byte_identical() {
    let harness =
        ProxyTestHarness::start(ProxyTestHarness::default_config(), Collaborators::default())
            .await;

    // Scripted ApiVersions response with a recognizable body.
    let canned: &[u8] = &[0x00, 0x00, 0x00, 0x2A, 0xDE, 0xAD, 0xBE, 0xEF];
    harness
        .broker
        .set_response(
            API_VERSIONS,
            Arc::new(|_| {
                Bytes::from_static(&[0x00, 0x00, 0x00, 0x2A, 0xDE, 0xAD, 0xBE, 0xEF])
            }),
        )
        .await;

    let mut client = harness.connect().await;
    let request = request_body(API_VERSIONS, 3, 42);
    send_frame(&mut client, &request).await;

    let response = read_frame(&mut client).await;
    assert_eq!(&response[..], canned, "response must be forwarded byte-identical");

    let calls = harness.broker.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(
        &calls[0].request_bytes[..],
        &request[..],
        "request must be forwarded byte-identical"
    );
    assert_eq!(calls[0].correlation_id, 42);

    harness.shutdown();
}

#[tokio::test]
async fn test_metadata_rewrite_points_clients_at_the_edge() {
    let mut config = ProxyTestHarness::default_config();
    let collaborators = Collaborators {
        address_mapper: Some(Arc::new(|_host: &str, _port: u16| {
            ("edge.example.com".to_string(), 19092)
        })),
        ..Default::default()
    };

    let broker = MockBroker::new("127.0.0.1:0");
    let harness = ProxyTestHarness::start_with_broker(broker, &mut config, collaborators).await;

    harness
        .broker
        .set_response(
            METADATA,
            Arc::new(|call| {
                let mut broker = MetadataResponseBroker::default();
                broker.node_id = BrokerId(1);
                broker.host = StrBytes::from_static_str("kafka-1.internal");
                broker.port = 9092;

                let mut response = MetadataResponse::default();
                response.brokers.push(broker);

                let mut header = ResponseHeader::default();
                header.correlation_id = call.correlation_id;

                let header_version =
                    ApiKey::MetadataKey.response_header_version(call.api_version);
                let mut out = BytesMut::new();
                header.encode(&mut out, header_version).unwrap();
                response.encode(&mut out, call.api_version).unwrap();
                out.freeze()
            }),
        )
        .await;

    let mut client = harness.connect().await;
    send_frame(&mut client, &request_body(METADATA, 9, 7)).await;

    let response = read_frame(&mut client).await;
    let mut buf = Bytes::copy_from_slice(&response);
    let header =
        ResponseHeader::decode(&mut buf, ApiKey::MetadataKey.response_header_version(9)).unwrap();
    let body = MetadataResponse::decode(&mut buf, 9).unwrap();
    assert!(!buf.has_remaining(), "length prefix must match the rewritten body");

    assert_eq!(header.correlation_id, 7);
    assert_eq!(body.brokers[0].host.to_string(), "edge.example.com");
    assert_eq!(body.brokers[0].port, 19092);
    assert_eq!(body.brokers[0].node_id, BrokerId(1), "non-address fields unchanged");

    harness.shutdown();
}

#[tokio::test]
async fn test_forbidden_api_key_closes_before_forwarding() {
    let mut config = ProxyTestHarness::default_config();
    config.kafka.forbidden_api_keys = vec![PRODUCE];

    let harness = ProxyTestHarness::start(config, Collaborators::default()).await;

    let mut client = harness.connect().await;
    send_frame(&mut client, &request_body(PRODUCE, 9, 1)).await;

    read_eof(&mut client).await;
    assert!(
        harness.broker.calls().await.is_empty(),
        "the forbidden frame must never reach the broker"
    );
    assert_eq!(harness.metrics.forbidden_requests_total.get(), 1.0);

    harness.shutdown();
}

#[tokio::test]
async fn test_requests_keep_their_order() {
    let harness =
        ProxyTestHarness::start(ProxyTestHarness::default_config(), Collaborators::default())
            .await;

    let mut client = harness.connect().await;
    for correlation_id in 0..20 {
        send_frame(&mut client, &request_body(API_VERSIONS, 3, correlation_id)).await;
    }
    for correlation_id in 0..20 {
        let response = read_frame(&mut client).await;
        assert_eq!(
            i32::from_be_bytes([response[0], response[1], response[2], response[3]]),
            correlation_id
        );
    }

    let calls = harness.broker.calls().await;
    let seen: Vec<i32> = calls.iter().map(|c| c.correlation_id).collect();
    assert_eq!(seen, (0..20).collect::<Vec<_>>(), "frame order must be preserved");

    harness.shutdown();
}

#[tokio::test]
async fn test_duplicate_inflight_correlation_closes_connection() {
    let harness =
        ProxyTestHarness::start(ProxyTestHarness::default_config(), Collaborators::default())
            .await;

    // Swallow responses so the first correlation id stays in flight.
    harness
        .broker
        .set_response(API_VERSIONS, Arc::new(|_| Bytes::new()))
        .await;

    let mut client = harness.connect().await;
    send_frame(&mut client, &request_body(API_VERSIONS, 3, 5)).await;
    send_frame(&mut client, &request_body(API_VERSIONS, 3, 5)).await;

    read_eof(&mut client).await;
    harness.shutdown();
}
