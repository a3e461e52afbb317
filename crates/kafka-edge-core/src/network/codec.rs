//! Kafka protocol frame codecs.
//!
//! Implements tokio's `Decoder` trait for the two directions of the proxy.
//! Kafka uses a simple framing format: 4-byte big-endian length prefix
//! followed by the message bytes. The request codec parses just enough of
//! the header to route the frame (api_key, api_version, correlation_id,
//! client_id); the response codec parses only the correlation id. Payload
//! bytes are never mutated here.

use bytes::{Buf, BufMut, BytesMut};
use kafka_protocol::messages::ApiKey;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

/// Hard cap on frame size (100 MiB), guarding against garbage length
/// prefixes and malicious input.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// A Kafka request frame with its parsed fixed header.
#[derive(Debug)]
pub struct RequestFrame {
    /// The API key for this request.
    pub api_key: i16,
    /// The API version.
    pub api_version: i16,
    /// The correlation ID for request/response matching.
    pub correlation_id: i32,
    /// The client id from the request header, when parseable.
    pub client_id: Option<String>,
    /// The complete frame bytes (after the length prefix).
    pub payload: BytesMut,
}

/// A Kafka response frame.
#[derive(Debug)]
pub struct ResponseFrame {
    /// The correlation ID echoed by the broker.
    pub correlation_id: i32,
    /// The complete frame bytes (after the length prefix).
    pub payload: BytesMut,
}

/// Pull one length-prefixed frame out of `src`, or return `None` when more
/// bytes are needed.
fn split_frame(src: &mut BytesMut, max_frame_size: usize) -> io::Result<Option<BytesMut>> {
    if src.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

    if length > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {length} exceeds maximum {max_frame_size}"),
        ));
    }

    if src.len() < 4 + length {
        src.reserve(4 + length - src.len());
        return Ok(None);
    }

    src.advance(4);
    Ok(Some(src.split_to(length)))
}

/// Codec for the downstream-to-upstream direction.
#[derive(Debug, Clone)]
pub struct RequestCodec {
    max_frame_size: usize,
}

impl RequestCodec {
    /// Create a new codec with the default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with a custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestCodec {
    type Item = RequestFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(payload) = split_frame(src, self.max_frame_size)? else {
            return Ok(None);
        };

        // Fixed header: api_key + api_version + correlation_id
        if payload.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame too small for request header",
            ));
        }

        let api_key = i16::from_be_bytes([payload[0], payload[1]]);
        let api_version = i16::from_be_bytes([payload[2], payload[3]]);
        let correlation_id =
            i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let client_id = parse_client_id(&payload, api_key, api_version);

        Ok(Some(RequestFrame {
            api_key,
            api_version,
            correlation_id,
            client_id,
            payload,
        }))
    }
}

/// Best-effort client id extraction.
///
/// Unknown api_keys and malformed headers yield `None`; the frame is still
/// forwarded verbatim either way.
fn parse_client_id(payload: &[u8], api_key: i16, api_version: i16) -> Option<String> {
    let key = ApiKey::try_from(api_key).ok()?;
    // Header v0 has no client id field.
    if key.request_header_version(api_version) < 1 {
        return None;
    }

    let rest = payload.get(8..)?;
    if rest.len() < 2 {
        return None;
    }
    let len = i16::from_be_bytes([rest[0], rest[1]]);
    if len < 0 {
        return None;
    }
    let bytes = rest.get(2..2 + len as usize)?;
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

/// Codec for the upstream-to-downstream direction.
#[derive(Debug, Clone)]
pub struct ResponseCodec {
    max_frame_size: usize,
}

impl ResponseCodec {
    /// Create a new codec with the default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with a custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ResponseCodec {
    type Item = ResponseFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(payload) = split_frame(src, self.max_frame_size)? else {
            return Ok(None);
        };

        if payload.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame too small for response header",
            ));
        }

        let correlation_id =
            i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);

        Ok(Some(ResponseFrame {
            correlation_id,
            payload,
        }))
    }
}

/// Write one frame: 4-byte big-endian length prefix followed by the body,
/// as a single buffered write.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one frame body (the bytes after the length prefix).
///
/// Used by the handshake phases that run before the connection is handed to
/// the framed pumps.
///
/// # Errors
///
/// Returns an error on I/O failure or when the length prefix exceeds
/// `max_frame_size`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> io::Result<BytesMut> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf) as usize;

    if length > max_frame_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {length} exceeds maximum {max_frame_size}"),
        ));
    }

    let mut body = BytesMut::zeroed(length);
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request_frame(api_key: i16, api_version: i16, correlation_id: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        let client_id = b"edge-test";
        // Length: 8 header + 2 client id length + client id + 4 body
        buf.put_u32(8 + 2 + client_id.len() as u32 + 4);
        buf.put_i16(api_key);
        buf.put_i16(api_version);
        buf.put_i32(correlation_id);
        buf.put_i16(client_id.len() as i16);
        buf.put_slice(client_id);
        buf.put_u32(0);
        buf
    }

    #[test]
    fn test_decode_request_frame() {
        let mut codec = RequestCodec::new();
        let mut buf = make_request_frame(18, 3, 12345); // ApiVersions v3

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.api_key, 18);
        assert_eq!(frame.api_version, 3);
        assert_eq!(frame.correlation_id, 12345);
        assert_eq!(frame.client_id.as_deref(), Some("edge-test"));
    }

    #[test]
    fn test_decode_unknown_api_key_still_forwards() {
        let mut codec = RequestCodec::new();
        let mut buf = make_request_frame(9999, 0, 7);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.api_key, 9999);
        assert_eq!(frame.client_id, None);
        assert!(!frame.payload.is_empty());
    }

    #[test]
    fn test_decode_null_client_id() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_i16(18); // ApiVersions
        buf.put_i16(1);
        buf.put_i32(1);
        buf.put_i16(-1); // null client id
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.client_id, None);
    }

    #[test]
    fn test_decode_incomplete_length() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_incomplete_body() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut codec = RequestCodec::with_max_frame_size(100);
        let mut buf = BytesMut::new();
        buf.put_u32(200);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_response_frame() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_i32(42);
        buf.put_u32(0xDEAD_BEEF);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 42);
        assert_eq!(frame.payload.len(), 8);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&make_request_frame(18, 3, 1));
        buf.extend_from_slice(&make_request_frame(3, 9, 2));

        let frame1 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame1.correlation_id, 1);
        let frame2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame2.correlation_id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"hello kafka").await.unwrap();
        let body = read_frame(&mut b, MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(&body[..], b"hello kafka");
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversize() {
        let (mut a, mut b) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        a.write_all(&u32::to_be_bytes(1 << 30)).await.unwrap();

        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
