//! Mock Kafka broker for integration testing.
//!
//! A lightweight broker stand-in that accepts length-prefixed Kafka
//! frames, records every request, and answers with configurable
//! responses. Optionally expects a gateway auth frame before any Kafka
//! traffic, mirroring a gateway-protected deployment.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
    /// The raw request bytes (without length prefix).
    pub request_bytes: Bytes,
}

/// Response generator: returns the complete response payload (correlation
/// id included, length prefix excluded). An empty payload suppresses the
/// reply, leaving the request in flight.
pub type ResponseGenerator = Arc<dyn Fn(&BrokerCall) -> Bytes + Send + Sync>;

/// A recorded gateway auth frame.
#[derive(Debug, Clone)]
pub struct GatewayFrame {
    pub magic: u64,
    pub method: String,
    pub token: String,
}

/// Gateway expectations for accepted connections.
#[derive(Clone)]
struct GatewayExpectation {
    magic: u64,
    status: u32,
}

/// Mock Kafka broker.
pub struct MockBroker {
    address: String,
    shutdown_tx: Option<broadcast::Sender<()>>,
    call_log: Arc<RwLock<Vec<BrokerCall>>>,
    gateway_log: Arc<RwLock<Vec<GatewayFrame>>>,
    response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
    gateway: Option<GatewayExpectation>,
}

impl MockBroker {
    /// Create a new mock broker that will bind to the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            shutdown_tx: None,
            call_log: Arc::new(RwLock::new(Vec::new())),
            gateway_log: Arc::new(RwLock::new(Vec::new())),
            response_handlers: Arc::new(RwLock::new(HashMap::new())),
            gateway: None,
        }
    }

    /// Expect a gateway auth frame with this magic before Kafka traffic on
    /// every connection; reply with `status`.
    #[must_use]
    pub fn with_gateway(mut self, magic: u64, status: u32) -> Self {
        self.gateway = Some(GatewayExpectation { magic, status });
        self
    }

    /// Register a response generator for one api_key.
    pub async fn set_response(&self, api_key: i16, generator: ResponseGenerator) {
        self.response_handlers.write().await.insert(api_key, generator);
    }

    /// All Kafka requests seen so far.
    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.call_log.read().await.clone()
    }

    /// All gateway frames seen so far.
    pub async fn gateway_frames(&self) -> Vec<GatewayFrame> {
        self.gateway_log.read().await.clone()
    }

    /// Start the broker; returns the actual listening address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn start(&mut self) -> std::io::Result<String> {
        let listener = TcpListener::bind(&self.address).await?;
        let actual_address = listener.local_addr()?.to_string();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let call_log = Arc::clone(&self.call_log);
        let gateway_log = Arc::clone(&self.gateway_log);
        let response_handlers = Arc::clone(&self.response_handlers);
        let gateway = self.gateway.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _addr)) = result else { break };
                        let call_log = Arc::clone(&call_log);
                        let gateway_log = Arc::clone(&gateway_log);
                        let response_handlers = Arc::clone(&response_handlers);
                        let gateway = gateway.clone();

                        tokio::spawn(async move {
                            let _ = Self::handle_connection(
                                stream,
                                call_log,
                                gateway_log,
                                response_handlers,
                                gateway,
                            )
                            .await;
                        });
                    }
                }
            }
        });

        Ok(actual_address)
    }

    /// Stop the broker.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        call_log: Arc<RwLock<Vec<BrokerCall>>>,
        gateway_log: Arc<RwLock<Vec<GatewayFrame>>>,
        response_handlers: Arc<RwLock<HashMap<i16, ResponseGenerator>>>,
        gateway: Option<GatewayExpectation>,
    ) -> std::io::Result<()> {
        if let Some(expectation) = gateway {
            let frame = Self::read_gateway_frame(&mut stream).await?;
            let ok = frame.magic == expectation.magic;
            gateway_log.write().await.push(frame);

            let status = if ok { expectation.status } else { 1 };
            let mut reply = BytesMut::new();
            reply.put_u32(status);
            reply.put_u32(0);
            stream.write_all(&reply).await?;
            if status != 0 {
                return Ok(());
            }
        }

        loop {
            let mut len_buf = [0u8; 4];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return Ok(()); // client closed
            }
            let len = u32::from_be_bytes(len_buf) as usize;

            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;

            if body.len() < 8 {
                continue;
            }
            let call = BrokerCall {
                api_key: i16::from_be_bytes([body[0], body[1]]),
                api_version: i16::from_be_bytes([body[2], body[3]]),
                correlation_id: i32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                request_bytes: Bytes::from(body),
            };

            let response = {
                let handlers = response_handlers.read().await;
                handlers.get(&call.api_key).map(|generator| generator(&call))
            };
            let response = response.unwrap_or_else(|| default_response(&call));

            call_log.write().await.push(call);

            // An empty generated response means "swallow the request".
            if response.is_empty() {
                continue;
            }

            let mut out = BytesMut::with_capacity(4 + response.len());
            out.put_u32(response.len() as u32);
            out.extend_from_slice(&response);
            stream.write_all(&out).await?;
        }
    }

    async fn read_gateway_frame(stream: &mut TcpStream) -> std::io::Result<GatewayFrame> {
        let mut magic_buf = [0u8; 8];
        stream.read_exact(&mut magic_buf).await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let mut method = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut method).await?;

        stream.read_exact(&mut len_buf).await?;
        let mut token = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut token).await?;

        Ok(GatewayFrame {
            magic: u64::from_be_bytes(magic_buf),
            method: String::from_utf8_lossy(&method).to_string(),
            token: String::from_utf8_lossy(&token).to_string(),
        })
    }
}

/// Correlation id echoed back with an empty body.
fn default_response(call: &BrokerCall) -> Bytes {
    let mut response = BytesMut::new();
    response.put_i32(call.correlation_id);
    response.put_u32(0);
    response.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_answers() {
        let mut broker = MockBroker::new("127.0.0.1:0");
        let addr = broker.start().await.unwrap();

        let mut client = TcpStream::connect(&addr).await.unwrap();

        // ApiVersions v3, correlation 7.
        let mut frame = BytesMut::new();
        frame.put_u32(10);
        frame.put_i16(18);
        frame.put_i16(3);
        frame.put_i32(7);
        frame.put_i16(-1);
        client.write_all(&frame).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(i32::from_be_bytes([body[0], body[1], body[2], body[3]]), 7);

        let calls = broker.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].api_key, 18);
        assert_eq!(calls[0].correlation_id, 7);

        broker.stop();
    }

    #[tokio::test]
    async fn test_custom_response_generator() {
        let mut broker = MockBroker::new("127.0.0.1:0");
        let addr = broker.start().await.unwrap();

        broker
            .set_response(
                18,
                Arc::new(|call| {
                    let mut response = BytesMut::new();
                    response.put_i32(call.correlation_id);
                    response.put_slice(b"custom");
                    response.freeze()
                }),
            )
            .await;

        let mut client = TcpStream::connect(&addr).await.unwrap();
        let mut frame = BytesMut::new();
        frame.put_u32(10);
        frame.put_i16(18);
        frame.put_i16(3);
        frame.put_i32(1);
        frame.put_i16(-1);
        client.write_all(&frame).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body[4..], b"custom");

        broker.stop();
    }
}
