//! Upstream-facing SASL PLAIN client.
//!
//! Authenticates the proxy against the broker after the upstream connection
//! (and gateway auth, when enabled) is up: SaslHandshake v1 to confirm the
//! broker offers PLAIN, then SaslAuthenticate v0 with the configured
//! credentials.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, RequestHeader, ResponseHeader, SaslAuthenticateRequest, SaslAuthenticateResponse,
    SaslHandshakeRequest, SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{AuthError, ProxyError, Result};
use crate::network::codec::{read_frame, write_frame, MAX_FRAME_SIZE};

const HANDSHAKE_VERSION: i16 = 1;
const AUTHENTICATE_VERSION: i16 = 0;

/// SASL PLAIN client for broker connections.
pub struct SaslPlainClient {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl SaslPlainClient {
    /// Run the PLAIN exchange on an established upstream stream.
    ///
    /// # Errors
    ///
    /// Returns an auth error when the broker does not offer PLAIN or
    /// rejects the credentials, and protocol/IO errors otherwise.
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_handshake(stream, 1).await?;
        let handshake = self.read_handshake_response(stream, 1).await?;

        if handshake.error_code != 0 {
            return Err(AuthError::SaslFailed {
                error_code: handshake.error_code,
                message: "broker rejected SASL handshake".to_string(),
            }
            .into());
        }
        if !handshake.mechanisms.iter().any(|m| m.to_string() == "PLAIN") {
            return Err(AuthError::UnsupportedMechanism(format!(
                "broker offers {:?}, PLAIN required",
                handshake.mechanisms
            ))
            .into());
        }

        self.send_authenticate(stream, 2).await?;
        let authenticate = self.read_authenticate_response(stream, 2).await?;

        if authenticate.error_code != 0 {
            let message = authenticate
                .error_message
                .as_ref()
                .map_or_else(|| "authentication failed".to_string(), ToString::to_string);
            return Err(AuthError::SaslFailed {
                error_code: authenticate.error_code,
                message,
            }
            .into());
        }

        debug!(username = %self.username, "upstream SASL authentication successful");
        Ok(())
    }

    async fn send_handshake<S>(&self, stream: &mut S, correlation_id: i32) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = SaslHandshakeRequest::default();
        request.mechanism = StrBytes::from_static_str("PLAIN");

        let buf = self.encode_request(
            ApiKey::SaslHandshakeKey,
            HANDSHAKE_VERSION,
            correlation_id,
            &request,
        )?;
        timeout(self.write_timeout, write_frame(stream, &buf))
            .await
            .map_err(|_| AuthError::Timeout("SASL handshake write"))??;
        Ok(())
    }

    async fn send_authenticate<S>(&self, stream: &mut S, correlation_id: i32) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut auth_bytes = Vec::with_capacity(2 + self.username.len() + self.password.len());
        auth_bytes.push(0);
        auth_bytes.extend_from_slice(self.username.as_bytes());
        auth_bytes.push(0);
        auth_bytes.extend_from_slice(self.password.as_bytes());

        let mut request = SaslAuthenticateRequest::default();
        request.auth_bytes = Bytes::from(auth_bytes);

        let buf = self.encode_request(
            ApiKey::SaslAuthenticateKey,
            AUTHENTICATE_VERSION,
            correlation_id,
            &request,
        )?;
        timeout(self.write_timeout, write_frame(stream, &buf))
            .await
            .map_err(|_| AuthError::Timeout("SASL authenticate write"))??;
        Ok(())
    }

    fn encode_request<T: Encodable>(
        &self,
        api_key: ApiKey,
        api_version: i16,
        correlation_id: i32,
        body: &T,
    ) -> Result<BytesMut> {
        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = api_version;
        header.correlation_id = correlation_id;
        header.client_id = Some(StrBytes::from_string(self.client_id.clone()));

        let mut buf = BytesMut::new();
        header
            .encode(&mut buf, api_key.request_header_version(api_version))
            .map_err(|e| ProxyError::ProtocolEncode {
                message: format!("request header: {e}"),
            })?;
        body.encode(&mut buf, api_version)
            .map_err(|e| ProxyError::ProtocolEncode {
                message: format!("request body: {e}"),
            })?;
        Ok(buf)
    }

    async fn read_handshake_response<S>(
        &self,
        stream: &mut S,
        correlation_id: i32,
    ) -> Result<SaslHandshakeResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut payload = self.read_response(stream, correlation_id, ApiKey::SaslHandshakeKey, HANDSHAKE_VERSION).await?;
        SaslHandshakeResponse::decode(&mut payload, HANDSHAKE_VERSION).map_err(|e| {
            ProxyError::ProtocolDecode {
                message: format!("SaslHandshake response: {e}"),
            }
        })
    }

    async fn read_authenticate_response<S>(
        &self,
        stream: &mut S,
        correlation_id: i32,
    ) -> Result<SaslAuthenticateResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut payload = self
            .read_response(stream, correlation_id, ApiKey::SaslAuthenticateKey, AUTHENTICATE_VERSION)
            .await?;
        SaslAuthenticateResponse::decode(&mut payload, AUTHENTICATE_VERSION).map_err(|e| {
            ProxyError::ProtocolDecode {
                message: format!("SaslAuthenticate response: {e}"),
            }
        })
    }

    async fn read_response<S>(
        &self,
        stream: &mut S,
        correlation_id: i32,
        api_key: ApiKey,
        api_version: i16,
    ) -> Result<Bytes>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = timeout(self.read_timeout, read_frame(stream, MAX_FRAME_SIZE))
            .await
            .map_err(|_| AuthError::Timeout("SASL response read"))??;

        let mut payload = frame.freeze();
        let header =
            ResponseHeader::decode(&mut payload, api_key.response_header_version(api_version))
                .map_err(|e| ProxyError::ProtocolDecode {
                    message: format!("response header: {e}"),
                })?;

        if header.correlation_id != correlation_id {
            return Err(ProxyError::ProtocolDecode {
                message: format!(
                    "correlation id mismatch: expected {correlation_id}, got {}",
                    header.correlation_id
                ),
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::api_keys;
    use tokio::io::DuplexStream;

    fn test_client() -> SaslPlainClient {
        SaslPlainClient {
            client_id: "edge-proxy".to_string(),
            username: "svc-user".to_string(),
            password: "svc-pass".to_string(),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }

    /// Minimal scripted broker: answers one handshake and one authenticate.
    async fn run_broker(
        mut stream: DuplexStream,
        mechanisms: Vec<&'static str>,
        auth_error_code: i16,
    ) -> Vec<u8> {
        // Handshake request
        let frame = read_frame(&mut stream, MAX_FRAME_SIZE).await.unwrap();
        let mut buf = frame.freeze();
        let header = RequestHeader::decode(&mut buf, 1).unwrap();
        assert_eq!(header.request_api_key, api_keys::SASL_HANDSHAKE);
        assert_eq!(header.client_id.as_ref().unwrap().to_string(), "edge-proxy");

        let mut response = SaslHandshakeResponse::default();
        response.error_code = 0;
        response.mechanisms = mechanisms
            .into_iter()
            .map(StrBytes::from_static_str)
            .collect();

        let mut out = BytesMut::new();
        let mut resp_header = ResponseHeader::default();
        resp_header.correlation_id = header.correlation_id;
        resp_header.encode(&mut out, 0).unwrap();
        response.encode(&mut out, 1).unwrap();
        write_frame(&mut stream, &out).await.unwrap();

        // Authenticate request
        let frame = read_frame(&mut stream, MAX_FRAME_SIZE).await.unwrap();
        let mut buf = frame.freeze();
        let header = RequestHeader::decode(&mut buf, 1).unwrap();
        assert_eq!(header.request_api_key, api_keys::SASL_AUTHENTICATE);
        let request = SaslAuthenticateRequest::decode(&mut buf, 0).unwrap();

        let mut response = SaslAuthenticateResponse::default();
        response.error_code = auth_error_code;
        if auth_error_code != 0 {
            response.error_message = Some(StrBytes::from_static_str("bad credentials"));
        }

        let mut out = BytesMut::new();
        let mut resp_header = ResponseHeader::default();
        resp_header.correlation_id = header.correlation_id;
        resp_header.encode(&mut out, 0).unwrap();
        response.encode(&mut out, 0).unwrap();
        write_frame(&mut stream, &out).await.unwrap();

        request.auth_bytes.to_vec()
    }

    #[tokio::test]
    async fn test_successful_exchange() {
        let (mut client_side, broker_side) = tokio::io::duplex(4096);
        let broker = tokio::spawn(run_broker(broker_side, vec!["PLAIN", "SCRAM-SHA-256"], 0));

        test_client().authenticate(&mut client_side).await.unwrap();

        let auth_bytes = broker.await.unwrap();
        assert_eq!(auth_bytes, b"\0svc-user\0svc-pass");
    }

    #[tokio::test]
    async fn test_plain_not_offered() {
        let (mut client_side, broker_side) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            // The client bails after the handshake; ignore the broker error.
            let _ = tokio::spawn(run_broker(broker_side, vec!["SCRAM-SHA-512"], 0)).await;
        });

        let err = test_client()
            .authenticate(&mut client_side)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Auth(AuthError::UnsupportedMechanism(_))
        ));
    }

    #[tokio::test]
    async fn test_credentials_rejected() {
        let (mut client_side, broker_side) = tokio::io::duplex(4096);
        tokio::spawn(run_broker(broker_side, vec!["PLAIN"], 58));

        let err = test_client()
            .authenticate(&mut client_side)
            .await
            .unwrap_err();
        match err {
            ProxyError::Auth(AuthError::SaslFailed {
                error_code,
                message,
            }) => {
                assert_eq!(error_code, 58);
                assert!(message.contains("bad credentials"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
