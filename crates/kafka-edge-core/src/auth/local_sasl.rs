//! Downstream-facing SASL PLAIN server.
//!
//! Runs a single SaslHandshake + SaslAuthenticate exchange on an accepted
//! connection before it is admitted to the pumps. The state machine is
//! strictly linear: `AwaitingHandshake` then `AwaitingAuthenticate` then
//! `Authenticated`; any unexpected request in either state closes the
//! connection. Only the PLAIN mechanism is offered.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, RequestHeader, ResponseHeader, SaslAuthenticateRequest, SaslAuthenticateResponse,
    SaslHandshakeRequest, SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AuthError, ProxyError, Result};
use crate::network::codec::{read_frame, write_frame, MAX_FRAME_SIZE};
use crate::protocol::api_keys;

use super::PasswordAuthenticator;

const UNSUPPORTED_SASL_MECHANISM: i16 = 33;
const SASL_AUTHENTICATION_FAILED: i16 = 58;

/// SASL PLAIN server for downstream clients.
pub struct LocalSaslServer {
    authenticator: Arc<dyn PasswordAuthenticator>,
    /// Bounds the password authenticator round-trip.
    auth_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl LocalSaslServer {
    /// Create a new server around the injected authenticator.
    #[must_use]
    pub fn new(
        authenticator: Arc<dyn PasswordAuthenticator>,
        auth_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            authenticator,
            auth_timeout,
            read_timeout,
            write_timeout,
        }
    }

    /// Run the handshake; returns the authenticated username.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for out-of-order or malformed requests and
    /// an auth error when the mechanism or credentials are rejected. The
    /// caller closes the connection on any error.
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // State: AwaitingHandshake
        let (header, api_version, payload) = self.read_request(stream).await?;
        if header.request_api_key != api_keys::SASL_HANDSHAKE {
            return Err(ProxyError::ProtocolDecode {
                message: format!(
                    "expected SaslHandshake, got api key {}",
                    header.request_api_key
                ),
            });
        }

        let mut body = payload;
        let request = SaslHandshakeRequest::decode(&mut body, api_version).map_err(|e| {
            ProxyError::ProtocolDecode {
                message: format!("SaslHandshake request: {e}"),
            }
        })?;

        let mechanism = request.mechanism.to_string();
        debug!(mechanism = %mechanism, "SASL handshake request");
        if mechanism != "PLAIN" {
            self.write_handshake_response(
                stream,
                header.correlation_id,
                api_version,
                UNSUPPORTED_SASL_MECHANISM,
            )
            .await?;
            return Err(AuthError::UnsupportedMechanism(mechanism).into());
        }
        self.write_handshake_response(stream, header.correlation_id, api_version, 0)
            .await?;

        // State: AwaitingAuthenticate
        let (header, api_version, payload) = self.read_request(stream).await?;
        if header.request_api_key != api_keys::SASL_AUTHENTICATE {
            return Err(ProxyError::ProtocolDecode {
                message: format!(
                    "expected SaslAuthenticate, got api key {}",
                    header.request_api_key
                ),
            });
        }

        let mut body = payload;
        let request = SaslAuthenticateRequest::decode(&mut body, api_version).map_err(|e| {
            ProxyError::ProtocolDecode {
                message: format!("SaslAuthenticate request: {e}"),
            }
        })?;

        let Some((username, password)) = parse_plain_credentials(&request.auth_bytes) else {
            self.write_authenticate_response(
                stream,
                header.correlation_id,
                api_version,
                SASL_AUTHENTICATION_FAILED,
                Some("malformed PLAIN credentials"),
            )
            .await?;
            return Err(AuthError::InvalidCredentials.into());
        };

        let verdict = timeout(
            self.auth_timeout,
            self.authenticator.authenticate(&username, &password),
        )
        .await;

        let accepted = match verdict {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                warn!(username = %username, error = %e, "password authenticator failed");
                false
            }
            Err(_) => {
                warn!(username = %username, "password authenticator timed out");
                false
            }
        };

        if !accepted {
            warn!(username = %username, "SASL authentication failed");
            self.write_authenticate_response(
                stream,
                header.correlation_id,
                api_version,
                SASL_AUTHENTICATION_FAILED,
                Some("authentication failed"),
            )
            .await?;
            return Err(AuthError::InvalidCredentials.into());
        }

        // State: Authenticated
        self.write_authenticate_response(stream, header.correlation_id, api_version, 0, None)
            .await?;
        debug!(username = %username, "SASL authentication successful");
        Ok(username)
    }

    /// Read one frame and decode its request header.
    async fn read_request<S>(&self, stream: &mut S) -> Result<(RequestHeader, i16, Bytes)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = timeout(self.read_timeout, read_frame(stream, MAX_FRAME_SIZE))
            .await
            .map_err(|_| AuthError::Timeout("SASL handshake read"))??;

        if frame.len() < 4 {
            return Err(ProxyError::ProtocolDecode {
                message: "frame too small for request header".to_string(),
            });
        }
        let api_key = i16::from_be_bytes([frame[0], frame[1]]);
        let api_version = i16::from_be_bytes([frame[2], frame[3]]);

        let key = ApiKey::try_from(api_key).map_err(|_| ProxyError::ProtocolDecode {
            message: format!("unknown api key {api_key} during SASL handshake"),
        })?;
        let header_version = key.request_header_version(api_version);

        let mut payload = frame.freeze();
        let header =
            RequestHeader::decode(&mut payload, header_version).map_err(|e| {
                ProxyError::ProtocolDecode {
                    message: format!("request header: {e}"),
                }
            })?;
        Ok((header, api_version, payload))
    }

    async fn write_handshake_response<S>(
        &self,
        stream: &mut S,
        correlation_id: i32,
        api_version: i16,
        error_code: i16,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut response = SaslHandshakeResponse::default();
        response.error_code = error_code;
        response.mechanisms = vec![StrBytes::from_static_str("PLAIN")];

        let header_version = ApiKey::SaslHandshakeKey.response_header_version(api_version);
        let buf = encode_response(correlation_id, header_version, &response, api_version)?;
        timeout(self.write_timeout, write_frame(stream, &buf))
            .await
            .map_err(|_| AuthError::Timeout("SASL handshake write"))??;
        Ok(())
    }

    async fn write_authenticate_response<S>(
        &self,
        stream: &mut S,
        correlation_id: i32,
        api_version: i16,
        error_code: i16,
        error_message: Option<&str>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut response = SaslAuthenticateResponse::default();
        response.error_code = error_code;
        response.error_message = error_message.map(|m| StrBytes::from_string(m.to_string()));
        response.auth_bytes = Bytes::new();

        let header_version = ApiKey::SaslAuthenticateKey.response_header_version(api_version);
        let buf = encode_response(correlation_id, header_version, &response, api_version)?;
        timeout(self.write_timeout, write_frame(stream, &buf))
            .await
            .map_err(|_| AuthError::Timeout("SASL authenticate write"))??;
        Ok(())
    }
}

/// Encode a response header and body into one frame body.
fn encode_response<T: Encodable>(
    correlation_id: i32,
    header_version: i16,
    body: &T,
    api_version: i16,
) -> Result<BytesMut> {
    let mut header = ResponseHeader::default();
    header.correlation_id = correlation_id;

    let mut buf = BytesMut::new();
    header
        .encode(&mut buf, header_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response header: {e}"),
        })?;
    body.encode(&mut buf, api_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response body: {e}"),
        })?;
    Ok(buf)
}

/// Parse `\0username\0password`, tolerating a leading authorization id.
fn parse_plain_credentials(auth_bytes: &[u8]) -> Option<(String, String)> {
    let parts: Vec<&[u8]> = auth_bytes.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return None;
    }
    let username = std::str::from_utf8(parts[1]).ok()?;
    let password = std::str::from_utf8(parts[2]).ok()?;
    if username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}
