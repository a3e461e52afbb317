//! Gateway token handshake, both directions.
//!
//! The gateway handshake runs on the raw TCP session before any Kafka
//! traffic. Wire format (big-endian):
//!
//! ```text
//! request: magic u64 | method_len u32 | method | token_len u32 | token
//! reply:   status u32 (0 = ok) | err_len u32 | err
//! ```
//!
//! The client side sends the frame toward a gateway-protected upstream; the
//! server side validates the symmetric frame from downstream clients.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{AuthError, ProxyError, Result};

use super::{TokenInfo, TokenProvider};

/// Sanity cap on the method field.
const MAX_METHOD_LEN: usize = 1024;
/// Sanity cap on the token field.
const MAX_TOKEN_LEN: usize = 1024 * 1024;
/// Sanity cap on the error message in a reply.
const MAX_ERR_LEN: usize = 64 * 1024;

/// Client side: authenticates this proxy toward an upstream gateway.
pub struct GatewayAuthClient {
    pub magic: u64,
    pub method: String,
    pub timeout: Duration,
    pub token_provider: Arc<dyn TokenProvider>,
}

impl GatewayAuthClient {
    /// Run the handshake on an established upstream stream.
    ///
    /// # Errors
    ///
    /// Returns an auth error when the token cannot be obtained or the peer
    /// replies with a non-zero status.
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let token = timeout(self.timeout, self.token_provider.get_token(&self.method))
            .await
            .map_err(|_| AuthError::Timeout("token provider"))?
            .map_err(|e| AuthError::Collaborator {
                collaborator: "token provider",
                message: e.to_string(),
            })?;

        let mut frame =
            BytesMut::with_capacity(8 + 4 + self.method.len() + 4 + token.len());
        frame.put_u64(self.magic);
        frame.put_u32(self.method.len() as u32);
        frame.put_slice(self.method.as_bytes());
        frame.put_u32(token.len() as u32);
        frame.put_slice(token.as_bytes());

        timeout(self.timeout, stream.write_all(&frame))
            .await
            .map_err(|_| AuthError::Timeout("gateway auth write"))??;

        let (status, message) = timeout(self.timeout, read_reply(stream))
            .await
            .map_err(|_| AuthError::Timeout("gateway auth read"))??;

        if status != 0 {
            return Err(AuthError::GatewayRejected { status, message }.into());
        }
        debug!(method = %self.method, "gateway auth accepted");
        Ok(())
    }
}

/// Server side: validates downstream clients of a gateway-protected proxy.
pub struct GatewayAuthServer {
    pub magic: u64,
    pub method: String,
    pub timeout: Duration,
    pub token_info: Arc<dyn TokenInfo>,
}

impl GatewayAuthServer {
    /// Run the handshake on an accepted downstream stream.
    ///
    /// A magic or method mismatch closes without a reply; a rejected or
    /// unverifiable token is answered with a non-zero status before the
    /// connection closes.
    ///
    /// # Errors
    ///
    /// Returns an auth error for every rejection path and a protocol error
    /// for malformed frames.
    pub async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (magic, method, token) = timeout(self.timeout, read_auth_frame(stream))
            .await
            .map_err(|_| AuthError::Timeout("gateway auth read"))??;

        if magic != self.magic {
            return Err(AuthError::MagicMismatch {
                expected: self.magic,
                actual: magic,
            }
            .into());
        }
        if method != self.method {
            return Err(AuthError::MethodMismatch {
                expected: self.method.clone(),
                actual: method,
            }
            .into());
        }

        let verdict = timeout(self.timeout, self.token_info.verify_token(&method, &token)).await;

        let (status, message): (u32, &str) = match &verdict {
            Ok(Ok(true)) => (0, ""),
            Ok(Ok(false)) => (1, "invalid token"),
            Ok(Err(e)) => {
                warn!(error = %e, "token verifier failed");
                (2, "token verification error")
            }
            Err(_) => (2, "token verification timeout"),
        };

        let mut reply = BytesMut::with_capacity(8 + message.len());
        reply.put_u32(status);
        reply.put_u32(message.len() as u32);
        reply.put_slice(message.as_bytes());
        timeout(self.timeout, stream.write_all(&reply))
            .await
            .map_err(|_| AuthError::Timeout("gateway auth write"))??;

        if status != 0 {
            return Err(AuthError::GatewayRejected {
                status,
                message: message.to_string(),
            }
            .into());
        }
        debug!(method = %self.method, "downstream gateway auth accepted");
        Ok(())
    }
}

/// Read `magic | method | token` from the stream.
async fn read_auth_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u64, String, String)> {
    let mut magic_buf = [0u8; 8];
    stream.read_exact(&mut magic_buf).await?;
    let magic = u64::from_be_bytes(magic_buf);

    let method = read_field(stream, MAX_METHOD_LEN, "method").await?;
    let token = read_field(stream, MAX_TOKEN_LEN, "token").await?;
    Ok((magic, method, token))
}

/// Read `status | err` from the stream.
async fn read_reply<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u32, String)> {
    let mut status_buf = [0u8; 4];
    stream.read_exact(&mut status_buf).await?;
    let status = u32::from_be_bytes(status_buf);

    let message = read_field(stream, MAX_ERR_LEN, "error message").await?;
    Ok((status, message))
}

/// Read one `len u32 | bytes` field with a sanity cap.
async fn read_field<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_len: usize,
    what: &str,
) -> Result<String> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(ProxyError::ProtocolDecode {
            message: format!("gateway auth {what} length {len} exceeds {max_len}"),
        });
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProxyError::ProtocolDecode {
        message: format!("gateway auth {what} is not valid UTF-8"),
    })
}
