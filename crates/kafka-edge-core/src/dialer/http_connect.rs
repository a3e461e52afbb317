//! HTTP CONNECT tunnel dialer (RFC 7231 section 4.3.6) with optional
//! Basic proxy authorization.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{ProxyError, Result};

use super::direct::DirectDialer;

/// Upper bound on the CONNECT response head we are willing to buffer.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Dialer that tunnels through an HTTP forward proxy using CONNECT.
#[derive(Debug, Clone)]
pub struct HttpConnectDialer {
    /// Dialer for the proxy hop itself.
    pub inner: DirectDialer,
    /// Proxy `host:port`.
    pub proxy_addr: String,
    /// Username for Basic auth; empty means no Proxy-Authorization header.
    pub username: String,
    /// Password for Basic auth.
    pub password: String,
}

impl HttpConnectDialer {
    /// Connect to `target` through the proxy.
    ///
    /// # Errors
    ///
    /// Returns a dial error for the proxy hop and a forward-proxy error
    /// when the proxy refuses the tunnel.
    pub async fn dial(&self, target: &str) -> Result<TcpStream> {
        let mut stream = self.inner.dial(&self.proxy_addr).await?;
        self.handshake(&mut stream, target).await?;
        debug!(proxy = %self.proxy_addr, target = %target, "HTTP CONNECT tunnel established");
        Ok(stream)
    }

    /// Send the CONNECT request and wait for a 2xx response head.
    async fn handshake<S>(&self, stream: &mut S, target: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if !self.username.is_empty() {
            let credentials = BASE64.encode(format!("{}:{}", self.username, self.password));
            request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Read until the end of the response head.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_RESPONSE_HEAD {
                return Err(ProxyError::ForwardProxy(
                    "CONNECT response head too large".to_string(),
                ));
            }
            stream.read_exact(&mut byte).await?;
            head.push(byte[0]);
        }

        let head = String::from_utf8_lossy(&head);
        let status_line = head.lines().next().unwrap_or_default();
        let status = parse_status_code(status_line).ok_or_else(|| {
            ProxyError::ForwardProxy(format!("malformed CONNECT status line: {status_line:?}"))
        })?;

        if !(200..300).contains(&status) {
            return Err(ProxyError::ForwardProxy(format!(
                "proxy refused CONNECT: {status_line}"
            )));
        }
        Ok(())
    }
}

/// Extract the status code from `HTTP/1.x CODE REASON`.
fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}
