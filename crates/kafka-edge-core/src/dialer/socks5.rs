//! SOCKS5 client dialer (RFC 1928) with username/password
//! sub-negotiation (RFC 1929).

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::split_host_port;
use crate::error::{ProxyError, Result};

use super::direct::DirectDialer;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dialer that tunnels through a SOCKS5 forward proxy.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    /// Dialer for the proxy hop itself.
    pub inner: DirectDialer,
    /// Proxy `host:port`.
    pub proxy_addr: String,
    /// Username for RFC 1929 sub-negotiation; empty means anonymous.
    pub username: String,
    /// Password for RFC 1929 sub-negotiation.
    pub password: String,
}

impl Socks5Dialer {
    /// Connect to `target` through the proxy.
    ///
    /// # Errors
    ///
    /// Returns a dial error for the proxy hop and a forward-proxy error for
    /// any SOCKS-level failure.
    pub async fn dial(&self, target: &str) -> Result<TcpStream> {
        let mut stream = self.inner.dial(&self.proxy_addr).await?;
        self.handshake(&mut stream, target).await?;
        debug!(proxy = %self.proxy_addr, target = %target, "SOCKS5 tunnel established");
        Ok(stream)
    }

    /// Run the SOCKS5 negotiation on an established stream.
    async fn handshake<S>(&self, stream: &mut S, target: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (host, port) =
            split_host_port(target).map_err(|_| ProxyError::ForwardProxy(format!(
                "invalid target address: {target}"
            )))?;

        // Method negotiation.
        let with_auth = !self.username.is_empty();
        let greeting: &[u8] = if with_auth {
            &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
        } else {
            &[SOCKS_VERSION, 1, METHOD_NONE]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(ProxyError::ForwardProxy(format!(
                "unexpected SOCKS version {}",
                choice[0]
            )));
        }
        match choice[1] {
            METHOD_NONE => {}
            METHOD_USERPASS if with_auth => self.authenticate(stream).await?,
            METHOD_UNACCEPTABLE => {
                return Err(ProxyError::ForwardProxy(
                    "proxy accepted none of our auth methods".to_string(),
                ))
            }
            other => {
                return Err(ProxyError::ForwardProxy(format!(
                    "proxy selected unsupported auth method {other:#04x}"
                )))
            }
        }

        // CONNECT request.
        let mut request = BytesMut::with_capacity(7 + host.len());
        request.put_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            request.put_u8(ATYP_IPV4);
            request.put_slice(&v4.octets());
        } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
            request.put_u8(ATYP_IPV6);
            request.put_slice(&v6.octets());
        } else {
            if host.len() > 255 {
                return Err(ProxyError::ForwardProxy(format!(
                    "hostname too long for SOCKS5: {host}"
                )));
            }
            request.put_u8(ATYP_DOMAIN);
            request.put_u8(host.len() as u8);
            request.put_slice(host.as_bytes());
        }
        request.put_u16(port);
        stream.write_all(&request).await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(ProxyError::ForwardProxy(format!(
                "unexpected SOCKS version {} in reply",
                head[0]
            )));
        }
        if head[1] != 0x00 {
            return Err(ProxyError::ForwardProxy(format!(
                "SOCKS5 connect failed: {}",
                reply_message(head[1])
            )));
        }

        // Drain the bound address; its content is irrelevant to the tunnel.
        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(ProxyError::ForwardProxy(format!(
                    "unknown address type {other:#04x} in reply"
                )))
            }
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(())
    }

    /// RFC 1929 username/password sub-negotiation.
    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.username.len() > 255 || self.password.len() > 255 {
            return Err(ProxyError::ForwardProxy(
                "SOCKS5 credentials exceed 255 bytes".to_string(),
            ));
        }

        let mut msg = BytesMut::with_capacity(3 + self.username.len() + self.password.len());
        msg.put_u8(AUTH_VERSION);
        msg.put_u8(self.username.len() as u8);
        msg.put_slice(self.username.as_bytes());
        msg.put_u8(self.password.len() as u8);
        msg.put_slice(self.password.as_bytes());
        stream.write_all(&msg).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(ProxyError::ForwardProxy(
                "SOCKS5 authentication rejected".to_string(),
            ));
        }
        Ok(())
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_dialer(username: &str, password: &str) -> Socks5Dialer {
        Socks5Dialer {
            inner: DirectDialer {
                dial_timeout: Duration::from_secs(1),
                keep_alive: None,
            },
            proxy_addr: "unused:1080".to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    /// Scripted SOCKS5 server half for a duplex stream.
    async fn run_server(
        mut stream: tokio::io::DuplexStream,
        expect_auth: bool,
        reply_code: u8,
    ) -> Vec<u8> {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.unwrap();
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();

        if expect_auth {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_USERPASS])
                .await
                .unwrap();
            let mut ver = [0u8; 2];
            stream.read_exact(&mut ver).await.unwrap();
            let mut user = vec![0u8; ver[1] as usize];
            stream.read_exact(&mut user).await.unwrap();
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await.unwrap();
            stream.write_all(&[AUTH_VERSION, 0x00]).await.unwrap();
        } else {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_NONE])
                .await
                .unwrap();
        }

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let mut rest = match head[3] {
            ATYP_IPV4 => vec![0u8; 6],
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                vec![0u8; len[0] as usize + 2]
            }
            _ => panic!("unexpected atyp"),
        };
        stream.read_exact(&mut rest).await.unwrap();

        stream
            .write_all(&[SOCKS_VERSION, reply_code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        rest
    }

    #[tokio::test]
    async fn test_anonymous_connect_domain_target() {
        let (client, server) = tokio::io::duplex(256);
        let server_task = tokio::spawn(run_server(server, false, 0x00));

        let dialer = test_dialer("", "");
        let mut client = client;
        dialer
            .handshake(&mut client, "kafka-1.internal:9092")
            .await
            .unwrap();

        let tail = server_task.await.unwrap();
        // Domain bytes then the big-endian port.
        let domain_len = tail.len() - 2;
        assert_eq!(&tail[..domain_len], b"kafka-1.internal");
        assert_eq!(
            u16::from_be_bytes([tail[domain_len], tail[domain_len + 1]]),
            9092
        );
    }

    #[tokio::test]
    async fn test_userpass_negotiation() {
        let (client, server) = tokio::io::duplex(256);
        let server_task = tokio::spawn(run_server(server, true, 0x00));

        let dialer = test_dialer("alice", "secret");
        let mut client = client;
        dialer
            .handshake(&mut client, "10.0.0.5:9092")
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_reply() {
        let (client, server) = tokio::io::duplex(256);
        tokio::spawn(run_server(server, false, 0x05));

        let dialer = test_dialer("", "");
        let mut client = client;
        let err = dialer
            .handshake(&mut client, "kafka:9092")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
