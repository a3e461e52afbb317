//! Composable dialer chain for upstream broker connections.
//!
//! Modeled as tagged variants, each carrying its inner step: the raw hop is
//! direct TCP, or a SOCKS5 / HTTP CONNECT tunnel; TLS, when enabled, is
//! always the outermost wrapper. The chain is built once at startup from
//! configuration, which is also where scheme and TLS validation happen.

pub mod direct;
pub mod http_connect;
pub mod options;
pub mod socks5;

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::config::{split_host_port, ForwardProxyConfig, ForwardProxyScheme, KafkaConfig};
use crate::error::{ProxyError, Result, TlsError};
use crate::network::UpstreamStream;
use crate::tls::TlsConnector;

pub use direct::DirectDialer;
pub use http_connect::HttpConnectDialer;
pub use options::TcpConnOptions;
pub use socks5::Socks5Dialer;

/// The hop that produces the raw TCP stream.
#[derive(Debug, Clone)]
pub enum RawDialer {
    /// Straight to the broker.
    Direct(DirectDialer),
    /// Through a SOCKS5 forward proxy.
    Socks5(Socks5Dialer),
    /// Through an HTTP CONNECT forward proxy.
    HttpConnect(HttpConnectDialer),
}

impl RawDialer {
    async fn dial(&self, addr: &str) -> Result<TcpStream> {
        match self {
            Self::Direct(dialer) => dialer.dial(addr).await,
            Self::Socks5(dialer) => dialer.dial(addr).await,
            Self::HttpConnect(dialer) => dialer.dial(addr).await,
        }
    }
}

/// TLS wrapper around a raw dialer.
#[derive(Clone)]
pub struct TlsDialer {
    raw: RawDialer,
    handshake_timeout: Duration,
    connector: TlsConnector,
}

impl TlsDialer {
    async fn dial(&self, addr: &str) -> Result<UpstreamStream> {
        let stream = self.raw.dial(addr).await?;
        let (host, _port) = split_host_port(addr)?;

        let tls_stream = match timeout(self.handshake_timeout, self.connector.connect(&host, stream))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::Tls(TlsError::Handshake(
                    "handshake timeout".to_string(),
                )))
            }
        };
        Ok(UpstreamStream::tls(tls_stream))
    }
}

/// The complete dialer chain.
#[derive(Clone)]
pub enum Dialer {
    /// No TLS: the raw hop's stream is used directly.
    Raw(RawDialer),
    /// TLS as the outermost wrapper.
    Tls(TlsDialer),
}

impl Dialer {
    /// Build the chain from configuration.
    ///
    /// # Errors
    ///
    /// Returns a config error for an unsupported forward-proxy scheme and a
    /// TLS error when the upstream TLS configuration cannot be loaded.
    pub fn from_config(
        kafka: &KafkaConfig,
        forward_proxy: Option<&ForwardProxyConfig>,
    ) -> Result<Self> {
        let direct = DirectDialer {
            dial_timeout: kafka.dial_timeout(),
            keep_alive: kafka.keep_alive(),
        };

        let raw = match forward_proxy {
            Some(config) => {
                let resolved = config.resolve()?;
                match resolved.scheme {
                    ForwardProxyScheme::Socks5 => {
                        info!(proxy = %resolved.address, "broker connections will use the SOCKS5 proxy");
                        RawDialer::Socks5(Socks5Dialer {
                            inner: direct,
                            proxy_addr: resolved.address,
                            username: resolved.username,
                            password: resolved.password,
                        })
                    }
                    ForwardProxyScheme::Http => {
                        info!(proxy = %resolved.address, "broker connections will use the HTTP proxy using CONNECT");
                        RawDialer::HttpConnect(HttpConnectDialer {
                            inner: direct,
                            proxy_addr: resolved.address,
                            username: resolved.username,
                            password: resolved.password,
                        })
                    }
                }
            }
            None => RawDialer::Direct(direct),
        };

        if kafka.tls.enable {
            let connector = TlsConnector::new(&kafka.tls)?;
            return Ok(Self::Tls(TlsDialer {
                raw,
                handshake_timeout: kafka.dial_timeout(),
                connector,
            }));
        }
        Ok(Self::Raw(raw))
    }

    /// Establish an upstream connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns dial, forward-proxy, or TLS errors depending on which step
    /// of the chain failed.
    pub async fn dial(&self, addr: &str) -> Result<UpstreamStream> {
        match self {
            Self::Raw(raw) => Ok(UpstreamStream::tcp(raw.dial(addr).await?)),
            Self::Tls(tls) => tls.dial(addr).await,
        }
    }
}
