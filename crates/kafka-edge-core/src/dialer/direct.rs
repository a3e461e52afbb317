//! Direct TCP dialer.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Plain TCP dialer with connect timeout and keep-alive.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    /// Bound on the TCP connect.
    pub dial_timeout: Duration,
    /// Keep-alive probe interval, `None` to leave the OS default.
    pub keep_alive: Option<Duration>,
}

impl DirectDialer {
    /// Connect to `addr`.
    ///
    /// # Errors
    ///
    /// Returns a dial error when the connect fails or times out.
    pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
        let stream = match timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProxyError::Dial {
                    address: addr.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ProxyError::Dial {
                    address: addr.to_string(),
                    message: "connect timeout".to_string(),
                })
            }
        };

        stream.set_nodelay(true)?;
        if let Some(interval) = self.keep_alive {
            let sock = SockRef::from(&stream);
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))?;
        }

        debug!(address = %addr, "connected");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dialer = DirectDialer {
            dial_timeout: Duration::from_secs(1),
            keep_alive: Some(Duration::from_secs(60)),
        };
        let stream = dialer.dial(&addr).await.unwrap();
        assert!(stream.peer_addr().is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let dialer = DirectDialer {
            dial_timeout: Duration::from_millis(200),
            keep_alive: None,
        };
        let result = dialer.dial("127.0.0.1:59999").await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));
    }
}
