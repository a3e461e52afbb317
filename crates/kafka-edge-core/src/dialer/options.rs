//! TCP socket tuning for established upstream connections.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::config::KafkaConfig;

/// Options applied once per upstream socket after the dial completes.
#[derive(Debug, Clone, Default)]
pub struct TcpConnOptions {
    /// Keep-alive probe interval, `None` to leave the OS default.
    pub keep_alive: Option<Duration>,
    /// SO_RCVBUF, 0 keeps the OS default.
    pub read_buffer_size: usize,
    /// SO_SNDBUF, 0 keeps the OS default.
    pub write_buffer_size: usize,
}

impl TcpConnOptions {
    /// Build from the Kafka connection configuration.
    #[must_use]
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            keep_alive: config.keep_alive(),
            read_buffer_size: config.connection_read_buffer_size,
            write_buffer_size: config.connection_write_buffer_size,
        }
    }

    /// Whether any option would actually change the socket.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.keep_alive.is_none() && self.read_buffer_size == 0 && self.write_buffer_size == 0
    }

    /// Apply the options to a raw TCP socket.
    ///
    /// # Errors
    ///
    /// Returns the first `setsockopt` failure.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        if let Some(interval) = self.keep_alive {
            sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(interval))?;
        }
        if self.read_buffer_size > 0 {
            sock.set_recv_buffer_size(self.read_buffer_size)?;
        }
        if self.write_buffer_size > 0 {
            sock.set_send_buffer_size(self.write_buffer_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_apply_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let options = TcpConnOptions {
            keep_alive: Some(Duration::from_secs(30)),
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
        };
        options.apply(&stream).unwrap();

        // The kernel may round buffer sizes, but they must be non-zero.
        let sock = SockRef::from(&stream);
        assert!(sock.recv_buffer_size().unwrap() > 0);
        assert!(sock.send_buffer_size().unwrap() > 0);
    }

    #[test]
    fn test_is_noop() {
        assert!(TcpConnOptions::default().is_noop());
        let options = TcpConnOptions {
            keep_alive: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(!options.is_noop());
    }
}
