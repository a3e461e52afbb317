//! TCP listeners feeding the proxy supervisor.
//!
//! Each configured `{listen_address, broker_address}` mapping gets its own
//! `TcpListener`. Accepted sockets are tagged with the broker address and
//! sent into the supervisor's channel; the supervisor owns everything after
//! that. Dropping the channel sender (all listeners stopped) is the
//! supervisor's shutdown signal.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::proxy::Conn;

/// The set of proxy listeners.
pub struct ProxyListeners {
    mappings: Vec<ListenerConfig>,
    shutdown: CancellationToken,
}

impl ProxyListeners {
    /// Create listeners for the configured mappings.
    #[must_use]
    pub fn new(mappings: Vec<ListenerConfig>, shutdown: CancellationToken) -> Self {
        Self { mappings, shutdown }
    }

    /// Bind every mapping and run the accept loops until cancellation.
    ///
    /// Accepted connections are sent to `tx`; the sender is dropped on
    /// return, which tells the supervisor no more connections will arrive.
    ///
    /// # Errors
    ///
    /// Returns an error if any listen address cannot be bound. Accept
    /// errors are logged and do not stop the loop.
    pub async fn run(self, tx: mpsc::Sender<Conn>) -> Result<()> {
        let mut tasks = Vec::with_capacity(self.mappings.len());

        for mapping in self.mappings {
            let listener = TcpListener::bind(&mapping.listen_address).await?;
            info!(
                listen = %mapping.listen_address,
                broker = %mapping.broker_address,
                "proxy listening"
            );

            let tx = tx.clone();
            let shutdown = self.shutdown.clone();
            let broker_address = mapping.broker_address.clone();

            tasks.push(tokio::spawn(async move {
                accept_loop(listener, broker_address, tx, shutdown).await;
            }));
        }
        drop(tx);

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "listener task failed");
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker_address: String,
    tx: mpsc::Sender<Conn>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        if let Err(e) = socket.set_nodelay(true) {
                            warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        debug!(peer = %peer, broker = %broker_address, "accepted connection");
                        let conn = Conn {
                            broker_address: broker_address.clone(),
                            local_stream: socket,
                        };
                        if tx.send(conn).await.is_err() {
                            debug!("supervisor gone, stopping accept loop");
                            return;
                        }
                    }
                    Err(e) => {
                        error!(broker = %broker_address, error = %e, "accept error");
                    }
                }
            }
            () = shutdown.cancelled() => {
                debug!(broker = %broker_address, "accept loop stopping");
                return;
            }
        }
    }
}
