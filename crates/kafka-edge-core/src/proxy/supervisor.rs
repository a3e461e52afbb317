//! Supervisor: accepts work items from the listener channel and owns
//! graceful shutdown.
//!
//! Each item gets its own handler task wrapped in `catch_unwind`, so a
//! panicking handler takes down one connection, never the supervisor. The
//! accept channel closing is itself a shutdown signal; an explicit stop
//! cancels the token, after which the channel is drained and every
//! registered connection is closed in one batch.

use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;

use super::{Conn, ConnSet, ConnectionHandler};

/// Accepts connections and supervises their handler tasks.
pub struct Supervisor {
    handler: Arc<ConnectionHandler>,
    conns: Arc<ConnSet>,
    stop: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor around a built handler.
    #[must_use]
    pub fn new(handler: Arc<ConnectionHandler>, conns: Arc<ConnSet>) -> Self {
        Self {
            handler,
            conns,
            stop: CancellationToken::new(),
        }
    }

    /// Handle for requesting shutdown.
    #[must_use]
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run until the accept channel closes or stop is requested, then
    /// close every live connection.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for startup
    /// failures of future resources.
    pub async fn run(&self, mut source: mpsc::Receiver<Conn>) -> Result<()> {
        loop {
            tokio::select! {
                maybe_conn = source.recv() => {
                    match maybe_conn {
                        Some(conn) => self.spawn_handler(conn),
                        None => {
                            info!("accept channel closed");
                            break;
                        }
                    }
                }
                () = self.stop.cancelled() => {
                    info!("stop requested");
                    break;
                }
            }
        }

        // Refuse further work and drain what was already queued; dropping
        // a queued Conn closes its socket.
        source.close();
        while source.recv().await.is_some() {}

        info!("closing connections");
        let closed = self.conns.close_all();
        info!(closed, "proxy is stopped");
        Ok(())
    }

    fn spawn_handler(&self, conn: Conn) {
        let handler = Arc::clone(&self.handler);
        let broker = conn.broker_address.clone();

        tokio::spawn(async move {
            // Panic isolation: one malformed connection must not tear
            // down the supervisor.
            let outcome = std::panic::AssertUnwindSafe(handler.handle(conn))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                error!(
                    broker = %broker,
                    panic = panic_message(&panic),
                    "connection handler panicked"
                );
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
