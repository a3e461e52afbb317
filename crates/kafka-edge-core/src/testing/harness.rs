//! Test harness wiring a mock broker, a built handler, and a running
//! supervisor together for integration tests.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::metrics::ProxyMetrics;
use crate::proxy::{Collaborators, Conn, ConnSet, ConnectionHandler, Supervisor};

use super::mock_broker::MockBroker;

/// A running proxy core in front of a mock broker.
pub struct ProxyTestHarness {
    /// The mock broker, for request assertions.
    pub broker: MockBroker,
    /// The mock broker's address.
    pub broker_address: String,
    /// The connection registry.
    pub conns: Arc<ConnSet>,
    /// The metrics sink.
    pub metrics: Arc<ProxyMetrics>,
    conn_tx: mpsc::Sender<Conn>,
    stop: CancellationToken,
}

impl ProxyTestHarness {
    /// Baseline YAML with a placeholder broker address the harness
    /// replaces with the mock broker's.
    #[must_use]
    pub fn default_config() -> ProxyConfig {
        let yaml = r#"
listeners:
  - listen_address: "127.0.0.1:0"
    broker_address: "placeholder:9092"
kafka:
  dial_timeout_ms: 2000
  read_timeout_ms: 2000
  write_timeout_ms: 2000
"#;
        ProxyConfig::from_yaml(yaml).expect("harness config must parse")
    }

    /// Start the mock broker and a supervisor built from `config` and
    /// `collaborators`. The first listener's broker address is pointed at
    /// the mock broker.
    ///
    /// # Panics
    ///
    /// Panics when the harness cannot be assembled; tests treat that as a
    /// failure.
    pub async fn start(mut config: ProxyConfig, collaborators: Collaborators) -> Self {
        Self::start_with_broker(MockBroker::new("127.0.0.1:0"), &mut config, collaborators).await
    }

    /// Like [`start`](Self::start), with a pre-configured mock broker.
    pub async fn start_with_broker(
        mut broker: MockBroker,
        config: &mut ProxyConfig,
        collaborators: Collaborators,
    ) -> Self {
        let broker_address = broker.start().await.expect("mock broker must start");
        config.listeners[0].broker_address = broker_address.clone();

        let conns = Arc::new(ConnSet::new());
        let metrics = Arc::new(ProxyMetrics::new());
        let handler = Arc::new(
            ConnectionHandler::from_config(
                config,
                collaborators,
                Arc::clone(&conns),
                Arc::clone(&metrics),
            )
            .expect("handler must build"),
        );

        let supervisor = Supervisor::new(handler, Arc::clone(&conns));
        let stop = supervisor.stop_handle();
        let (conn_tx, conn_rx) = mpsc::channel(16);
        tokio::spawn(async move { supervisor.run(conn_rx).await });

        Self {
            broker,
            broker_address,
            conns,
            metrics,
            conn_tx,
            stop,
        }
    }

    /// Open a client connection through the proxy: hands the server side
    /// of a fresh socket pair to the supervisor and returns the client
    /// side.
    pub async fn connect(&self) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        self.conn_tx
            .send(Conn {
                broker_address: self.broker_address.clone(),
                local_stream: server,
            })
            .await
            .expect("supervisor must be running");
        client
    }

    /// Stop the supervisor and the mock broker.
    pub fn shutdown(mut self) {
        self.stop.cancel();
        self.broker.stop();
    }
}
