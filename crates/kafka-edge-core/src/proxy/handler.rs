//! Per-connection handler.
//!
//! Owns one accepted connection from dequeue until both pumps have
//! finished: dials upstream through the configured chain, runs the enabled
//! handshakes in order, registers the connection, and drives the pumps
//! until either side finishes or the supervisor cancels.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::auth::{GatewayAuthClient, GatewayAuthServer, LocalSaslServer, SaslPlainClient};
use crate::config::ProxyConfig;
use crate::dialer::{Dialer, TcpConnOptions};
use crate::error::{ConfigError, ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::network::UpstreamStream;

use super::pending::PendingRequests;
use super::pumps::{run_request_pump, run_response_pump};
use super::{Collaborators, Conn, ConnSet, ProcessorConfig};

/// Handles a single accepted connection end to end.
pub struct ConnectionHandler {
    dialer: Dialer,
    tcp_options: TcpConnOptions,
    processor: Arc<ProcessorConfig>,
    gateway_client: Option<GatewayAuthClient>,
    sasl_client: Option<SaslPlainClient>,
    gateway_server: Option<GatewayAuthServer>,
    local_sasl: Option<LocalSaslServer>,
    conns: Arc<ConnSet>,
    metrics: Arc<ProxyMetrics>,
}

impl ConnectionHandler {
    /// Build the handler from configuration and injected collaborators.
    ///
    /// # Errors
    ///
    /// Returns a config error when an enabled auth feature is missing its
    /// collaborator, the forward-proxy scheme is unsupported, or the TLS
    /// configuration cannot be loaded.
    pub fn from_config(
        config: &ProxyConfig,
        collaborators: Collaborators,
        conns: Arc<ConnSet>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        let dialer = Dialer::from_config(&config.kafka, config.forward_proxy.as_ref())?;
        let tcp_options = TcpConnOptions::from_config(&config.kafka);

        if !config.kafka.forbidden_api_keys.is_empty() {
            warn!(
                api_keys = ?config.kafka.forbidden_api_keys,
                "kafka operations for these api keys will be forbidden"
            );
        }

        let local_sasl = if config.auth.local.enable {
            let authenticator = collaborators.password_authenticator.ok_or(
                ConfigError::MissingCollaborator {
                    feature: "auth.local",
                    collaborator: "PasswordAuthenticator",
                },
            )?;
            Some(LocalSaslServer::new(
                authenticator,
                config.auth.local.timeout(),
                config.kafka.read_timeout(),
                config.kafka.write_timeout(),
            ))
        } else {
            None
        };

        let gateway_client = if config.auth.gateway.client.enable {
            let token_provider =
                collaborators
                    .token_provider
                    .ok_or(ConfigError::MissingCollaborator {
                        feature: "auth.gateway.client",
                        collaborator: "TokenProvider",
                    })?;
            Some(GatewayAuthClient {
                magic: config.auth.gateway.client.magic,
                method: config.auth.gateway.client.method.clone(),
                timeout: config.auth.gateway.client.timeout(),
                token_provider,
            })
        } else {
            None
        };

        let gateway_server = if config.auth.gateway.server.enable {
            let token_info = collaborators
                .token_info
                .ok_or(ConfigError::MissingCollaborator {
                    feature: "auth.gateway.server",
                    collaborator: "TokenInfo",
                })?;
            Some(GatewayAuthServer {
                magic: config.auth.gateway.server.magic,
                method: config.auth.gateway.server.method.clone(),
                timeout: config.auth.gateway.server.timeout(),
                token_info,
            })
        } else {
            None
        };

        let sasl_client = if config.kafka.sasl.enable {
            Some(SaslPlainClient {
                client_id: config.kafka.client_id.clone(),
                username: config.kafka.sasl.username(),
                password: config.kafka.sasl.password(),
                read_timeout: config.kafka.read_timeout(),
                write_timeout: config.kafka.write_timeout(),
            })
        } else {
            None
        };

        let processor = Arc::new(ProcessorConfig {
            max_open_requests: config.kafka.max_open_requests,
            request_buffer_size: config.proxy.request_buffer_size,
            response_buffer_size: config.proxy.response_buffer_size,
            address_mapper: collaborators.address_mapper,
            forbidden_api_keys: config.kafka.forbidden_api_keys.iter().copied().collect(),
        });

        Ok(Self {
            dialer,
            tcp_options,
            processor,
            gateway_client,
            sasl_client,
            gateway_server,
            local_sasl,
            conns,
            metrics,
        })
    }

    /// Proxy one connection to completion. Never panics outward; all
    /// failures are logged here.
    #[instrument(skip(self, conn), fields(broker = %conn.broker_address))]
    pub async fn handle(&self, conn: Conn) {
        let broker = conn.broker_address.clone();
        self.metrics.record_connection(&broker);

        match self.proxy_connection(&broker, conn.local_stream).await {
            Ok(()) => debug!("connection finished"),
            Err(e) if e.is_quiet_close() => debug!("connection closed"),
            Err(e) => {
                self.metrics.record_connection_error(error_kind(&e));
                info!(error = %e, "connection error");
            }
        }
        self.metrics.record_disconnect();
    }

    async fn proxy_connection(&self, broker: &str, downstream: TcpStream) -> Result<()> {
        // Upstream: dial, then the broker-side handshakes.
        let upstream = self.dial_and_auth(broker).await?;

        // Apply TCP options where the raw socket is reachable; behind TLS
        // it is not, which is tolerated with a warning.
        if !self.tcp_options.is_noop() {
            match upstream.tcp_stream() {
                Some(tcp) => {
                    if let Err(e) = self.tcp_options.apply(tcp) {
                        warn!(error = %e, "failed to set TCP options on upstream connection");
                    }
                }
                None => {
                    warn!("upstream stream is wrapped, skipping TCP options");
                }
            }
        }

        // Downstream handshakes gate the pumps.
        let mut downstream = downstream;
        if let Some(gateway_server) = &self.gateway_server {
            gateway_server
                .authenticate(&mut downstream)
                .await
                .inspect_err(|_| self.metrics.record_auth_failure("gateway_server"))?;
        }
        if let Some(local_sasl) = &self.local_sasl {
            let username = local_sasl
                .authenticate(&mut downstream)
                .await
                .inspect_err(|_| self.metrics.record_auth_failure("local_sasl"))?;
            debug!(username = %username, "downstream client authenticated");
        }

        let token = CancellationToken::new();
        let conn_id = self.conns.add(broker, token.clone());

        let result = self.run_pumps(downstream, upstream, &token).await;

        if !self.conns.remove(broker, conn_id) {
            warn!(conn_id, "connection was not in the registry");
        }
        result
    }

    async fn dial_and_auth(&self, broker: &str) -> Result<UpstreamStream> {
        let mut upstream = self.dialer.dial(broker).await?;

        if let Some(gateway_client) = &self.gateway_client {
            gateway_client
                .authenticate(&mut upstream)
                .await
                .inspect_err(|_| self.metrics.record_auth_failure("gateway_client"))?;
        }
        if let Some(sasl_client) = &self.sasl_client {
            sasl_client
                .authenticate(&mut upstream)
                .await
                .inspect_err(|_| self.metrics.record_auth_failure("sasl_client"))?;
        }
        Ok(upstream)
    }

    async fn run_pumps(
        &self,
        downstream: TcpStream,
        upstream: UpstreamStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pending = Arc::new(PendingRequests::new(self.processor.max_open_requests));
        let (down_read, down_write) = tokio::io::split(downstream);
        let (up_read, up_write) = tokio::io::split(upstream);

        let request_pump = run_request_pump(
            down_read,
            up_write,
            Arc::clone(&pending),
            Arc::clone(&self.processor),
            Arc::clone(&self.metrics),
        );
        let response_pump = run_response_pump(
            up_read,
            down_write,
            Arc::clone(&pending),
            Arc::clone(&self.processor),
            Arc::clone(&self.metrics),
        );

        // Whichever pump finishes first wins; dropping the other closes
        // both streams, which is exactly the teardown we want.
        tokio::select! {
            result = request_pump => result,
            result = response_pump => result,
            () = cancel.cancelled() => Err(ProxyError::Shutdown),
        }
    }
}

/// Stable label for error metrics.
fn error_kind(e: &ProxyError) -> &'static str {
    match e {
        ProxyError::Connection(_) => "io",
        ProxyError::Dial { .. } => "dial",
        ProxyError::ForwardProxy(_) => "forward_proxy",
        ProxyError::Tls(_) => "tls",
        ProxyError::Auth(_) => "auth",
        ProxyError::ProtocolDecode { .. }
        | ProxyError::ProtocolEncode { .. }
        | ProxyError::UnknownCorrelation(_)
        | ProxyError::DuplicateCorrelation(_) => "protocol",
        ProxyError::ForbiddenApiKey(_) => "forbidden_api_key",
        ProxyError::Config(_) => "config",
        ProxyError::Shutdown => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn test_config(yaml_auth: &str) -> ProxyConfig {
        let yaml = format!(
            r#"
listeners:
  - listen_address: "127.0.0.1:0"
    broker_address: "127.0.0.1:9092"
kafka: {{}}
{yaml_auth}
"#
        );
        ProxyConfig::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_build_plain_config() {
        let config = test_config("");
        let handler = ConnectionHandler::from_config(
            &config,
            Collaborators::default(),
            Arc::new(ConnSet::new()),
            Arc::new(ProxyMetrics::new()),
        );
        assert!(handler.is_ok());
    }

    #[test]
    fn test_local_sasl_requires_authenticator() {
        let config = test_config("auth:\n  local:\n    enable: true\n");
        let result = ConnectionHandler::from_config(
            &config,
            Collaborators::default(),
            Arc::new(ConnSet::new()),
            Arc::new(ProxyMetrics::new()),
        );
        assert!(matches!(
            result,
            Err(ProxyError::Config(ConfigError::MissingCollaborator {
                feature: "auth.local",
                ..
            }))
        ));
    }

    #[test]
    fn test_gateway_client_requires_provider() {
        let config = test_config("auth:\n  gateway:\n    client:\n      enable: true\n");
        let result = ConnectionHandler::from_config(
            &config,
            Collaborators::default(),
            Arc::new(ConnSet::new()),
            Arc::new(ProxyMetrics::new()),
        );
        assert!(matches!(
            result,
            Err(ProxyError::Config(ConfigError::MissingCollaborator {
                feature: "auth.gateway.client",
                ..
            }))
        ));
    }

    #[test]
    fn test_gateway_server_requires_token_info() {
        let config = test_config("auth:\n  gateway:\n    server:\n      enable: true\n");
        let result = ConnectionHandler::from_config(
            &config,
            Collaborators::default(),
            Arc::new(ConnSet::new()),
            Arc::new(ProxyMetrics::new()),
        );
        assert!(matches!(
            result,
            Err(ProxyError::Config(ConfigError::MissingCollaborator {
                feature: "auth.gateway.server",
                ..
            }))
        ));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(error_kind(&ProxyError::ForbiddenApiKey(0)), "forbidden_api_key");
        assert_eq!(error_kind(&ProxyError::UnknownCorrelation(1)), "protocol");
        assert_eq!(error_kind(&ProxyError::Shutdown), "shutdown");
    }
}
