//! Kafka Edge Proxy Core Library
//!
//! A transparent TCP-level proxy between Kafka clients and Kafka brokers.
//! Clients connect to the proxy as if it were a broker; the proxy opens a
//! matching upstream connection, performs the configured authentication
//! handshakes, and shuttles frames in both directions while rewriting the
//! broker addresses advertised in metadata-bearing responses.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`dialer`] - Composable upstream dialer chain (direct, SOCKS5,
//!   HTTP CONNECT, TLS)
//! - [`network`] - Frame codecs, stream abstraction, and TCP listeners
//! - [`protocol`] - Kafka schema knowledge and the address rewrite filter
//! - [`auth`] - SASL PLAIN (both directions) and the gateway token
//!   handshake, plus the injected collaborator traits
//! - [`proxy`] - Correlation table, pumps, per-connection handler,
//!   connection registry, supervisor
//! - [`metrics`] - Prometheus metrics collection
//! - [`tls`] - TLS client support for broker connections
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_edge_core::config::ProxyConfig;
//!
//! // Load configuration
//! let config = ProxyConfig::from_file("config.yaml")?;
//!
//! // Build the handler and supervisor, wire in the listener channel
//! // ...
//! ```

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod dialer;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the
/// `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::ProxyConfig;
pub use error::{AuthError, ConfigError, ProxyError, Result, TlsError};
pub use metrics::ProxyMetrics;
pub use protocol::AddressMapper;
pub use proxy::{Collaborators, Conn, ConnSet, ConnectionHandler, Supervisor};
pub use tls::TlsConnector;
