//! TLS support for upstream broker connections.

mod client;

pub use client::TlsConnector;
