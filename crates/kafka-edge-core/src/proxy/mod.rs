//! The per-connection proxy engine: correlation table, pumps, handler,
//! connection registry, and supervisor.

pub mod conn_set;
pub mod handler;
pub mod pending;
pub mod pumps;
pub mod supervisor;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::auth::{PasswordAuthenticator, TokenInfo, TokenProvider};
use crate::protocol::AddressMapper;

pub use conn_set::ConnSet;
pub use handler::ConnectionHandler;
pub use pending::{PendingRequest, PendingRequests};
pub use supervisor::Supervisor;

/// An accepted connection: the work item handed to the supervisor by the
/// listener layer.
pub struct Conn {
    /// Upstream broker this connection is destined for.
    pub broker_address: String,
    /// The accepted downstream socket.
    pub local_stream: TcpStream,
}

/// Immutable per-connection pump configuration.
pub struct ProcessorConfig {
    /// Correlation table capacity.
    pub max_open_requests: usize,
    /// Initial request read-buffer capacity.
    pub request_buffer_size: usize,
    /// Initial response read-buffer capacity.
    pub response_buffer_size: usize,
    /// Endpoint mapper for address-bearing responses; `None` disables
    /// rewriting.
    pub address_mapper: Option<AddressMapper>,
    /// Requests with these api_keys close the connection.
    pub forbidden_api_keys: HashSet<i16>,
}

/// The injected collaborator implementations.
///
/// Which of these must be present depends on the configuration: every
/// enabled auth feature requires its collaborator, checked at build time.
#[derive(Default)]
pub struct Collaborators {
    /// Verifies downstream SASL PLAIN credentials (`auth.local`).
    pub password_authenticator: Option<Arc<dyn PasswordAuthenticator>>,
    /// Issues tokens for upstream gateway auth (`auth.gateway.client`).
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Verifies downstream gateway tokens (`auth.gateway.server`).
    pub token_info: Option<Arc<dyn TokenInfo>>,
    /// Rewrites advertised broker endpoints; `None` disables rewriting.
    pub address_mapper: Option<AddressMapper>,
}
