//! Authentication layers and the collaborator contracts they depend on.
//!
//! The proxy never verifies credentials or issues tokens itself; those
//! decisions live behind the injected traits below (implemented by plugin
//! processes in a full deployment, by inline closures in tests). Timeouts
//! are enforced by the proxy around each collaborator call, not by the
//! implementations.

pub mod gateway;
pub mod local_sasl;
pub mod sasl_client;

use async_trait::async_trait;

pub use gateway::{GatewayAuthClient, GatewayAuthServer};
pub use local_sasl::LocalSaslServer;
pub use sasl_client::SaslPlainClient;

/// Error type collaborators may fail with.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync>;

/// Verifies downstream SASL PLAIN credentials.
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    /// Returns `Ok(true)` when the credentials are valid, `Ok(false)` when
    /// they are denied, and `Err` on verifier failure.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<bool, CollaboratorError>;
}

/// Issues tokens for the upstream gateway handshake.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a token for the configured auth method.
    async fn get_token(&self, method: &str) -> std::result::Result<String, CollaboratorError>;
}

/// Validates tokens presented by downstream gateway clients.
#[async_trait]
pub trait TokenInfo: Send + Sync {
    /// Returns `Ok(true)` when the token is valid, `Ok(false)` when it is
    /// denied, and `Err` on verifier failure.
    async fn verify_token(
        &self,
        method: &str,
        token: &str,
    ) -> std::result::Result<bool, CollaboratorError>;
}
