//! Domain error types for the Kafka edge proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
///
/// All of these are fatal at startup; the proxy never starts with a
/// half-valid configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Invalid `host:port` address.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Forward proxy scheme must be `socks5` or `http`.
    #[error("unsupported forward proxy scheme: {0} (only 'socks5' and 'http' are supported)")]
    UnsupportedProxyScheme(String),

    /// Forward proxy URL could not be parsed.
    #[error("invalid forward proxy url: {0}")]
    InvalidProxyUrl(String),

    /// No listener mappings were configured.
    #[error("no listeners configured")]
    NoListeners,

    /// SASL is enabled but credentials are incomplete.
    #[error("kafka.sasl.enable is set but {0} is empty")]
    MissingSaslCredential(&'static str),

    /// TLS client certificate and key must be configured together.
    #[error("kafka.tls: cert_path and key_path must both be set for mTLS")]
    IncompleteClientCert,

    /// `max_open_requests` bounds the correlation table and must be positive.
    #[error("kafka.max_open_requests must be at least 1")]
    ZeroOpenRequests,

    /// An auth feature is enabled but its collaborator was not injected.
    #[error("{feature} is enabled but no {collaborator} was provided")]
    MissingCollaborator {
        feature: &'static str,
        collaborator: &'static str,
    },
}

/// Errors raised by the SASL and gateway authentication exchanges.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Broker or client requested a mechanism we do not offer.
    #[error("unsupported SASL mechanism: {0}")]
    UnsupportedMechanism(String),

    /// Username/password rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Broker rejected the upstream SASL exchange.
    #[error("SASL authentication failed (error code {error_code}): {message}")]
    SaslFailed { error_code: i16, message: String },

    /// Gateway frame carried the wrong magic number.
    #[error("gateway auth magic mismatch: expected {expected:#x}, got {actual:#x}")]
    MagicMismatch { expected: u64, actual: u64 },

    /// Gateway frame carried an unexpected auth method.
    #[error("gateway auth method mismatch: expected {expected:?}, got {actual:?}")]
    MethodMismatch { expected: String, actual: String },

    /// Peer replied with a non-zero gateway status.
    #[error("gateway auth rejected (status {status}): {message}")]
    GatewayRejected { status: u32, message: String },

    /// The injected collaborator returned an error.
    #[error("{collaborator} error: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// The collaborator did not answer within its configured timeout.
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// Errors related to TLS configuration and handshakes.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Invalid TLS configuration.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// TLS handshake with the broker failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Failed to load a certificate file.
    #[error("failed to load certificate '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Failed to load a private key file.
    #[error("failed to load private key '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// Certificate file contained no certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// Key file contained no private keys.
    #[error("no private keys found in '{0}'")]
    NoPrivateKeys(String),
}

/// Errors that occur while proxying a connection.
///
/// All of these are per-connection: they close the affected connection and
/// never touch any other.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO error on either side of the proxy.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Upstream broker could not be reached.
    #[error("dial {address} failed: {message}")]
    Dial { address: String, message: String },

    /// The forward proxy refused or mangled the tunnel.
    #[error("forward proxy error: {0}")]
    ForwardProxy(String),

    /// TLS failure on the upstream connection.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// SASL or gateway authentication failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Malformed Kafka frame.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to re-encode a rewritten response.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// Response arrived for a correlation id we never forwarded.
    #[error("response for unknown correlation id {0}")]
    UnknownCorrelation(i32),

    /// Client reused a correlation id that is still in flight.
    #[error("duplicate in-flight correlation id {0}")]
    DuplicateCorrelation(i32),

    /// Request used an administratively forbidden api_key.
    #[error("api key {0} is forbidden")]
    ForbiddenApiKey(i16),

    /// Invalid startup wiring.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Supervisor is shutting down.
    #[error("proxy shutting down")]
    Shutdown,
}

impl ProxyError {
    /// Whether this error is an ordinary end-of-stream that should close
    /// quietly rather than be logged as a failure.
    #[must_use]
    pub fn is_quiet_close(&self) -> bool {
        match self {
            Self::Connection(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            Self::Shutdown => true,
            _ => false,
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
