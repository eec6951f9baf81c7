use crate::connection::{ConnectionId, ConnectionState};
use thiserror::Error;

/// The error type for duplexnet operations.
///
/// Errors returned from the public API are synchronous: a failed call has no
/// partial side effects. Failures inside the duplex engine threads are never
/// returned here. They move the connection to
/// [`ConnectionState::Error`](crate::ConnectionState::Error) instead, which the
/// owner observes through [`Connection::state`](crate::Connection::state).
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Addressing Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The resolver rejected the host/port pair.
    #[error("Could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    /// The resolver returned no address of the requested family.
    #[error("No {family} address found for {host}:{port}")]
    NoAddress {
        host: String,
        port: u16,
        family: String,
    },

    /// Every candidate address failed to connect or bind.
    #[error("No address succeeded for {host}:{port}")]
    NoAddressSucceeded { host: String, port: u16 },

    // ============================================================================
    // Connection and Engine Errors
    // ============================================================================
    /// The connection has already been closed.
    #[error("Connection {id} is closed")]
    ConnectionClosed { id: ConnectionId },

    /// The connection no longer accepts new work.
    #[error("Connection {id} is in state {state}")]
    NotRunning {
        id: ConnectionId,
        state: ConnectionState,
    },

    /// The outbound queue reached its configured capacity.
    #[error("Send queue of connection {id} is full ({limit} messages)")]
    QueueFull { id: ConnectionId, limit: usize },

    /// The duplex engine of this connection is already running.
    #[error("Engine of connection {id} is already started")]
    EngineAlreadyStarted { id: ConnectionId },

    /// The duplex engine of this connection is not running.
    #[error("Engine of connection {id} is not started")]
    EngineNotStarted { id: ConnectionId },

    // ============================================================================
    // Pool Errors
    // ============================================================================
    /// The connection is already registered in this pool.
    #[error("Connection {id} is already in the pool")]
    AlreadyInPool { id: ConnectionId },

    /// The connection is not registered in this pool.
    #[error("Connection {id} is not in the pool")]
    NotInPool { id: ConnectionId },

    // ============================================================================
    // Protocol Errors
    // ============================================================================
    /// Zero-length messages cannot be queued.
    #[error("Empty messages are not supported")]
    EmptyMessage,

    /// A message exceeds the 32-bit length field or the configured maximum.
    #[error("Message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    // ============================================================================
    // TLS Errors
    // ============================================================================
    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// TLS handshake failed during connection establishment.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Accepting TLS connections requires a certificate and key.
    #[error("TLS server configuration not provided - required for accept()")]
    TlsServerConfigMissing,

    /// Connecting with TLS requires trusted roots.
    #[error("TLS client configuration not provided - required for connect()")]
    TlsClientConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    /// Failed to build TLS client configuration from provided settings.
    #[error("Failed to build TLS client config: {0}")]
    TlsClientConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for the `ip_family` configuration key.
    #[error("Invalid IP family '{got}', expected one of: {}", .valid.join(", "))]
    InvalidIpFamily { got: String, valid: Vec<String> },
}

// ============================================================================
// Transport Errors
// ============================================================================

/// Outcome of a failed transfer on the transport strategy.
///
/// `PeerClosed` is the normal end of a connection and is not logged as an
/// error. The other variants are fatal to the engine thread that hit them.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed or reset the connection.
    #[error("Peer closed the connection")]
    PeerClosed,

    /// Socket-level failure.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS record or alert failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The peer announced a payload larger than we accept.
    #[error("Frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// A received message found the inbound queue at capacity.
    #[error("Inbound queue is full ({limit} messages)")]
    InboundQueueFull { limit: usize },
}

impl TransportError {
    /// Returns true for disconnect-class outcomes.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::PeerClosed)
    }
}
