//! Error types for the broker, the wire codec and peer clients.
//!
//! Protocol and domain errors are turned into Error responses at the
//! connection boundary; only startup failures and peer handshake failures
//! propagate out of a run loop.

use thiserror::Error;

use crate::net::messages::MessageKind;

/// Errors raised while classifying or validating a wire message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Payload is not a JSON object at all
    #[error("Message is not a JSON object")]
    Malformed,

    /// Frame bytes are not valid UTF-8
    #[error("Message is not valid UTF-8")]
    InvalidUtf8,

    /// Frame exceeds the maximum line length and was discarded
    #[error("Message exceeds {max} bytes")]
    TooLong { max: usize },

    /// Well-formed JSON object that matches none of the message kinds
    #[error("Message doesn't match the protocol")]
    Unclassifiable,

    /// A required field is absent
    #[error("{kind} doesn't match the protocol. Missing field: '{field}'")]
    MissingField {
        kind: MessageKind,
        field: &'static str,
        id: Option<u64>,
    },

    /// A required field is present but empty, null or of the wrong type
    #[error("Required {kind} field '{field}' is not set")]
    EmptyField {
        kind: MessageKind,
        field: &'static str,
        id: Option<u64>,
    },

    /// The message-id could not be coerced to a non-negative integer
    #[error("Invalid {kind} message-id: {value}")]
    InvalidId { kind: MessageKind, value: String },

    /// Response status is neither ok nor error
    #[error("Invalid response status: {value}")]
    InvalidStatus { value: String, id: Option<u64> },
}

impl MessageError {
    /// Message id recovered before validation failed, if any
    pub fn message_id(&self) -> Option<u64> {
        match self {
            MessageError::MissingField { id, .. }
            | MessageError::EmptyField { id, .. }
            | MessageError::InvalidStatus { id, .. } => *id,
            MessageError::Malformed
            | MessageError::InvalidUtf8
            | MessageError::TooLong { .. }
            | MessageError::Unclassifiable
            | MessageError::InvalidId { .. } => None,
        }
    }
}

/// Domain errors of registry operations, reported to clients as Error text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    AlreadyRegistered(String),

    #[error("Unregister {current} first to register {requested}")]
    RegistrationHeld { current: String, requested: String },

    #[error("You have not {0} registered")]
    NotRegistered(String),

    #[error("Can't subscribe {0}. It doesn't exist")]
    UnknownApplication(String),

    #[error("{0} is already subscribed")]
    AlreadySubscribed(String),

    #[error("{0} is not subscribed")]
    NotSubscribed(String),
}

/// Why a request could not be forwarded to its target application
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error("{0} is not subscribed")]
    NotSubscribed(String),

    /// Owner of the application went away before the request was delivered
    #[error("{0} is not available")]
    Unavailable(String),
}

/// Failure of a request awaiting its correlated response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Request timed out (message-id: {id})")]
    Timeout { id: u64 },

    /// The pending entry was dropped without a response, e.g. on shutdown
    #[error("Request cancelled (message-id: {id})")]
    Cancelled { id: u64 },
}

/// Errors building TLS configuration from PEM files
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Can't read {path}: {source}")]
    Pem {
        path: String,
        source: rustls::pki_types::pem::Error,
    },

    #[error("No certificate found in {0}")]
    NoCertificate(String),

    #[error("Invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("Invalid server name: {0}")]
    ServerName(String),
}

/// Errors surfaced by a peer client
#[derive(Error, Debug)]
pub enum PeerError {
    /// No response within the request timeout
    #[error("Request timed out (message-id: {id})")]
    Timeout { id: u64 },

    /// The response arrived with status error
    #[error("Request failed (message-id: {id:?}): {error}")]
    Status { id: Option<u64>, error: String },

    /// Pending request was abandoned before a response arrived
    #[error("Request cancelled (message-id: {id})")]
    Cancelled { id: u64 },

    /// Registration rejected during the handshake
    #[error("Registration failed: {0}")]
    Register(String),

    /// Subscriptions could not be established during the handshake
    #[error("Subscription failed: {0}")]
    Subscribe(String),

    #[error("Maximum of {0} reconnect tries reached")]
    ReconnectExhausted(u32),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),
}

impl From<CorrelationError> for PeerError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Timeout { id } => PeerError::Timeout { id },
            CorrelationError::Cancelled { id } => PeerError::Cancelled { id },
        }
    }
}

/// Errors of the single-instance PID file guard
#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("{name} is already running: PID {pid}")]
    AlreadyRunning { name: String, pid: i32 },

    #[error("{name} isn't running")]
    NotRunning { name: String },

    #[error("Invalid PID file {path}")]
    Invalid { path: String },

    #[error("PID file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}
