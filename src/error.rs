//! Error taxonomy for the Cogwyrm MQTT core
//!
//! Connection problems, operations attempted outside a live session, input
//! validation failures and broker-rejected wire operations are kept apart so
//! callers can tell "retry later" from "fix your input".

use crate::config::ConfigError;
use crate::session::ConnectionState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Why a connection attempt failed or was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Broker refused the CONNECT for a reason other than credentials
    Refused,
    /// No CONNACK within the connection timeout
    Timeout,
    /// Bad username/password or not authorized
    AuthFailed,
    /// TLS handshake or certificate failure
    Tls,
    /// Host name did not resolve
    UnknownHost,
    /// Network unreachable, connection reset, or any other I/O failure
    Unreachable,
    /// Disconnect was requested while the attempt was in flight
    Cancelled,
    /// Another connect or reconnect is already running for this session
    InProgress,
    /// Reconnect gave up after the configured number of attempts
    RetriesExhausted,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionFailure::Refused => "connection refused",
            ConnectionFailure::Timeout => "connection timed out",
            ConnectionFailure::AuthFailed => "authentication failed",
            ConnectionFailure::Tls => "TLS handshake failed",
            ConnectionFailure::UnknownHost => "unknown host",
            ConnectionFailure::Unreachable => "host unreachable",
            ConnectionFailure::Cancelled => "connect cancelled",
            ConnectionFailure::InProgress => "connect already in progress",
            ConnectionFailure::RetriesExhausted => "reconnect attempts exhausted",
        };
        f.write_str(label)
    }
}

/// Which wire operation a broker rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOperation {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for WireOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireOperation::Publish => f.write_str("publish"),
            WireOperation::Subscribe => f.write_str("subscribe"),
            WireOperation::Unsubscribe => f.write_str("unsubscribe"),
        }
    }
}

/// Main error type for session, registry and transport operations
#[derive(Debug, Error)]
pub enum CogwyrmError {
    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionFailure,
        message: String,
    },

    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{operation} failed on '{topic}': {message}")]
    WireOperation {
        operation: WireOperation,
        topic: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CogwyrmError {
    /// Create a connection error; the message is sanitized before storage
    pub fn connection<S: AsRef<str>>(kind: ConnectionFailure, message: S) -> Self {
        Self::Connection {
            kind,
            message: sanitize_error_message(message.as_ref()),
        }
    }

    /// Create a not-connected error for the given state
    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a wire operation error; the broker text is sanitized
    pub fn wire<T: Into<String>, S: AsRef<str>>(
        operation: WireOperation,
        topic: T,
        message: S,
    ) -> Self {
        Self::WireOperation {
            operation,
            topic: topic.into(),
            message: sanitize_error_message(message.as_ref()),
        }
    }

    /// Stable category label, suitable for logs and for surfacing to a UI
    pub fn category(&self) -> &'static str {
        match self {
            CogwyrmError::Connection { .. } => "connection",
            CogwyrmError::NotConnected { .. } => "not_connected",
            CogwyrmError::Validation { .. } => "validation",
            CogwyrmError::WireOperation { .. } => "wire_operation",
            CogwyrmError::Config(_) => "configuration",
        }
    }

    /// Whether trying the same thing again later could succeed without new input
    pub fn is_retryable(&self) -> bool {
        match self {
            CogwyrmError::Connection { kind, .. } => !matches!(
                kind,
                ConnectionFailure::Cancelled
                    | ConnectionFailure::RetriesExhausted
                    | ConnectionFailure::AuthFailed
            ),
            CogwyrmError::WireOperation { .. } => true,
            CogwyrmError::NotConnected { .. }
            | CogwyrmError::Validation { .. }
            | CogwyrmError::Config(_) => false,
        }
    }

    /// The connection failure kind, if this is a connection error
    pub fn connection_failure(&self) -> Option<ConnectionFailure> {
        match self {
            CogwyrmError::Connection { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+").ok());

static URL_CREDENTIALS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(mqtts?|tcp|ssl|wss?)://[^/\s:@]+:[^/\s@]+@").ok());

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Strip credentials from broker and library error text and cap its length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").into_owned();
    }

    if let Some(re) = URL_CREDENTIALS.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}://***@").into_owned();
    }

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for Cogwyrm operations
pub type Result<T> = std::result::Result<T, CogwyrmError>;
