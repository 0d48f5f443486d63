//! Error types for the driver.
//!
//! Errors are classified by *kind*, never by message text. Server FAILURE
//! codes have the shape `Neo.<Classification>.<Category>.<Title>` and are
//! mapped onto variants by [`DriverError::from_failure`]. The session layer
//! asks [`DriverError::is_retryable`] whether a managed transaction may be
//! replayed; the routing layer asks
//! [`DriverError::is_fatal_during_discovery`] whether trying the next router
//! is pointless.

use std::fmt;

use crate::address::Address;
use crate::types::{BoltDict, BoltValue};

/// Code and message reported by the server in a FAILURE response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Extracts `code` and `message` from FAILURE metadata.
    pub fn from_metadata(metadata: &BoltDict) -> Self {
        let text = |key: &str, default: &str| {
            metadata
                .get(key)
                .and_then(BoltValue::as_str)
                .unwrap_or(default)
                .to_string()
        };
        Self {
            code: text("code", "Neo.DatabaseError.General.UnknownError"),
            message: text("message", "an unknown error occurred"),
        }
    }

    /// The classification segment (`ClientError`, `TransientError`, ...).
    pub fn classification(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or("")
    }

    /// The category segment (`Security`, `Cluster`, `Statement`, ...).
    pub fn category(&self) -> &str {
        self.code.split('.').nth(2).unwrap_or("")
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Errors that can occur while talking to a graph database cluster.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Caller misuse: bad arguments, a closed session, a finished result.
    #[error("client error: {0}")]
    Client(String),

    /// The server rejected the request (syntax, constraint, missing database, ...).
    #[error("query error {0}")]
    Query(ServerError),

    /// Temporary server-side condition such as a deadlock.
    #[error("transient error {0}")]
    Transient(ServerError),

    /// The server hit an internal error.
    #[error("database error {0}")]
    Database(ServerError),

    /// Authentication or authorization failure.
    #[error("security error {0}")]
    Security(ServerError),

    /// A write was sent to a server that can no longer accept writes.
    #[error("not a leader {0}")]
    NotALeader(ServerError),

    /// The server could not be reached or the connection to it was lost.
    #[error("service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        address: Option<Address>,
    },

    /// The session's server role went away (e.g. no readers or writers left).
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Connection lost after COMMIT was sent but before it was acknowledged.
    #[error("commit outcome unknown: {0}")]
    IncompleteCommit(String),

    /// The server violated the protocol (unexpected message, bad state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake found no protocol version both sides speak.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// A message could not be decoded (truncated, inconsistent framing).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A caller-supplied deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

const TERMINATED: &str = "Neo.TransientError.Transaction.Terminated";
const LOCK_CLIENT_STOPPED: &str = "Neo.TransientError.Transaction.LockClientStopped";
const AUTHORIZATION_EXPIRED: &str = "Neo.ClientError.Security.AuthorizationExpired";

impl DriverError {
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: msg.into(),
            address: None,
        }
    }

    /// Tags a connectivity error with the address it happened on.
    pub fn unavailable_at(address: &Address, msg: impl fmt::Display) -> Self {
        Self::ServiceUnavailable {
            message: format!("{address}: {msg}"),
            address: Some(address.clone()),
        }
    }

    /// Classifies a server FAILURE by its code.
    pub fn from_failure(metadata: &BoltDict) -> Self {
        Self::from_server_error(ServerError::from_metadata(metadata))
    }

    pub fn from_server_error(err: ServerError) -> Self {
        match (err.classification(), err.category()) {
            _ if err.code == TERMINATED || err.code == LOCK_CLIENT_STOPPED => {
                // The client itself killed the transaction; replaying is wrong.
                Self::Query(err)
            }
            _ if err.code == "Neo.ClientError.Cluster.NotALeader"
                || err.code == "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase" =>
            {
                Self::NotALeader(err)
            }
            ("ClientError", "Security") => Self::Security(err),
            ("ClientError", _) => Self::Query(err),
            ("TransientError", _) => Self::Transient(err),
            _ => Self::Database(err),
        }
    }

    /// The server-reported code, if this error came from a FAILURE.
    pub fn code(&self) -> Option<&str> {
        self.server_error().map(|e| e.code.as_str())
    }

    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Query(e)
            | Self::Transient(e)
            | Self::Database(e)
            | Self::Security(e)
            | Self::NotALeader(e) => Some(e),
            _ => None,
        }
    }

    /// The server address a connectivity error is attributed to.
    pub fn address(&self) -> Option<&Address> {
        match self {
            Self::ServiceUnavailable { address, .. } => address.as_ref(),
            _ => None,
        }
    }

    /// The server revoked the credentials the connection authenticated with.
    pub fn is_authorization_expired(&self) -> bool {
        matches!(self, Self::Security(e) if e.code == AUTHORIZATION_EXPIRED)
    }

    /// Whether a managed transaction may be replayed after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_)
            | Self::NotALeader(_)
            | Self::ServiceUnavailable { .. }
            | Self::SessionExpired(_)
            | Self::Protocol(_)
            | Self::MalformedMessage(_) => true,
            Self::Security(_) => self.is_authorization_expired(),
            _ => false,
        }
    }

    /// Whether trying another router after this error is pointless.
    pub fn is_fatal_during_discovery(&self) -> bool {
        match self {
            Self::Query(e) => matches!(
                e.code.as_str(),
                "Neo.ClientError.Database.DatabaseNotFound"
                    | "Neo.ClientError.Transaction.InvalidBookmark"
                    | "Neo.ClientError.Transaction.InvalidBookmarkMixture"
                    | "Neo.ClientError.Statement.TypeError"
                    | "Neo.ClientError.Statement.ArgumentError"
                    | "Neo.ClientError.Request.Invalid"
            ),
            Self::Security(e) => e.code != AUTHORIZATION_EXPIRED,
            Self::UnsupportedProtocol(_) | Self::Configuration(_) => true,
            _ => false,
        }
    }

    /// Whether the connection that produced this error must be discarded.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. }
                | Self::IncompleteCommit(_)
                | Self::Protocol(_)
                | Self::UnsupportedProtocol(_)
                | Self::MalformedMessage(_)
                | Self::Io(_)
        )
    }

    /// Whether the routing table should forget the writer that produced this.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::NotALeader(_))
    }
}
