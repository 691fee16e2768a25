//! Error types for the sync core.

use thiserror::Error;

use crate::jobs::JobId;

/// Classified kind of a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    /// The server could not be reached (DNS, routing, refused socket).
    Unreachable,
    /// The server rejected our credentials.
    AuthRejected,
    /// The server said something we could not make sense of.
    ProtocolViolation,
    /// The server is up but refused to serve us right now.
    ServerBusy,
    /// The attempt did not complete in time.
    Timeout,
}

impl ConnectErrorKind {
    /// Stable name used in logs and problem reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unreachable => "unresponsive-server",
            Self::AuthRejected => "bad-user-or-pass",
            Self::ProtocolViolation => "bad-security",
            Self::ServerBusy => "server-maintenance",
            Self::Timeout => "timeout",
        }
    }
}

/// A failed connection attempt, as classified by the protocol client.
///
/// `reachable` marks a reachability-class failure (network trouble, busy
/// server, timeout) where a later attempt may well succeed. `retry` is the
/// client's own opinion on whether retrying makes sense at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} ({message})", kind.name())]
pub struct ConnectError {
    /// Named kind of failure.
    pub kind: ConnectErrorKind,
    /// Reachability-class failure hint.
    pub reachable: bool,
    /// Whether an automatic retry is worthwhile.
    pub retry: bool,
    /// Whether the user has to act (e.g. fix a password).
    pub report_problem: bool,
    /// Human readable detail.
    pub message: String,
}

impl ConnectError {
    /// Creates an error with explicit hints.
    #[must_use]
    pub fn new(
        kind: ConnectErrorKind,
        reachable: bool,
        retry: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            reachable,
            retry,
            report_problem: false,
            message: message.into(),
        }
    }

    /// Server could not be reached; worth retrying.
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Unreachable, true, true, message)
    }

    /// Credentials were refused; retrying will not help until the user acts.
    #[must_use]
    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self {
            report_problem: true,
            ..Self::new(ConnectErrorKind::AuthRejected, false, false, message)
        }
    }

    /// The server violated the protocol during the handshake.
    #[must_use]
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::ProtocolViolation, false, false, message)
    }

    /// The server is temporarily refusing service.
    #[must_use]
    pub fn server_busy(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::ServerBusy, true, true, message)
    }

    /// The connect attempt timed out.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConnectErrorKind::Timeout, true, true, message)
    }
}

/// Kind of failure reported by the protocol client inside a leased exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolErrorKind {
    /// The folder the operation targets cannot be used right now.
    FolderUnavailable,
    /// One of the targeted messages no longer exists on the server.
    MessageNotFound,
    /// The connection dropped mid-exchange.
    ConnectionLost,
    /// The exchange timed out.
    Timeout,
    /// The server asked us to come back later.
    ServerBusy,
    /// The server replied with something unexpected.
    ProtocolViolation,
    /// Anything the client could not classify.
    Other(String),
}

/// A failure inside a protocol exchange (sync request or mutation).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct ProtocolError {
    /// Failure kind.
    pub kind: ProtocolErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl ProtocolError {
    /// Creates a protocol error.
    #[must_use]
    pub fn new(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors that can occur in sync core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Establishing the connection failed.
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    /// A protocol exchange failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The owning component has been shut down.
    #[error("Shut down")]
    Shutdown,

    /// A mutation job was given up on.
    #[error("Job {id} failed: {reason}")]
    JobFailed {
        /// The failed job.
        id: JobId,
        /// Last error seen by the job.
        reason: String,
    },

    /// Persistence write or read failed.
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true for shutdown-class errors.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
